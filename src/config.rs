/// Global configuration, loaded via the `config` crate from `config.toml`
/// plus environment overrides.
pub use config::Config;
pub use once_cell::sync::OnceCell;

use serde::Deserialize;
use std::error::Error;

static GLOBAL_CONFIG: OnceCell<Settings> = OnceCell::new();

/// Coin/network parameters the core needs but does not hardcode.
#[derive(Debug, Clone, Deserialize)]
pub struct CoinConfig {
    pub name: String,
    pub network: String,
    /// Genesis block hash, hex-encoded, natural byte order.
    pub genesis_hash: String,
    /// Fixed size in bytes of this coin's block header.
    pub header_size: usize,
    /// Height beyond which `tx_per_block` is used for the catch-up ETA estimate.
    pub tx_count_height: i32,
    /// Average transactions per block used for the catch-up ETA estimate.
    pub tx_per_block: u32,
    /// Known transaction count at `tx_count_height`, for the ETA estimate.
    pub tx_count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    pub url: String,
    pub user: String,
    pub password: String,
}

/// Top-level settings for the indexer core.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Soft cap, in MB, on the UTXO cache before a flush is triggered.
    pub utxo_mb: u64,
    /// Soft cap, in MB, on the in-memory history cache before a flush is triggered.
    pub hist_mb: u64,
    /// How many blocks of undo records to retain for reorg handling.
    pub reorg_limit: i32,
    pub data_dir: String,
    pub coin: CoinConfig,
    pub rpc: RpcConfig,
}

/// Load settings for standalone use (tests, one-off binaries).
pub fn load_config() -> Result<Settings, Box<dyn Error>> {
    let raw = Config::builder()
        .add_source(config::File::with_name("config.toml"))
        .add_source(config::Environment::with_prefix("CHAINDEX").separator("__"))
        .build()?;
    raw.try_deserialize::<Settings>()
        .map_err(|e| Box::new(e) as Box<dyn Error>)
}

/// Initialize the process-wide configuration. Must be called once, early in
/// `main`, before any call to [`get_global_config`].
pub fn init_global_config() -> Result<(), Box<dyn Error>> {
    let settings = load_config()?;
    GLOBAL_CONFIG
        .set(settings)
        .map_err(|_| "config already initialized")?;
    Ok(())
}

/// Fetch the process-wide configuration. Exits the process with a clear
/// message if called before [`init_global_config`] — this mirrors a
/// programmer error, not a recoverable condition.
pub fn get_global_config() -> &'static Settings {
    GLOBAL_CONFIG.get().unwrap_or_else(|| {
        eprintln!("FATAL: config not initialized - call init_global_config() first");
        std::process::exit(1);
    })
}
