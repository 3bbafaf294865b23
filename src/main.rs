use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};

use chainindex::config::{get_global_config, init_global_config};
use chainindex::decode::LegacyBlockDecoder;
use chainindex::fs_cache::FsCache;
use chainindex::kv::rocks::RocksStore;
use chainindex::node::{JsonRpcNode, NodeClient};
use chainindex::prefetcher::Prefetcher;
use chainindex::processor::{AdvanceOutcome, BlockProcessor};
use chainindex::telemetry::{init_tracing, TelemetryConfig};

fn parse_genesis_hash(hex_str: &str) -> [u8; 32] {
    let bytes = hex::decode(hex_str).expect("coin.genesis_hash must be valid hex");
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    hash
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(TelemetryConfig::default())?;
    init_global_config()?;
    let config = get_global_config();

    let data_dir = PathBuf::from(&config.data_dir);
    let store = RocksStore::open(data_dir.join("db"))?;
    let fs_cache = FsCache::open(data_dir.join("fs"), config.coin.header_size)?;
    let decoder = LegacyBlockDecoder::new(config.coin.header_size);

    let node: Arc<dyn NodeClient> = JsonRpcNode::new(
        config.rpc.url.clone(),
        config.rpc.user.clone(),
        config.rpc.password.clone(),
    );
    let genesis_hash = parse_genesis_hash(&config.coin.genesis_hash);

    // Cursor is provisional until the processor's open() reveals the real
    // resume height below; `clear` then snaps it to the right place.
    let prefetcher = Prefetcher::new(node.clone(), 0);

    let mut processor = BlockProcessor::open(
        store,
        fs_cache,
        decoder,
        node.clone(),
        prefetcher.clone(),
        genesis_hash,
        config.reorg_limit,
        config.utxo_mb,
        config.hist_mb,
    )?;

    prefetcher.clear((processor.height() + 1) as i64).await;
    let prefetch_task = tokio::spawn(prefetcher.clone().run());

    let mut shutdown = std::pin::pin!(tokio::signal::ctrl_c());

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested, flushing before exit");
                break;
            }
            raw_block = prefetcher.get_blocks() => {
                let node_height = node.cached_height();
                match processor.advance_block(&raw_block, node_height) {
                    Ok(AdvanceOutcome::Advanced) => {}
                    Ok(AdvanceOutcome::ReorgDetected) => {
                        if let Err(e) = processor.handle_chain_reorg(false).await {
                            error!(error = %e, "reorg handling failed");
                            return Err(Box::new(e));
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "advance_block failed");
                        return Err(Box::new(e));
                    }
                }
            }
        }
    }

    prefetch_task.abort();
    processor.flush_forward(true)?;
    info!(height = processor.height(), "clean shutdown complete");
    Ok(())
}
