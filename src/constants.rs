/// Block and Transaction Height Constants
///
/// These constants ensure consistent handling of special height values across the codebase.
/// All height-related logic should use these constants instead of magic numbers.

/// Genesis block height (the first block in the chain).
pub const HEIGHT_GENESIS: i32 = 0;

/// Height marker for an empty database (nothing indexed yet).
pub const HEIGHT_ORPHAN: i32 = -1;

/// Width in bytes of an [`AddressId`](crate::classify::AddressId).
pub const ADDRESS_ID_LEN: usize = 21;

/// Sentinel `AddressId` meaning "this script could not be classified; do not index it."
pub const NO_CACHE_ENTRY: [u8; ADDRESS_ID_LEN] = [0u8; ADDRESS_ID_LEN];

/// Width in bytes of one undo/UTXO-cache entry: address(21) + tx_num(4) + value(8).
pub const UNDO_ENTRY_LEN: usize = ADDRESS_ID_LEN + 4 + 8;

/// Default prefetcher target cache size (10 MiB), matching the source's default.
pub const DEFAULT_PREFETCH_TARGET_BYTES: usize = 10 * 1024 * 1024;

/// Idle-poll interval for the prefetcher when the queue is full.
pub const PREFETCH_IDLE_SLEEP_SECS: u64 = 2;

/// Maximum blocks fetched in a single prefetch round.
pub const PREFETCH_MAX_COUNT: i64 = 4000;

/// Floor on a prefetch round's block count.
pub const PREFETCH_MIN_COUNT: i64 = 10;

/// Number of recent block sizes kept for prefetch-count estimation.
pub const PREFETCH_RECENT_SIZES_WINDOW: usize = 50;

/// Reverse-height chunk size used when fetching raw blocks for backup.
pub const REORG_FETCH_CHUNK: usize = 50;

/// Debounce interval between cache-size checks during forward advance.
pub const CACHE_CHECK_INTERVAL_SECS: u64 = 60;

/// One MB for cache-size accounting. The source scales this by `1/1.3` to
/// compensate for CPython object overhead; a Rust `HashMap`/`Vec` has none
/// of that overhead, so the factor is dropped (see DESIGN.md Open Questions).
pub const ONE_MB: usize = 1_048_576;

/// Approximate per-entry byte cost of a pending UTXO cache addition.
pub const UTXO_CACHE_ENTRY_BYTES: usize = 187;

/// Approximate per-entry byte cost of a `db_cache` bucket entry.
pub const DB_CACHE_ENTRY_BYTES: usize = 105;

/// Approximate fixed overhead per address touched in the in-memory history map.
pub const HISTORY_ADDR_OVERHEAD_BYTES: usize = 180;

/// Approximate per-`tx_num` byte cost within the in-memory history map.
pub const HISTORY_ENTRY_BYTES: usize = 4;

/// Check if a height represents a valid canonical block.
#[inline]
pub fn is_canonical_height(height: i32) -> bool {
    height >= HEIGHT_GENESIS
}

/// Check if a height represents an empty/uninitialized database.
#[inline]
pub fn is_orphan_height(height: i32) -> bool {
    height == HEIGHT_ORPHAN
}
