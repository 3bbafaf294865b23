/// Cooperative block prefetcher: keeps a bounded, byte-sized queue of raw
/// blocks fetched ahead of the processor so it rarely blocks on node RPC
/// latency.
///
/// Implemented as a `tokio` task guarded by a `Mutex` (the queue) and a
/// `Semaphore` (serializing `clear` against an in-flight `_prefetch` round),
/// matching the async-task style already used elsewhere in this codebase
/// rather than introducing a separate thread pool. Each blocking node round
/// trip runs inside `tokio::task::spawn_blocking`, the same offload the
/// teacher's `AtomicBatchWriter::flush` uses to keep blocking RocksDB/network
/// work off the async executor.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::{debug, warn};

use crate::constants::{
    DEFAULT_PREFETCH_TARGET_BYTES, PREFETCH_IDLE_SLEEP_SECS, PREFETCH_MAX_COUNT, PREFETCH_MIN_COUNT,
    PREFETCH_RECENT_SIZES_WINDOW,
};
use crate::node::NodeClient;

struct QueueState {
    blocks: VecDeque<Vec<u8>>,
    queued_bytes: usize,
    /// Height of the next block to fetch.
    fetched_height: i64,
    recent_sizes: VecDeque<usize>,
}

impl QueueState {
    fn avg_recent_size(&self) -> usize {
        if self.recent_sizes.is_empty() {
            return 512; // first-run estimate before any real sample exists
        }
        let total: usize = self.recent_sizes.iter().sum();
        total / self.recent_sizes.len()
    }

    fn record_size(&mut self, size: usize) {
        self.recent_sizes.push_back(size);
        if self.recent_sizes.len() > PREFETCH_RECENT_SIZES_WINDOW {
            self.recent_sizes.pop_front();
        }
    }
}

/// Concurrent block fetcher feeding a bounded byte-sized queue to the processor.
pub struct Prefetcher {
    node: Arc<dyn NodeClient>,
    target_bytes: usize,
    state: Mutex<QueueState>,
    /// Guards `clear` against a concurrent `_prefetch` round.
    clear_guard: Semaphore,
    not_empty: Notify,
}

impl Prefetcher {
    pub fn new(node: Arc<dyn NodeClient>, start_height: i64) -> Arc<Self> {
        Arc::new(Self {
            node,
            target_bytes: DEFAULT_PREFETCH_TARGET_BYTES,
            state: Mutex::new(QueueState {
                blocks: VecDeque::new(),
                queued_bytes: 0,
                fetched_height: start_height,
                recent_sizes: VecDeque::new(),
            }),
            clear_guard: Semaphore::new(1),
            not_empty: Notify::new(),
        })
    }

    /// Runs forever, topping up the queue whenever it falls below the byte
    /// target. Intended to be spawned as its own `tokio` task; cancel-safe —
    /// dropping the task abandons any in-flight RPC without corrupting state.
    pub async fn run(self: Arc<Self>) {
        loop {
            let queued_bytes = self.state.lock().await.queued_bytes;
            if queued_bytes >= self.target_bytes {
                tokio::time::sleep(Duration::from_secs(PREFETCH_IDLE_SLEEP_SECS)).await;
                continue;
            }

            if let Err(e) = self.prefetch_round().await {
                warn!(error = %e, "prefetch round failed, retrying on next poll");
                tokio::time::sleep(Duration::from_secs(PREFETCH_IDLE_SLEEP_SECS)).await;
            }
        }
    }

    async fn prefetch_round(&self) -> Result<(), crate::error::NodeError> {
        let _permit = self.clear_guard.acquire().await.expect("semaphore not closed");

        // Each node round trip is a blocking call (`reqwest::blocking`); run it
        // on a blocking-pool thread so it never stalls the async executor.
        let node = self.node.clone();
        let node_height = tokio::task::spawn_blocking(move || node.fetch_tip_height())
            .await
            .expect("node fetch_tip_height task panicked")?;

        let (fetched_height, count) = {
            let state = self.state.lock().await;
            let room = self.target_bytes.saturating_sub(state.queued_bytes);
            let avg = state.avg_recent_size().max(1);
            let count = (node_height - state.fetched_height)
                .min(PREFETCH_MAX_COUNT)
                .min((room / avg) as i64)
                .max(PREFETCH_MIN_COUNT.min(node_height - state.fetched_height).max(0));
            (state.fetched_height, count)
        };

        if count <= 0 {
            return Ok(());
        }

        let node = self.node.clone();
        let hashes = tokio::task::spawn_blocking(move || node.fetch_block_hashes(fetched_height, count))
            .await
            .expect("node fetch_block_hashes task panicked")?;

        let node = self.node.clone();
        let blocks = tokio::task::spawn_blocking(move || node.fetch_raw_blocks(&hashes))
            .await
            .expect("node fetch_raw_blocks task panicked")?;

        let mut state = self.state.lock().await;
        for block in blocks {
            state.queued_bytes += block.len();
            state.record_size(block.len());
            state.blocks.push_back(block);
        }
        state.fetched_height = fetched_height + count;
        drop(state);
        self.not_empty.notify_waiters();

        debug!(fetched_height, count, "prefetched blocks");
        Ok(())
    }

    /// Returns the next available block, waiting for the prefetcher to fill
    /// the queue if it is currently empty.
    pub async fn get_blocks(&self) -> Vec<u8> {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(block) = state.blocks.pop_front() {
                    state.queued_bytes = state.queued_bytes.saturating_sub(block.len());
                    return block;
                }
            }
            self.not_empty.notified().await;
        }
    }

    /// Atomically drains the queue and resets the fetch cursor, for use by
    /// reorg handling. Serialized against an in-flight prefetch round by the
    /// same semaphore `prefetch_round` holds.
    pub async fn clear(&self, new_height: i64) {
        let _permit = self.clear_guard.acquire().await.expect("semaphore not closed");
        let mut state = self.state.lock().await;
        state.blocks.clear();
        state.queued_bytes = 0;
        state.fetched_height = new_height;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubNode {
        tip: i64,
        block_size: usize,
    }

    impl NodeClient for StubNode {
        fn fetch_tip_height(&self) -> Result<i64, crate::error::NodeError> {
            Ok(self.tip)
        }

        fn fetch_block_hashes(&self, first: i64, count: i64) -> Result<Vec<String>, crate::error::NodeError> {
            Ok((first..first + count).map(|h| format!("hash{}", h)).collect())
        }

        fn fetch_raw_blocks(&self, hashes: &[String]) -> Result<Vec<Vec<u8>>, crate::error::NodeError> {
            Ok(hashes.iter().map(|_| vec![0u8; self.block_size]).collect())
        }

        fn cached_height(&self) -> i64 {
            self.tip
        }
    }

    #[tokio::test]
    async fn prefetch_round_fills_queue_up_to_tip() {
        let node: Arc<dyn NodeClient> = Arc::new(StubNode { tip: 5, block_size: 100 });
        let prefetcher = Prefetcher::new(node, 0);
        prefetcher.prefetch_round().await.unwrap();

        let state = prefetcher.state.lock().await;
        assert_eq!(state.blocks.len(), 5);
        assert_eq!(state.fetched_height, 5);
    }

    #[tokio::test]
    async fn clear_resets_cursor_and_drains_queue() {
        let node: Arc<dyn NodeClient> = Arc::new(StubNode { tip: 5, block_size: 100 });
        let prefetcher = Prefetcher::new(node, 0);
        prefetcher.prefetch_round().await.unwrap();

        prefetcher.clear(2).await;
        let state = prefetcher.state.lock().await;
        assert!(state.blocks.is_empty());
        assert_eq!(state.fetched_height, 2);
    }

    #[tokio::test]
    async fn get_blocks_returns_fetched_block() {
        let node: Arc<dyn NodeClient> = Arc::new(StubNode { tip: 1, block_size: 64 });
        let prefetcher = Prefetcher::new(node, 0);
        prefetcher.prefetch_round().await.unwrap();
        let block = prefetcher.get_blocks().await;
        assert_eq!(block.len(), 64);
    }
}
