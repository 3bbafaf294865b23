/// Error kinds for the indexer core.
///
/// Kept as hand-rolled enums with manual `Display`/`std::error::Error` impls
/// rather than a derive-macro crate, matching the style already used for
/// `MyError` and the chainstate-import errors elsewhere in this codebase.
use std::fmt;

/// Fatal chain-consistency errors: genesis mismatch, corrupt counters, or a
/// backup block whose hash doesn't match the expected tip.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ChainError {
    GenesisMismatch { expected: String, found: String },
    CorruptCounters { flush_count: u16, utxo_flush_count: u16 },
    UnexpectedTip { expected: String, found: String, height: i32 },
    NoCommonAncestor,
    AssertionFailed(String),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::GenesisMismatch { expected, found } => write!(
                f,
                "DB genesis hash {} does not match coin genesis {}",
                found, expected
            ),
            ChainError::CorruptCounters { flush_count, utxo_flush_count } => write!(
                f,
                "DB corrupt: flush_count ({}) < utxo_flush_count ({})",
                flush_count, utxo_flush_count
            ),
            ChainError::UnexpectedTip { expected, found, height } => write!(
                f,
                "backup block {} is not tip {} at height {}",
                found, expected, height
            ),
            ChainError::NoCommonAncestor => {
                write!(f, "no common ancestor found - database may be corrupted")
            }
            ChainError::AssertionFailed(msg) => write!(f, "internal invariant violated: {}", msg),
        }
    }
}

impl std::error::Error for ChainError {}

/// Transient node RPC failure. Recovered locally by the Prefetcher: logged
/// and retried on the next poll.
#[derive(Debug)]
pub struct NodeError(pub String);

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node RPC error: {}", self.0)
    }
}

impl std::error::Error for NodeError {}

impl From<reqwest::Error> for NodeError {
    fn from(e: reqwest::Error) -> Self {
        NodeError(e.to_string())
    }
}

/// Malformed block bytes. Fatal; indicates the node returned something the
/// decoder doesn't understand.
#[derive(Debug)]
pub struct DecodeError(pub String);

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block decode error: {}", self.0)
    }
}

impl std::error::Error for DecodeError {}

/// Underlying store failure (open, read, write, or batch commit).
#[derive(Debug)]
pub struct StoreError(pub String);

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store error: {}", self.0)
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError(e.to_string())
    }
}

/// Umbrella error returned by the processor's public operations.
#[derive(Debug)]
pub enum ProcessorError {
    Chain(ChainError),
    Node(NodeError),
    Decode(DecodeError),
    Store(StoreError),
}

impl fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessorError::Chain(e) => write!(f, "{}", e),
            ProcessorError::Node(e) => write!(f, "{}", e),
            ProcessorError::Decode(e) => write!(f, "{}", e),
            ProcessorError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ProcessorError {}

impl From<ChainError> for ProcessorError {
    fn from(e: ChainError) -> Self {
        ProcessorError::Chain(e)
    }
}

impl From<NodeError> for ProcessorError {
    fn from(e: NodeError) -> Self {
        ProcessorError::Node(e)
    }
}

impl From<DecodeError> for ProcessorError {
    fn from(e: DecodeError) -> Self {
        ProcessorError::Decode(e)
    }
}

impl From<StoreError> for ProcessorError {
    fn from(e: StoreError) -> Self {
        ProcessorError::Store(e)
    }
}

impl From<rocksdb::Error> for ProcessorError {
    fn from(e: rocksdb::Error) -> Self {
        ProcessorError::Store(StoreError::from(e))
    }
}

impl From<std::io::Error> for ProcessorError {
    fn from(e: std::io::Error) -> Self {
        ProcessorError::Store(StoreError(e.to_string()))
    }
}
