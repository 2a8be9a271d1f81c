use thiserror::Error;

#[derive(Error, Debug)]
pub enum HeapError {
    #[error("Invalid signature in heap header")]
    InvalidSignature,

    #[error("Unsupported layout version: {major}.{minor}")]
    UnsupportedVersion { major: u64, minor: u64 },

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(u64),

    #[error("Heap header checksum verification failed")]
    ChecksumMismatch,

    #[error("Pool too small: {got} bytes, need at least {need}")]
    PoolTooSmall { got: usize, need: usize },

    #[error("Invalid zone magic: {0:#x}")]
    InvalidZoneMagic(u32),

    #[error("Invalid run block size: {0}")]
    InvalidBlockSize(u64),

    #[error("Invalid run alignment: {0}")]
    InvalidAlignment(u64),

    #[error("Invalid chunk span: {chunk_id}+{size_idx} out of zone bounds")]
    InvalidChunkSpan { chunk_id: u32, size_idx: u32 },
}

pub type Result<T> = std::result::Result<T, HeapError>;

/// Reports an unrecoverable contract violation and stops.
///
/// Continuing past a corrupt chunk header or a broken caller contract
/// risks writing garbage into the persistent pool, so the diagnostic is
/// emitted and the thread panics. Embedders should run with the abort
/// panic strategy.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
        panic!($($arg)*);
    }};
}

pub(crate) use fatal;
