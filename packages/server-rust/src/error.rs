//! Error types for the write-back path.
//!
//! None of these reach producers: enqueue and record never fail. They are
//! returned at construction time, where a bad configuration should stop the
//! process before it starts taking traffic.

/// Invalid buffer configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("batch size must be at least 1")]
    ZeroBatchSize,
    #[error("batch size {batch_size} exceeds the maximum of {max}")]
    BatchSizeTooLarge { batch_size: usize, max: usize },
    #[error("max pending must be at least 1")]
    ZeroMaxPending,
    #[error("flush interval must be non-zero")]
    ZeroFlushInterval,
}

/// Errors from constructing a [`WriteBuffer`](crate::buffer::WriteBuffer).
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("invalid buffer configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("write buffer must be created inside a tokio runtime")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}
