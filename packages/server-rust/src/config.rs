//! Configuration types for the usage write-back path.

use std::time::Duration;

use crate::error::ConfigError;

/// Whether usage patches go through the [`WriteBuffer`](crate::buffer::WriteBuffer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum WriteMode {
    /// Every patch is written synchronously; no buffer is ever constructed.
    Direct,
    /// Patches are coalesced in memory and flushed in batches.
    #[default]
    Buffered,
}

impl WriteMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Buffered => "buffered",
        }
    }
}

/// Largest accepted `batch_size`.
///
/// A batch where every record carries all 12 columns binds 25 parameters per
/// record (id and value per column, plus the id in the `WHERE` list), and
/// `PostgreSQL` caps one statement at 65,535 bind parameters.
pub const MAX_BATCH_SIZE: usize = 2_621;

/// Tuning for a [`WriteBuffer`](crate::buffer::WriteBuffer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferConfig {
    /// Delay between an enqueue and the scheduled flush it arms.
    pub flush_interval: Duration,
    /// Maximum records per persistence call. Reaching this many pending
    /// records also triggers an immediate flush.
    pub batch_size: usize,
    /// Memory ceiling: pending records beyond this count cause an eviction.
    pub max_pending: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(250),
            batch_size: 200,
            max_pending: 5_000,
        }
    }
}

impl BufferConfig {
    /// Checks the configuration for values the buffer cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for a batch size of zero or above
    /// [`MAX_BATCH_SIZE`], a zero memory ceiling or a zero flush interval.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::BatchSizeTooLarge {
                batch_size: self.batch_size,
                max: MAX_BATCH_SIZE,
            });
        }
        if self.max_pending == 0 {
            return Err(ConfigError::ZeroMaxPending);
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::ZeroFlushInterval);
        }
        Ok(())
    }
}

/// Process-level writer settings, loaded once at startup from flags or
/// environment.
#[derive(Debug, Clone, clap::Args)]
pub struct WriterConfig {
    /// Route usage patches through the buffer or write them directly.
    #[arg(long, env = "USAGELOG_WRITE_MODE", value_enum, default_value_t = WriteMode::Buffered)]
    pub write_mode: WriteMode,
    /// Milliseconds between an enqueue and its scheduled flush.
    #[arg(long, env = "USAGELOG_FLUSH_INTERVAL_MS", default_value_t = 250)]
    pub flush_interval_ms: u64,
    /// Records per persistence call, and the eager-flush threshold.
    #[arg(long, env = "USAGELOG_BATCH_SIZE", default_value_t = 200)]
    pub batch_size: usize,
    /// Maximum pending records held in memory.
    #[arg(long, env = "USAGELOG_MAX_PENDING", default_value_t = 5_000)]
    pub max_pending: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        let buffer = BufferConfig::default();
        let flush_interval_ms = u64::try_from(buffer.flush_interval.as_millis()).unwrap_or(u64::MAX);
        Self {
            write_mode: WriteMode::default(),
            flush_interval_ms,
            batch_size: buffer.batch_size,
            max_pending: buffer.max_pending,
        }
    }
}

impl WriterConfig {
    /// Converts to a validated [`BufferConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the resulting buffer configuration is invalid.
    pub fn buffer_config(&self) -> Result<BufferConfig, ConfigError> {
        let config = BufferConfig {
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            batch_size: self.batch_size,
            max_pending: self.max_pending,
        };
        config.validate()?;
        Ok(config)
    }
}
