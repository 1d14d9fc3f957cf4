//! `usagelog` server: buffered write-back of per-request usage telemetry.
//!
//! Producers call [`UsageWriter::record`] with partial [`UsagePatch`]es as a
//! request progresses. In buffered mode the patches are merged per record in
//! a [`WriteBuffer`] and flushed to a [`PatchStore`] in sparse batches.
//!
//! [`UsagePatch`]: usagelog_core::UsagePatch

pub mod buffer;
pub mod config;
pub mod error;
pub mod metrics;
pub mod observability;
pub mod storage;
pub mod writer;

pub use buffer::{FlushReport, LifecycleState, StopReport, WriteBuffer};
pub use config::{BufferConfig, WriteMode, WriterConfig, MAX_BATCH_SIZE};
pub use error::{BufferError, ConfigError};
pub use storage::{MemoryPatchStore, NullPatchStore, PatchStore};
pub use writer::UsageWriter;
