//! Persistence adapter trait for sparse usage batches.
//!
//! Defines [`PatchStore`], the abstraction over the durable store that the
//! [`WriteBuffer`](crate::buffer::WriteBuffer) flushes into. The buffer only
//! ever issues one call at a time; direct-mode writers may call concurrently.

use async_trait::async_trait;
use usagelog_core::SparseBatch;

/// Durable store for usage records.
///
/// Implementations must:
/// - apply each record's sparse columns without touching columns the record
///   does not carry;
/// - tolerate re-application of the same or overlapping data, since a failed
///   batch is retried after being merged with newer updates;
/// - either make the whole batch visible or return an error.
///
/// Used as `Arc<dyn PatchStore>`.
#[async_trait]
pub trait PatchStore: Send + Sync {
    /// Apply one sparse multi-record update.
    async fn apply_batch(&self, batch: &SparseBatch) -> anyhow::Result<()>;

    /// Whether this is a null (no-op) implementation.
    ///
    /// Returns `false` by default. Null implementations override to return `true`.
    fn is_null(&self) -> bool {
        false
    }
}
