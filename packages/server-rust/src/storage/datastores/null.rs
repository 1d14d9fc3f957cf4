//! No-op [`PatchStore`] implementation.
//!
//! [`NullPatchStore`] accepts and discards every batch. Useful for
//! benchmarks and deployments that run the pipeline without usage
//! persistence.

use async_trait::async_trait;
use usagelog_core::SparseBatch;

use crate::storage::patch_store::PatchStore;

/// No-op `PatchStore`.
///
/// Every batch succeeds immediately without side effects.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPatchStore;

#[async_trait]
impl PatchStore for NullPatchStore {
    async fn apply_batch(&self, _batch: &SparseBatch) -> anyhow::Result<()> {
        Ok(())
    }

    fn is_null(&self) -> bool {
        true
    }
}
