//! In-memory [`PatchStore`] implementation.
//!
//! [`MemoryPatchStore`] applies sparse batches to a map of stored rows and
//! keeps a log of every successful call. Failures can be injected
//! deterministically (`fail_next`, `set_unavailable`) or randomly
//! (`with_failure_rate`), and an artificial latency can be added, which makes
//! it the backend for tests and the load simulator.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use usagelog_core::{ColumnValue, Field, RecordId, SparseBatch};

use crate::storage::patch_store::PatchStore;

/// Columns persisted for one record so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredUsage {
    pub columns: BTreeMap<Field, ColumnValue>,
}

impl StoredUsage {
    #[must_use]
    pub fn get(&self, field: Field) -> Option<&ColumnValue> {
        self.columns.get(&field)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<RecordId, StoredUsage>,
    calls: Vec<SparseBatch>,
    failed_calls: usize,
    fail_next: usize,
    unavailable: bool,
}

/// In-memory `PatchStore` with failure injection.
#[derive(Debug, Default)]
pub struct MemoryPatchStore {
    state: Mutex<MemoryState>,
    latency: Option<Duration>,
    failure_rate: f64,
}

impl MemoryPatchStore {
    /// Creates an empty store that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every call by `latency` before applying it.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fails each call with probability `rate` (clamped to `0.0..=1.0`).
    #[must_use]
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Makes the next `n` calls fail.
    pub fn fail_next(&self, n: usize) {
        self.state.lock().fail_next = n;
    }

    /// Makes every call fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Persisted columns of `id`, if any batch touched it.
    #[must_use]
    pub fn record(&self, id: RecordId) -> Option<StoredUsage> {
        self.state.lock().records.get(&id).cloned()
    }

    /// Number of distinct records persisted.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Successful calls, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<SparseBatch> {
        self.state.lock().calls.clone()
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    #[must_use]
    pub fn failed_call_count(&self) -> usize {
        self.state.lock().failed_calls
    }

    fn should_fail(&self, state: &mut MemoryState) -> bool {
        if state.unavailable {
            return true;
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return true;
        }
        self.failure_rate > 0.0 && rand::rng().random_bool(self.failure_rate)
    }
}

#[async_trait]
impl PatchStore for MemoryPatchStore {
    async fn apply_batch(&self, batch: &SparseBatch) -> anyhow::Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        if self.should_fail(&mut state) {
            state.failed_calls += 1;
            anyhow::bail!("memory store unavailable ({} records rejected)", batch.len());
        }

        for (id, set) in batch.rows() {
            let stored = state.records.entry(*id).or_default();
            for (field, value) in set.iter() {
                stored.columns.insert(field, value.clone());
            }
        }
        state.calls.push(batch.clone());
        Ok(())
    }
}
