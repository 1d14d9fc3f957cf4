//! Write-back buffer for usage patches.
//!
//! [`WriteBuffer`] coalesces many small per-record updates into a bounded
//! in-memory table and persists them in sparse batches:
//!
//! - `table`     - pending patches, merged per record id
//! - `overflow`  - memory ceiling and eviction policy
//! - `scheduler` - the one-shot interval timer
//! - `executor`  - single-flight flush cycles
//! - `lifecycle` - running / stopping / stopped
//!
//! All table mutations happen under one `parking_lot::Mutex` that is never
//! held across an `.await`.

pub mod executor;
pub mod lifecycle;
pub mod overflow;
pub mod scheduler;
pub mod table;

use std::sync::{Arc, OnceLock};

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use usagelog_core::{RecordId, UsagePatch};

pub use executor::{FlushPhase, FlushReport};
pub use lifecycle::{LifecycleController, LifecycleState};
pub use overflow::{EvictionReason, OverflowGuard};
pub use table::{PendingEntry, PendingTable};

use crate::config::BufferConfig;
use crate::error::BufferError;
use crate::metrics;
use crate::storage::PatchStore;
use executor::CompletedCycle;
use scheduler::FlushTimer;

/// Outcome of [`WriteBuffer::stop`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    /// Successful persistence calls made while draining.
    pub batches: usize,
    /// Records persisted while draining.
    pub persisted: usize,
    /// Records still pending once the drain gave up. These are lost.
    pub abandoned: usize,
}

/// Mutable buffer state guarded by a single lock.
struct BufferState {
    table: PendingTable,
    timer: FlushTimer,
    phase: FlushPhase,
    /// Number of the most recently started flush cycle.
    cycle: u64,
    guard: OverflowGuard,
}

impl BufferState {
    /// Evicts until the table is back under its ceiling. Normally at most
    /// one entry per insert; a requeue after a failed batch can need more.
    fn evict_overflow(&mut self) {
        while let Some((evicted, reason)) = self.guard.enforce(&mut self.table) {
            warn!(
                id = %evicted.id,
                reason = reason.as_str(),
                fields = evicted.patch.field_count(),
                "pending table full, evicting record"
            );
            metrics::record_evicted(reason.as_str());
        }
    }
}

struct Inner {
    config: BufferConfig,
    store: Arc<dyn PatchStore>,
    runtime: Handle,
    state: parking_lot::Mutex<BufferState>,
    lifecycle: LifecycleController,
    completed: watch::Sender<CompletedCycle>,
    stop_report: OnceLock<StopReport>,
}

impl Inner {
    /// Arms the interval timer unless one is already armed. The timer task
    /// only holds a weak reference, so a dropped buffer never flushes.
    fn arm_timer(self: &Arc<Self>, state: &mut BufferState) {
        let weak = Arc::downgrade(self);
        state
            .timer
            .arm(&self.runtime, self.config.flush_interval, move |id| async move {
                if let Some(inner) = weak.upgrade() {
                    inner.on_timer_fired(id);
                }
            });
    }

    fn on_timer_fired(self: &Arc<Self>, id: u64) {
        let mut state = self.state.lock();
        if !state.timer.disarm_fired(id) || !self.lifecycle.is_running() {
            return;
        }
        debug!(pending = state.table.len(), "flush interval elapsed");
        self.request_flush(&mut state, CancellationToken::new());
    }

    async fn flush(self: &Arc<Self>, cancel: CancellationToken) -> FlushReport {
        let target = {
            let mut state = self.state.lock();
            if self.lifecycle.state() == LifecycleState::Stopped {
                return FlushReport::default();
            }
            self.request_flush(&mut state, cancel)
        };
        self.await_cycle(target).await
    }

    /// Runs the drain sequence for `stop`. Spawned as its own task so a
    /// caller giving up on `stop()` cannot leave the buffer half-stopped.
    async fn drain_and_stop(self: Arc<Self>) {
        info!(pending = self.state.lock().table.len(), "stopping write buffer");
        self.state.lock().timer.cancel();

        let mut drained = self.flush(CancellationToken::new()).await;
        if !self.state.lock().table.is_empty() {
            // Producers racing the shutdown may have enqueued after the first pass.
            let second = self.flush(CancellationToken::new()).await;
            drained.batches += second.batches;
            drained.persisted += second.persisted;
        }

        let mut state = self.state.lock();
        let abandoned = state.table.take_batch(usize::MAX).len();
        state.timer.cancel();
        if abandoned > 0 {
            error!(abandoned, "write buffer stopped with unpersisted records");
            metrics::record_dropped("abandoned", abandoned as u64);
        }
        metrics::set_pending(0);

        let report = StopReport {
            batches: drained.batches,
            persisted: drained.persisted,
            abandoned,
        };
        let _ = self.stop_report.set(report);
        // Still under the state lock, so no enqueue can slip in between the
        // final drain and the transition.
        self.lifecycle.finish_stop();
        info!(
            batches = drained.batches,
            persisted = drained.persisted,
            abandoned,
            "write buffer stopped"
        );
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let pending = self.state.get_mut().table.len();
        if pending > 0 {
            warn!(pending, "write buffer dropped without stop, pending records lost");
        }
    }
}

/// Buffered write-back handle.
///
/// Cheap to clone; clones share the same table. Must be created inside a
/// tokio runtime, which it uses for timers and flush cycles.
#[derive(Clone)]
pub struct WriteBuffer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WriteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBuffer")
            .field("config", &self.inner.config)
            .field("state", &self.inner.lifecycle.state())
            .field("pending", &self.pending_len())
            .finish_non_exhaustive()
    }
}

impl WriteBuffer {
    /// Creates a running buffer flushing into `store`.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::Config`] for an invalid configuration and
    /// [`BufferError::NoRuntime`] when called outside a tokio runtime.
    pub fn new(config: BufferConfig, store: Arc<dyn PatchStore>) -> Result<Self, BufferError> {
        config.validate()?;
        let runtime = Handle::try_current()?;
        let (completed, _rx) = watch::channel(CompletedCycle::default());

        debug!(
            flush_interval_ms = config.flush_interval.as_millis(),
            batch_size = config.batch_size,
            max_pending = config.max_pending,
            null_store = store.is_null(),
            "write buffer created"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                state: parking_lot::Mutex::new(BufferState {
                    table: PendingTable::new(),
                    timer: FlushTimer::default(),
                    phase: FlushPhase::Idle,
                    cycle: 0,
                    guard: OverflowGuard::new(config.max_pending),
                }),
                config,
                store,
                runtime,
                lifecycle: LifecycleController::new(),
                completed,
                stop_report: OnceLock::new(),
            }),
        })
    }

    /// Merges `patch` into the pending entry for `id`.
    ///
    /// Never blocks on I/O and never fails. After the buffer has stopped the
    /// patch is dropped.
    pub fn enqueue(&self, id: RecordId, patch: UsagePatch) {
        let inner = &self.inner;
        let mut guard = inner.state.lock();
        if inner.lifecycle.state() == LifecycleState::Stopped {
            drop(guard);
            debug!(%id, "write buffer stopped, dropping patch");
            metrics::record_dropped("stopped", 1);
            return;
        }
        let state = &mut *guard;

        if state.table.upsert(id, patch) {
            state.evict_overflow();
        }
        metrics::record_enqueued();
        let pending = state.table.len();
        metrics::set_pending(pending);

        if pending >= inner.config.batch_size {
            debug!(pending, "batch size reached, flushing");
            inner.request_flush(state, CancellationToken::new());
        } else if state.phase == FlushPhase::Idle
            && inner.lifecycle.is_running()
            && !state.timer.is_armed()
        {
            inner.arm_timer(state);
        }
    }

    /// Drains the table now.
    ///
    /// Joins the running cycle if there is one. Resolves once the table is
    /// empty or a failed batch deferred the rest.
    pub async fn flush(&self) -> FlushReport {
        self.inner.flush(CancellationToken::new()).await
    }

    /// Like [`flush`](Self::flush), but abandons the in-flight persistence
    /// call when `cancel` fires. The abandoned chunk is requeued.
    ///
    /// The token only applies if this call starts the cycle; a call joining
    /// a running cycle waits for it regardless.
    pub async fn flush_with_cancel(&self, cancel: CancellationToken) -> FlushReport {
        self.inner.flush(cancel).await
    }

    /// Stops the buffer after draining it.
    ///
    /// Safe to call repeatedly and concurrently: every caller waits for the
    /// same drain and gets the same report.
    pub async fn stop(&self) -> StopReport {
        let inner = &self.inner;
        if inner.lifecycle.begin_stop() {
            inner.runtime.spawn(Arc::clone(inner).drain_and_stop());
        }
        inner.lifecycle.wait_stopped().await;
        inner.stop_report.get().cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().table.len()
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.state()
    }

    #[must_use]
    pub fn flush_phase(&self) -> FlushPhase {
        self.inner.state.lock().phase
    }

    /// Receiver notified on every lifecycle transition.
    #[must_use]
    pub fn subscribe_lifecycle(&self) -> watch::Receiver<LifecycleState> {
        self.inner.lifecycle.subscribe()
    }

    #[must_use]
    pub fn config(&self) -> &BufferConfig {
        &self.inner.config
    }

    /// Current pending patch for `id`, for inspection.
    #[must_use]
    pub fn pending(&self, id: RecordId) -> Option<UsagePatch> {
        self.inner.state.lock().table.get(id).cloned()
    }
}
