//! Flush Executor.
//!
//! A flush cycle runs as its own tokio task so that a caller dropping its
//! `flush()` future never leaves the single-flight phase stuck. Callers wait
//! on the `completed` watch channel for the cycle they started or joined.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt as _;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument as _};
use usagelog_core::BatchBuilder;

use super::{BufferState, Inner};
use crate::metrics;

/// Single-flight state of the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushPhase {
    #[default]
    Idle,
    Flushing,
    /// A flush was requested while a pass was running; another full pass
    /// follows before the cycle completes.
    FlushingWithRerun,
}

/// Outcome of one flush cycle (a pass plus any reruns).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Persistence calls that succeeded.
    pub batches: usize,
    /// Records included in successful calls.
    pub persisted: usize,
    /// Records still pending when the cycle ended.
    pub deferred: usize,
    /// Whether a persistence call failed or was cancelled.
    pub failed: bool,
}

/// Last finished cycle, published on the `completed` channel.
#[derive(Debug, Clone, Default)]
pub(super) struct CompletedCycle {
    pub cycle: u64,
    pub report: FlushReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassOutcome {
    Drained,
    Failed,
}

impl Inner {
    /// Starts a cycle if idle, otherwise joins the running one. Returns the
    /// cycle number to wait for. Must be called with the state lock held.
    pub(super) fn request_flush(
        self: &Arc<Self>,
        state: &mut BufferState,
        cancel: CancellationToken,
    ) -> u64 {
        match state.phase {
            FlushPhase::Idle => {
                state.phase = FlushPhase::Flushing;
                state.cycle += 1;
                // The cycle re-arms on exit if anything is left.
                state.timer.cancel();
                let cycle = state.cycle;
                self.runtime.spawn(Arc::clone(self).run_cycle(cycle, cancel));
                cycle
            }
            FlushPhase::Flushing => {
                state.phase = FlushPhase::FlushingWithRerun;
                state.cycle
            }
            FlushPhase::FlushingWithRerun => state.cycle,
        }
    }

    pub(super) async fn await_cycle(&self, target: u64) -> FlushReport {
        let mut rx = self.completed.subscribe();
        rx.wait_for(|done| done.cycle >= target)
            .await
            .map(|done| done.report.clone())
            .unwrap_or_default()
    }

    async fn run_cycle(self: Arc<Self>, cycle: u64, cancel: CancellationToken) {
        let span = info_span!("flush_cycle", cycle);
        async move {
            let mut report = FlushReport::default();
            loop {
                let outcome = self.run_pass(&cancel, &mut report).await;
                if !self.finish_pass(cycle, outcome, &mut report) {
                    break;
                }
            }
        }
        .instrument(span)
        .await;
    }

    /// Decides under the lock whether another pass runs. When the cycle
    /// ends, the phase returns to `Idle` and the report is published before
    /// the lock is released, so completions are seen in cycle order.
    fn finish_pass(
        self: &Arc<Self>,
        cycle: u64,
        outcome: PassOutcome,
        report: &mut FlushReport,
    ) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if outcome == PassOutcome::Drained && state.phase == FlushPhase::FlushingWithRerun {
            state.phase = FlushPhase::Flushing;
            return true;
        }

        state.phase = FlushPhase::Idle;
        report.deferred = state.table.len();
        if !state.table.is_empty() && self.lifecycle.is_running() {
            self.arm_timer(state);
        }
        metrics::set_pending(state.table.len());

        debug!(
            batches = report.batches,
            persisted = report.persisted,
            deferred = report.deferred,
            failed = report.failed,
            "flush cycle complete"
        );
        self.completed.send_replace(CompletedCycle {
            cycle,
            report: report.clone(),
        });
        false
    }

    async fn run_pass(&self, cancel: &CancellationToken, report: &mut FlushReport) -> PassOutcome {
        loop {
            let chunk = {
                let mut guard = self.state.lock();
                let chunk = guard.table.take_batch(self.config.batch_size);
                metrics::set_pending(guard.table.len());
                chunk
            };
            if chunk.is_empty() {
                return PassOutcome::Drained;
            }

            let built = BatchBuilder::build(chunk.iter().map(|entry| (entry.id, &entry.patch)));
            for rejected in &built.rejected {
                warn!(
                    id = %rejected.id,
                    field = rejected.field.as_str(),
                    reason = %rejected.reason,
                    "dropping unencodable field"
                );
                metrics::record_rejected_field(rejected.field);
            }
            let Some(batch) = built.batch else {
                // Nothing encodable left in this chunk: the entries are consumed.
                continue;
            };

            let started = Instant::now();
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(anyhow::anyhow!("flush cancelled")),
                outcome = AssertUnwindSafe(self.store.apply_batch(&batch)).catch_unwind() => {
                    outcome.unwrap_or_else(|_| Err(anyhow::anyhow!("persistence call panicked")))
                }
            };
            let elapsed = started.elapsed().as_secs_f64();

            match result {
                Ok(()) => {
                    metrics::record_flush_batch(true, batch.len(), elapsed);
                    report.batches += 1;
                    report.persisted += batch.len();
                    debug!(records = batch.len(), elapsed_secs = elapsed, "batch persisted");
                }
                Err(err) => {
                    metrics::record_flush_batch(false, batch.len(), elapsed);
                    let requeued = chunk.len();
                    {
                        let mut guard = self.state.lock();
                        guard.table.requeue(chunk);
                        guard.evict_overflow();
                        metrics::set_pending(guard.table.len());
                    }
                    report.failed = true;
                    warn!(error = %err, requeued, "batch failed, deferring to next flush");
                    return PassOutcome::Failed;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_phase_is_idle() {
        assert_eq!(FlushPhase::default(), FlushPhase::Idle);
    }

    #[test]
    fn report_serializes_counts() {
        let report = FlushReport {
            batches: 2,
            persisted: 250,
            deferred: 0,
            failed: false,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["batches"], 2);
        assert_eq!(json["persisted"], 250);
        assert_eq!(json["failed"], false);
    }
}
