//! Write-back metrics.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! host process installs a recorder.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use usagelog_core::Field;

// ============================================================================
// Buffer Metrics
// ============================================================================

/// Patches accepted by `enqueue`.
pub const BUFFER_ENQUEUED: &str = "usagelog_buffer_enqueued_total";

/// Pending records evicted by the overflow guard.
pub const BUFFER_EVICTED: &str = "usagelog_buffer_evicted_total";

/// Patches or records dropped without being persisted.
pub const BUFFER_DROPPED: &str = "usagelog_buffer_dropped_total";

/// Current number of pending records.
pub const BUFFER_PENDING: &str = "usagelog_buffer_pending";

// ============================================================================
// Flush Metrics
// ============================================================================

/// Persistence calls, labelled by outcome.
pub const FLUSH_BATCHES: &str = "usagelog_flush_batches_total";

/// Records persisted successfully.
pub const FLUSH_RECORDS: &str = "usagelog_flush_records_total";

/// Persistence call duration.
pub const FLUSH_DURATION: &str = "usagelog_flush_duration_seconds";

/// Field values dropped by the batch builder.
pub const BATCH_REJECTED_FIELDS: &str = "usagelog_batch_rejected_fields_total";

/// Direct-mode writes, labelled by outcome.
pub const DIRECT_WRITES: &str = "usagelog_direct_writes_total";

// ============================================================================
// Metric Registration
// ============================================================================

/// Registers all write-back metric descriptions.
///
/// Call once at startup after installing the metrics recorder.
pub fn register_metrics() {
    describe_counter!(BUFFER_ENQUEUED, "Total usage patches enqueued");
    describe_counter!(BUFFER_EVICTED, "Pending records evicted by the overflow guard");
    describe_counter!(BUFFER_DROPPED, "Patches or records dropped without persistence");
    describe_gauge!(BUFFER_PENDING, "Records waiting to be flushed");
    describe_counter!(FLUSH_BATCHES, "Persistence calls issued by the flush executor");
    describe_counter!(FLUSH_RECORDS, "Records persisted by the flush executor");
    describe_histogram!(FLUSH_DURATION, "Duration of persistence calls in seconds");
    describe_counter!(BATCH_REJECTED_FIELDS, "Field values rejected during batch encoding");
    describe_counter!(DIRECT_WRITES, "Records written synchronously in direct mode");
}

// ============================================================================
// Recording
// ============================================================================

pub fn record_enqueued() {
    counter!(BUFFER_ENQUEUED).increment(1);
}

/// Records an overflow eviction. `reason` is `incomplete` or `oldest_terminal`.
pub fn record_evicted(reason: &'static str) {
    counter!(BUFFER_EVICTED, "reason" => reason).increment(1);
}

/// Records patches dropped, e.g. after stop or abandoned at shutdown.
pub fn record_dropped(reason: &'static str, count: u64) {
    counter!(BUFFER_DROPPED, "reason" => reason).increment(count);
}

#[allow(clippy::cast_precision_loss)]
pub fn set_pending(len: usize) {
    gauge!(BUFFER_PENDING).set(len as f64);
}

/// Records one persistence call and its duration.
pub fn record_flush_batch(ok: bool, records: usize, duration_secs: f64) {
    let outcome = if ok { "ok" } else { "error" };
    counter!(FLUSH_BATCHES, "outcome" => outcome).increment(1);
    histogram!(FLUSH_DURATION, "outcome" => outcome).record(duration_secs);
    if ok {
        counter!(FLUSH_RECORDS).increment(records as u64);
    }
}

pub fn record_rejected_field(field: Field) {
    counter!(BATCH_REJECTED_FIELDS, "field" => field.as_str()).increment(1);
}

pub fn record_direct_write(ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    counter!(DIRECT_WRITES, "outcome" => outcome).increment(1);
}
