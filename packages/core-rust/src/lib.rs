//! `usagelog` core: record ids, typed sparse usage patches, decimal-safe
//! money, and the Batch Builder that turns merged patches into sparse
//! multi-record updates.

pub mod batch;
pub mod money;
pub mod patch;
pub mod types;

pub use batch::{
    BatchBuilder, BuiltBatch, ColumnValue, EncodeError, RejectedField, SparseBatch,
    SparseFieldSet, MAX_TIMESTAMP_MILLIS, MIN_TIMESTAMP_MILLIS,
};
pub use money::{Money, MoneyParseError};
pub use patch::{Field, FinishReason, FinishReasonParseError, UsagePatch};
pub use types::{Nullable, RecordId};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
