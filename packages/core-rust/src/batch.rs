//! Batch Builder: turns merged patches into one sparse multi-record update.
//!
//! The output keeps, per record, only the columns its patch defines, so a
//! store applying the batch leaves every other column untouched. Values are
//! encoded into store-neutral [`ColumnValue`]s: integers as `i64`, money as
//! decimal text, structured payloads as serialized JSON text.

use std::collections::BTreeMap;

use tracing::trace;

use crate::patch::{Field, UsagePatch};
use crate::types::{Nullable, RecordId};

/// Earliest instant a `PostgreSQL` `timestamptz` holds (4714-11-24T00:00:00Z BC).
pub const MIN_TIMESTAMP_MILLIS: i64 = -210_866_803_200_000;
/// Last whole second a `PostgreSQL` `timestamptz` holds (294276-12-31T23:59:59Z).
pub const MAX_TIMESTAMP_MILLIS: i64 = 9_224_318_015_999_000;

/// An encoded column value ready to be bound by a store adapter.
///
/// `None` inside the nullable variants means the column is set to `NULL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnValue {
    Int(i64),
    /// Exact decimal text, bound as a numeric parameter.
    Decimal(String),
    /// Millis since epoch.
    Timestamp(Option<i64>),
    Text(Option<String>),
    /// Serialized JSON document.
    Json(Option<String>),
}

impl ColumnValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(
            self,
            Self::Timestamp(None) | Self::Text(None) | Self::Json(None)
        )
    }
}

/// Why a single field value could not be encoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("integer {value} does not fit a signed 64-bit column")]
    IntegerOverflow { value: u64 },
    #[error("timestamp {millis}ms is outside the storable range")]
    TimestampOutOfRange { millis: i64 },
    #[error("json payload could not be serialized: {0}")]
    Json(String),
}

/// A field that was dropped from a batch because its value was malformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedField {
    pub id: RecordId,
    pub field: Field,
    pub reason: EncodeError,
}

/// The encoded columns of one record, in column order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SparseFieldSet {
    values: Vec<(Field, ColumnValue)>,
}

impl SparseFieldSet {
    #[must_use]
    pub fn get(&self, field: Field) -> Option<&ColumnValue> {
        self.values
            .iter()
            .find_map(|(f, v)| (*f == field).then_some(v))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Field, &ColumnValue)> {
        self.values.iter().map(|(f, v)| (*f, v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One persistence call's worth of sparse record updates.
///
/// Never empty: [`BatchBuilder::build`] returns no batch at all when there
/// is nothing to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseBatch {
    rows: Vec<(RecordId, SparseFieldSet)>,
}

impl SparseBatch {
    /// Row-major view: each record with the columns it defines.
    #[must_use]
    pub fn rows(&self) -> &[(RecordId, SparseFieldSet)] {
        &self.rows
    }

    /// Column-major view: for every column defined by at least one record,
    /// the records that set it and their new values. Records that do not
    /// define a column are absent from its list.
    #[must_use]
    pub fn columns(&self) -> BTreeMap<Field, Vec<(RecordId, &ColumnValue)>> {
        let mut columns: BTreeMap<Field, Vec<(RecordId, &ColumnValue)>> = BTreeMap::new();
        for (id, set) in &self.rows {
            for (field, value) in set.iter() {
                columns.entry(field).or_default().push((*id, value));
            }
        }
        columns
    }

    pub fn ids(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.rows.iter().map(|(id, _)| *id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Result of [`BatchBuilder::build`].
#[derive(Debug, Clone, Default)]
pub struct BuiltBatch {
    /// `None` when no patch defined any encodable field.
    pub batch: Option<SparseBatch>,
    /// Field values dropped because they could not be encoded.
    pub rejected: Vec<RejectedField>,
}

/// Builds [`SparseBatch`]es from merged `(id, patch)` pairs.
///
/// Record ids are expected to be distinct within one call, which holds for
/// anything drained from the pending table.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchBuilder;

impl BatchBuilder {
    /// Encodes `entries` into a single sparse batch.
    ///
    /// Malformed values are rejected per field and reported in
    /// [`BuiltBatch::rejected`]; the remaining fields of that record are
    /// still written. Records left with no fields are omitted.
    pub fn build<'a, I>(entries: I) -> BuiltBatch
    where
        I: IntoIterator<Item = (RecordId, &'a UsagePatch)>,
    {
        let mut rows = Vec::new();
        let mut rejected = Vec::new();

        for (id, patch) in entries {
            let set = Self::encode_record(id, patch, &mut rejected);
            if set.is_empty() {
                trace!(%id, "record has no encodable fields, skipped");
                continue;
            }
            rows.push((id, set));
        }

        BuiltBatch {
            batch: (!rows.is_empty()).then_some(SparseBatch { rows }),
            rejected,
        }
    }

    fn encode_record(
        id: RecordId,
        patch: &UsagePatch,
        rejected: &mut Vec<RejectedField>,
    ) -> SparseFieldSet {
        let mut values = Vec::with_capacity(patch.field_count());
        let mut push = |field: Field, encoded: Result<ColumnValue, EncodeError>| match encoded {
            Ok(value) => values.push((field, value)),
            Err(reason) => rejected.push(RejectedField { id, field, reason }),
        };

        if let Some(n) = patch.prompt_tokens {
            push(Field::PromptTokens, encode_count(n));
        }
        if let Some(n) = patch.completion_tokens {
            push(Field::CompletionTokens, encode_count(n));
        }
        if let Some(n) = patch.cached_tokens {
            push(Field::CachedTokens, encode_count(n));
        }
        if let Some(n) = patch.reasoning_tokens {
            push(Field::ReasoningTokens, encode_count(n));
        }
        if let Some(ms) = patch.duration_ms {
            push(Field::DurationMs, encode_count(ms));
        }
        if let Some(code) = patch.status_code {
            push(Field::StatusCode, Ok(ColumnValue::Int(i64::from(code))));
        }
        if let Some(cost) = &patch.cost_usd {
            push(Field::CostUsd, Ok(ColumnValue::Decimal(cost.as_str().to_string())));
        }
        if let Some(at) = &patch.first_token_at {
            push(Field::FirstTokenAt, encode_timestamp(at));
        }
        if let Some(at) = &patch.completed_at {
            push(Field::CompletedAt, encode_timestamp(at));
        }
        if let Some(reason) = &patch.finish_reason {
            let text = match reason {
                Nullable::Null => None,
                Nullable::Value(r) => Some(r.as_str().to_string()),
            };
            push(Field::FinishReason, Ok(ColumnValue::Text(text)));
        }
        if let Some(doc) = &patch.error {
            push(Field::Error, encode_json(doc));
        }
        if let Some(doc) = &patch.metadata {
            push(Field::Metadata, encode_json(doc));
        }

        SparseFieldSet { values }
    }
}

fn encode_count(value: u64) -> Result<ColumnValue, EncodeError> {
    i64::try_from(value)
        .map(ColumnValue::Int)
        .map_err(|_| EncodeError::IntegerOverflow { value })
}

fn encode_timestamp(value: &Nullable<i64>) -> Result<ColumnValue, EncodeError> {
    match value {
        Nullable::Null => Ok(ColumnValue::Timestamp(None)),
        Nullable::Value(millis)
            if (MIN_TIMESTAMP_MILLIS..=MAX_TIMESTAMP_MILLIS).contains(millis) =>
        {
            Ok(ColumnValue::Timestamp(Some(*millis)))
        }
        Nullable::Value(millis) => Err(EncodeError::TimestampOutOfRange { millis: *millis }),
    }
}

fn encode_json(value: &Nullable<serde_json::Value>) -> Result<ColumnValue, EncodeError> {
    match value {
        Nullable::Null | Nullable::Value(serde_json::Value::Null) => Ok(ColumnValue::Json(None)),
        Nullable::Value(doc) => serde_json::to_string(doc)
            .map(|s| ColumnValue::Json(Some(s)))
            .map_err(|e| EncodeError::Json(e.to_string())),
    }
}
