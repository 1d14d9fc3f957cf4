//! Sparse partial updates of a usage record.
//!
//! A [`UsagePatch`] carries only the fields a producer observed at one point
//! in a request's life. Patches for the same record are folded together with
//! [`UsagePatch::merge_from`]; the newer patch wins field by field and fields
//! it does not mention are left untouched.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::money::Money;
use crate::types::Nullable;

/// Why a request finished, persisted as a lowercase enumerated string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
    Cancelled,
}

impl FinishReason {
    /// Stored column value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool_calls",
            Self::ContentFilter => "content_filter",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Error returned when a string is not a known [`FinishReason`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown finish reason: {0:?}")]
pub struct FinishReasonParseError(pub String);

impl FromStr for FinishReason {
    type Err = FinishReasonParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop" => Ok(Self::Stop),
            "length" => Ok(Self::Length),
            "tool_calls" => Ok(Self::ToolCalls),
            "content_filter" => Ok(Self::ContentFilter),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(FinishReasonParseError(other.to_string())),
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Columns a [`UsagePatch`] can update, in stable column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    PromptTokens,
    CompletionTokens,
    CachedTokens,
    ReasoningTokens,
    DurationMs,
    StatusCode,
    CostUsd,
    FirstTokenAt,
    CompletedAt,
    FinishReason,
    Error,
    Metadata,
}

impl Field {
    pub const ALL: [Field; 12] = [
        Field::PromptTokens,
        Field::CompletionTokens,
        Field::CachedTokens,
        Field::ReasoningTokens,
        Field::DurationMs,
        Field::StatusCode,
        Field::CostUsd,
        Field::FirstTokenAt,
        Field::CompletedAt,
        Field::FinishReason,
        Field::Error,
        Field::Metadata,
    ];

    /// Column name in the usage table.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PromptTokens => "prompt_tokens",
            Self::CompletionTokens => "completion_tokens",
            Self::CachedTokens => "cached_tokens",
            Self::ReasoningTokens => "reasoning_tokens",
            Self::DurationMs => "duration_ms",
            Self::StatusCode => "status_code",
            Self::CostUsd => "cost_usd",
            Self::FirstTokenAt => "first_token_at",
            Self::CompletedAt => "completed_at",
            Self::FinishReason => "finish_reason",
            Self::Error => "error",
            Self::Metadata => "metadata",
        }
    }

    /// The field whose presence marks a record as having completed its
    /// tracked lifecycle.
    pub const TERMINAL_MARKER: Field = Field::DurationMs;
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sparse update of one usage record.
///
/// `None` means "not part of this update". Nullable columns use
/// `Option<Nullable<T>>` so that clearing a column stays distinguishable
/// from leaving it alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsagePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
    /// Total request latency. Terminal marker: set once the request is done.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<Money>,
    /// Millis since epoch.
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    pub first_token_at: Option<Nullable<i64>>,
    /// Millis since epoch.
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    pub completed_at: Option<Nullable<i64>>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    pub finish_reason: Option<Nullable<FinishReason>>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    pub error: Option<Nullable<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    pub metadata: Option<Nullable<serde_json::Value>>,
}

/// Keeps an explicit JSON `null` as `Some(Nullable::Null)`; a missing key
/// falls back to the container default (`None`).
fn present<'de, D, T>(deserializer: D) -> Result<Option<Nullable<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Nullable::deserialize(deserializer).map(Some)
}

/// Overwrites `slot` only when `newer` carries a value.
fn overlay<T>(slot: &mut Option<T>, newer: Option<T>) {
    if newer.is_some() {
        *slot = newer;
    }
}

impl UsagePatch {
    /// Folds `newer` into `self`: every field present in `newer` replaces the
    /// current value, every absent field is kept.
    pub fn merge_from(&mut self, newer: UsagePatch) {
        let UsagePatch {
            prompt_tokens,
            completion_tokens,
            cached_tokens,
            reasoning_tokens,
            duration_ms,
            status_code,
            cost_usd,
            first_token_at,
            completed_at,
            finish_reason,
            error,
            metadata,
        } = newer;

        overlay(&mut self.prompt_tokens, prompt_tokens);
        overlay(&mut self.completion_tokens, completion_tokens);
        overlay(&mut self.cached_tokens, cached_tokens);
        overlay(&mut self.reasoning_tokens, reasoning_tokens);
        overlay(&mut self.duration_ms, duration_ms);
        overlay(&mut self.status_code, status_code);
        overlay(&mut self.cost_usd, cost_usd);
        overlay(&mut self.first_token_at, first_token_at);
        overlay(&mut self.completed_at, completed_at);
        overlay(&mut self.finish_reason, finish_reason);
        overlay(&mut self.error, error);
        overlay(&mut self.metadata, metadata);
    }

    /// Returns `true` once the record has reached its completion point.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.has(Field::TERMINAL_MARKER)
    }

    /// Returns `true` if no field is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        Field::ALL.iter().all(|f| !self.has(*f))
    }

    /// Whether `field` is part of this patch.
    #[must_use]
    pub fn has(&self, field: Field) -> bool {
        match field {
            Field::PromptTokens => self.prompt_tokens.is_some(),
            Field::CompletionTokens => self.completion_tokens.is_some(),
            Field::CachedTokens => self.cached_tokens.is_some(),
            Field::ReasoningTokens => self.reasoning_tokens.is_some(),
            Field::DurationMs => self.duration_ms.is_some(),
            Field::StatusCode => self.status_code.is_some(),
            Field::CostUsd => self.cost_usd.is_some(),
            Field::FirstTokenAt => self.first_token_at.is_some(),
            Field::CompletedAt => self.completed_at.is_some(),
            Field::FinishReason => self.finish_reason.is_some(),
            Field::Error => self.error.is_some(),
            Field::Metadata => self.metadata.is_some(),
        }
    }

    /// Present fields, in column order.
    pub fn fields(&self) -> impl Iterator<Item = Field> + '_ {
        Field::ALL.into_iter().filter(|f| self.has(*f))
    }

    /// Number of present fields.
    #[must_use]
    pub fn field_count(&self) -> usize {
        self.fields().count()
    }

    // Builder-style setters for producers.

    #[must_use]
    pub fn with_prompt_tokens(mut self, n: u64) -> Self {
        self.prompt_tokens = Some(n);
        self
    }

    #[must_use]
    pub fn with_completion_tokens(mut self, n: u64) -> Self {
        self.completion_tokens = Some(n);
        self
    }

    #[must_use]
    pub fn with_cached_tokens(mut self, n: u64) -> Self {
        self.cached_tokens = Some(n);
        self
    }

    #[must_use]
    pub fn with_reasoning_tokens(mut self, n: u64) -> Self {
        self.reasoning_tokens = Some(n);
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_status_code(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    #[must_use]
    pub fn with_cost(mut self, cost: Money) -> Self {
        self.cost_usd = Some(cost);
        self
    }

    #[must_use]
    pub fn with_first_token_at(mut self, at: Option<i64>) -> Self {
        self.first_token_at = Some(at.into());
        self
    }

    #[must_use]
    pub fn with_completed_at(mut self, at: Option<i64>) -> Self {
        self.completed_at = Some(at.into());
        self
    }

    #[must_use]
    pub fn with_finish_reason(mut self, reason: Option<FinishReason>) -> Self {
        self.finish_reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: Option<serde_json::Value>) -> Self {
        self.error = Some(error.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Option<serde_json::Value>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    #[test]
    fn merge_overwrites_only_present_fields() {
        let mut base = UsagePatch::default()
            .with_prompt_tokens(10)
            .with_cost(Money::parse("0.001").unwrap());
        base.merge_from(UsagePatch::default().with_cost(Money::parse("0.002").unwrap()));

        assert_eq!(base.prompt_tokens, Some(10));
        assert_eq!(base.cost_usd, Some(Money::parse("0.002").unwrap()));
        assert_eq!(base.field_count(), 2);
    }

    #[test]
    fn explicit_null_is_not_absent() {
        let mut base = UsagePatch::default().with_error(Some(json!({"code": 500})));
        base.merge_from(UsagePatch::default());
        assert_eq!(base.error, Some(Nullable::Value(json!({"code": 500}))));

        base.merge_from(UsagePatch::default().with_error(None));
        assert_eq!(base.error, Some(Nullable::Null));
        assert!(base.has(Field::Error));
    }

    #[test]
    fn terminal_marker_is_duration() {
        assert!(!UsagePatch::default().with_prompt_tokens(1).is_terminal());
        assert!(UsagePatch::default().with_duration_ms(120).is_terminal());
    }

    #[test]
    fn empty_patch_has_no_fields() {
        let patch = UsagePatch::default();
        assert!(patch.is_empty());
        assert_eq!(patch.fields().count(), 0);
        assert!(!UsagePatch::default().with_status_code(200).is_empty());
    }

    #[test]
    fn fields_follow_column_order() {
        let patch = UsagePatch::default()
            .with_metadata(None)
            .with_duration_ms(1)
            .with_prompt_tokens(2);
        let fields: Vec<_> = patch.fields().collect();
        assert_eq!(
            fields,
            vec![Field::PromptTokens, Field::DurationMs, Field::Metadata]
        );
    }

    #[test]
    fn serde_skips_absent_fields() {
        let patch = UsagePatch::default()
            .with_duration_ms(120)
            .with_finish_reason(Some(FinishReason::ToolCalls))
            .with_completed_at(None);
        let value = serde_json::to_value(&patch).unwrap();
        assert_eq!(
            value,
            json!({"duration_ms": 120, "finish_reason": "tool_calls", "completed_at": null})
        );
    }

    #[test]
    fn deserialize_keeps_explicit_null() {
        let patch: UsagePatch =
            serde_json::from_value(json!({"cost_usd": "0.002", "error": null})).unwrap();
        assert_eq!(patch.cost_usd, Some(Money::parse("0.002").unwrap()));
        assert_eq!(patch.error, Some(Nullable::Null));
        assert_eq!(patch.metadata, None);
        assert_eq!(patch.field_count(), 2);
    }

    #[test]
    fn finish_reason_round_trips_through_str() {
        for reason in [
            FinishReason::Stop,
            FinishReason::Length,
            FinishReason::ToolCalls,
            FinishReason::ContentFilter,
            FinishReason::Error,
            FinishReason::Cancelled,
        ] {
            assert_eq!(reason.as_str().parse::<FinishReason>(), Ok(reason));
        }
        assert!("done".parse::<FinishReason>().is_err());
    }

    fn arb_patch() -> impl Strategy<Value = UsagePatch> {
        (
            proptest::option::of(0u64..10_000),
            proptest::option::of(0u64..10_000),
            proptest::option::of(0u64..60_000),
            proptest::option::of(proptest::option::of(0i64..2_000_000_000_000)),
            proptest::option::of(0u64..1_000_000),
        )
            .prop_map(|(prompt, completion, duration, completed, micros)| {
                UsagePatch {
                    prompt_tokens: prompt,
                    completion_tokens: completion,
                    duration_ms: duration,
                    completed_at: completed.map(Nullable::from),
                    cost_usd: micros.map(|m| Money::from_micros(i64::try_from(m).unwrap())),
                    ..UsagePatch::default()
                }
            })
    }

    proptest! {
        #[test]
        fn merge_matches_fieldwise_overwrite(a in arb_patch(), b in arb_patch()) {
            let mut merged = a.clone();
            merged.merge_from(b.clone());

            for field in Field::ALL {
                prop_assert_eq!(merged.has(field), a.has(field) || b.has(field));
            }
            prop_assert_eq!(merged.prompt_tokens, b.prompt_tokens.or(a.prompt_tokens));
            prop_assert_eq!(merged.completion_tokens, b.completion_tokens.or(a.completion_tokens));
            prop_assert_eq!(merged.duration_ms, b.duration_ms.or(a.duration_ms));
            prop_assert_eq!(merged.completed_at.clone(), b.completed_at.clone().or(a.completed_at.clone()));
            prop_assert_eq!(merged.cost_usd.clone(), b.cost_usd.clone().or(a.cost_usd.clone()));
        }

        #[test]
        fn merge_is_idempotent(a in arb_patch()) {
            let mut twice = a.clone();
            twice.merge_from(a.clone());
            prop_assert_eq!(twice, a);
        }
    }
}
