use std::fmt;

use serde::{Deserialize, Serialize};

/// Primary key of a usage record in the durable store.
///
/// Opaque to the buffer: only equality, ordering and hashing are relied upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl RecordId {
    /// Returns the raw key value.
    #[must_use]
    pub fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for RecordId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Value of a nullable column inside a patch.
///
/// Wrapped in an `Option` on the patch, this gives three distinct states:
/// `None` (field not part of the update), `Some(Nullable::Null)` (column
/// explicitly cleared) and `Some(Nullable::Value(v))`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Nullable<T> {
    /// Explicit SQL `NULL`.
    Null,
    /// A concrete value.
    Value(T),
}

impl<T> Nullable<T> {
    /// Converts into a plain `Option`, mapping `Null` to `None`.
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Null => None,
            Self::Value(v) => Some(v),
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl<T> From<Option<T>> for Nullable<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Self::Value)
    }
}
