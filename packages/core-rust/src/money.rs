//! Decimal-safe monetary amounts.
//!
//! [`Money`] keeps the exact decimal text it was parsed from and is never
//! converted through a binary float, so `"0.002"` reaches the store as
//! `0.002` rather than `0.0020000000000000000416`.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

static DECIMAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?[0-9]{1,20}(\.[0-9]{1,18})?$").expect("valid decimal regex"));

/// Errors from parsing a [`Money`] amount.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoneyParseError {
    #[error("empty monetary amount")]
    Empty,
    #[error("not a plain decimal amount: {0:?}")]
    Malformed(String),
}

/// A monetary amount held as validated decimal text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Money(String);

impl Money {
    /// Parses a plain decimal string such as `"12"`, `"0.002"` or `"-1.50"`.
    ///
    /// Surrounding whitespace is trimmed. Exponent notation, `NaN` and
    /// thousands separators are rejected.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyParseError`] if the input is empty or not a plain decimal.
    pub fn parse(input: &str) -> Result<Self, MoneyParseError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(MoneyParseError::Empty);
        }
        if !DECIMAL_RE.is_match(trimmed) {
            return Err(MoneyParseError::Malformed(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Builds an amount from an integer count of micro-units (1e-6).
    ///
    /// Useful for producers that accumulate cost in fixed point.
    #[must_use]
    pub fn from_micros(micros: i64) -> Self {
        let sign = if micros < 0 { "-" } else { "" };
        let abs = micros.unsigned_abs();
        Self(format!("{sign}{}.{:06}", abs / 1_000_000, abs % 1_000_000))
    }

    /// The decimal text, suitable for binding as a `numeric` parameter.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Money {
    type Err = MoneyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_decimals() {
        assert_eq!(Money::parse("0.002").unwrap().as_str(), "0.002");
        assert_eq!(Money::parse(" 12 ").unwrap().as_str(), "12");
        assert_eq!(Money::parse("-1.50").unwrap().as_str(), "-1.50");
    }

    #[test]
    fn rejects_float_notation() {
        assert_eq!(Money::parse(""), Err(MoneyParseError::Empty));
        assert!(matches!(Money::parse("1e-3"), Err(MoneyParseError::Malformed(_))));
        assert!(matches!(Money::parse("NaN"), Err(MoneyParseError::Malformed(_))));
        assert!(matches!(Money::parse("1,000.00"), Err(MoneyParseError::Malformed(_))));
        assert!(matches!(Money::parse(".5"), Err(MoneyParseError::Malformed(_))));
    }

    #[test]
    fn from_micros_is_exact() {
        assert_eq!(Money::from_micros(2_000).as_str(), "0.002000");
        assert_eq!(Money::from_micros(1_500_000).as_str(), "1.500000");
        assert_eq!(Money::from_micros(-250).as_str(), "-0.000250");
    }

    #[test]
    fn serde_uses_string_form() {
        let money = Money::parse("0.002").unwrap();
        let json = serde_json::to_string(&money).unwrap();
        assert_eq!(json, "\"0.002\"");
        let back: Money = serde_json::from_str(&json).unwrap();
        assert_eq!(back, money);
        assert!(serde_json::from_str::<Money>("\"abc\"").is_err());
    }
}
