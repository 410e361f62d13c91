//! Constraints over build numbers, e.g. the `build_number=">=2"` bracket key.

use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// A comparison operator over unsigned integers.
#[allow(missing_docs)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum OrdOperator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// A predicate over a package's build number.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct BuildNumberSpec {
    /// The comparison operator.
    pub op: OrdOperator,
    /// The number to compare against.
    pub rhs: u64,
}

impl BuildNumberSpec {
    /// Constructs a new spec from an operator and an operand.
    pub fn new(op: OrdOperator, rhs: u64) -> Self {
        Self { op, rhs }
    }

    /// Returns whether the given build number satisfies this predicate.
    pub fn matches(&self, build_number: u64) -> bool {
        match self.op {
            OrdOperator::Eq => build_number == self.rhs,
            OrdOperator::Ne => build_number != self.rhs,
            OrdOperator::Gt => build_number > self.rhs,
            OrdOperator::Ge => build_number >= self.rhs,
            OrdOperator::Lt => build_number < self.rhs,
            OrdOperator::Le => build_number <= self.rhs,
        }
    }
}

/// An error that occurred while parsing a [`BuildNumberSpec`].
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ParseBuildNumberSpecError {
    /// The operand was not an unsigned integer.
    #[error("invalid build number: {0}")]
    InvalidNumber(String),

    /// The spec was empty.
    #[error("empty build number spec")]
    Empty,
}

impl FromStr for BuildNumberSpec {
    type Err = ParseBuildNumberSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseBuildNumberSpecError::Empty);
        }
        let (op, rest) = [
            ("==", OrdOperator::Eq),
            ("!=", OrdOperator::Ne),
            (">=", OrdOperator::Ge),
            ("<=", OrdOperator::Le),
            (">", OrdOperator::Gt),
            ("<", OrdOperator::Lt),
            ("=", OrdOperator::Eq),
        ]
        .iter()
        .find_map(|(token, op)| s.strip_prefix(token).map(|rest| (*op, rest)))
        .unwrap_or((OrdOperator::Eq, s));

        let rhs = rest
            .trim()
            .parse()
            .map_err(|_| ParseBuildNumberSpecError::InvalidNumber(s.to_owned()))?;
        Ok(Self { op, rhs })
    }
}

impl Display for OrdOperator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OrdOperator::Eq => write!(f, "=="),
            OrdOperator::Ne => write!(f, "!="),
            OrdOperator::Gt => write!(f, ">"),
            OrdOperator::Ge => write!(f, ">="),
            OrdOperator::Lt => write!(f, "<"),
            OrdOperator::Le => write!(f, "<="),
        }
    }
}

impl Display for BuildNumberSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.op, self.rhs)
    }
}

impl Serialize for BuildNumberSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BuildNumberSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let str = std::borrow::Cow::<'de, str>::deserialize(deserializer)?;
        BuildNumberSpec::from_str(&str).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_match() {
        assert!(BuildNumberSpec::from_str(">=2").unwrap().matches(2));
        assert!(BuildNumberSpec::from_str(">=2").unwrap().matches(5));
        assert!(!BuildNumberSpec::from_str(">=2").unwrap().matches(1));
        assert!(BuildNumberSpec::from_str("3").unwrap().matches(3));
        assert!(BuildNumberSpec::from_str("!=0").unwrap().matches(1));
        assert!(BuildNumberSpec::from_str("=7").unwrap().matches(7));
    }

    #[test]
    fn parse_errors() {
        assert_eq!(
            BuildNumberSpec::from_str(""),
            Err(ParseBuildNumberSpecError::Empty)
        );
        assert!(matches!(
            BuildNumberSpec::from_str(">=x"),
            Err(ParseBuildNumberSpecError::InvalidNumber(_))
        ));
    }

    #[test]
    fn display_roundtrip() {
        let spec = BuildNumberSpec::from_str(">=2").unwrap();
        assert_eq!(spec.to_string(), ">=2");
        assert_eq!(BuildNumberSpec::from_str(&spec.to_string()), Ok(spec));
    }
}
