//! Version range expressions, the version part of a [`crate::MatchSpec`].
//!
//! A version spec is a disjunction (`|`) of conjunctions (`,`) of atomic
//! constraints, with parentheses for grouping: `>=3.4,<4.0`, `1.7|1.8.*`,
//! `(>=1|<2),>3`. Atoms carry one of the comparison operators or the
//! prefix-match forms `=1.7` / `1.7.*`.

use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::{ParseVersionError, Version};

/// A comparison operator on versions.
#[allow(missing_docs)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RangeOperator {
    Greater,
    GreaterEquals,
    Less,
    LessEquals,
}

/// The operator of an atomic version constraint.
#[allow(missing_docs)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum VersionOperator {
    Equals,
    NotEquals,
    Range(RangeOperator),
    /// `=1.7` or `1.7.*`: the candidate version starts with the given one.
    StartsWith,
    /// `!=1.7.*`: the candidate version does not start with the given one.
    NotStartsWith,
    /// `~=1.7`: compatible release.
    Compatible,
}

/// Logical connective between constraint groups.
#[allow(missing_docs)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum LogicalOperator {
    And,
    Or,
}

/// A version specification.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum VersionSpec {
    /// Matches any version (`*` or the empty spec).
    Any,
    /// A single atomic constraint.
    Constraint(VersionOperator, Version),
    /// A group of specs joined by one logical operator.
    Group(LogicalOperator, Vec<VersionSpec>),
}

/// An error that occurred while parsing a [`VersionSpec`].
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ParseVersionSpecError {
    /// The version inside a constraint was invalid.
    #[error(transparent)]
    InvalidVersion(#[from] ParseVersionError),

    /// An operator was not followed by a version.
    #[error("expected a version after operator in '{0}'")]
    MissingVersion(String),

    /// A glob `*` was combined with an operator that cannot support it.
    #[error("glob pattern is not allowed with operator in '{0}'")]
    GlobIncompatibleWithOperator(String),

    /// Unbalanced or misplaced parentheses.
    #[error("unbalanced parenthesis in '{0}'")]
    UnbalancedParenthesis(String),

    /// The spec contained an empty constraint, e.g. `>=1,,<2`.
    #[error("empty version constraint in '{0}'")]
    EmptyConstraint(String),
}

impl VersionSpec {
    /// Returns whether the given version matches this specification.
    pub fn matches(&self, version: &Version) -> bool {
        match self {
            VersionSpec::Any => true,
            VersionSpec::Constraint(op, limit) => match op {
                VersionOperator::Equals => version == limit,
                VersionOperator::NotEquals => version != limit,
                VersionOperator::Range(RangeOperator::Greater) => version > limit,
                VersionOperator::Range(RangeOperator::GreaterEquals) => version >= limit,
                VersionOperator::Range(RangeOperator::Less) => version < limit,
                VersionOperator::Range(RangeOperator::LessEquals) => version <= limit,
                VersionOperator::StartsWith => version.starts_with(limit),
                VersionOperator::NotStartsWith => !version.starts_with(limit),
                VersionOperator::Compatible => version.compatible_with(limit),
            },
            VersionSpec::Group(LogicalOperator::And, group) => {
                group.iter().all(|spec| spec.matches(version))
            }
            VersionSpec::Group(LogicalOperator::Or, group) => {
                group.iter().any(|spec| spec.matches(version))
            }
        }
    }

    /// Returns true when this spec can only be satisfied by a single version
    /// (an `==` constraint). Used to decide whether a spec "pins" a version.
    pub fn is_exact(&self) -> bool {
        matches!(self, VersionSpec::Constraint(VersionOperator::Equals, _))
    }
}

impl FromStr for VersionSpec {
    type Err = ParseVersionSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = SpecParser {
            source: s,
            rest: s.trim(),
        };
        let spec = parser.parse_or()?;
        if !parser.rest.is_empty() {
            return Err(ParseVersionSpecError::UnbalancedParenthesis(s.to_owned()));
        }
        Ok(spec)
    }
}

struct SpecParser<'a> {
    source: &'a str,
    rest: &'a str,
}

impl SpecParser<'_> {
    fn parse_or(&mut self) -> Result<VersionSpec, ParseVersionSpecError> {
        let mut terms = vec![self.parse_and()?];
        while self.eat('|') {
            terms.push(self.parse_and()?);
        }
        Ok(collapse(LogicalOperator::Or, terms))
    }

    fn parse_and(&mut self) -> Result<VersionSpec, ParseVersionSpecError> {
        let mut terms = vec![self.parse_term()?];
        while self.eat(',') {
            terms.push(self.parse_term()?);
        }
        Ok(collapse(LogicalOperator::And, terms))
    }

    fn parse_term(&mut self) -> Result<VersionSpec, ParseVersionSpecError> {
        self.rest = self.rest.trim_start();
        if self.eat('(') {
            let group = self.parse_or()?;
            if !self.eat(')') {
                return Err(ParseVersionSpecError::UnbalancedParenthesis(
                    self.source.to_owned(),
                ));
            }
            return Ok(group);
        }

        let end = self
            .rest
            .find([',', '|', '(', ')'])
            .unwrap_or(self.rest.len());
        let atom = self.rest[..end].trim();
        self.rest = &self.rest[end..];
        if atom.is_empty() {
            return Err(ParseVersionSpecError::EmptyConstraint(
                self.source.to_owned(),
            ));
        }
        parse_constraint(atom)
    }

    fn eat(&mut self, c: char) -> bool {
        self.rest = self.rest.trim_start();
        if let Some(rest) = self.rest.strip_prefix(c) {
            self.rest = rest;
            true
        } else {
            false
        }
    }
}

fn collapse(op: LogicalOperator, mut terms: Vec<VersionSpec>) -> VersionSpec {
    if terms.len() == 1 {
        terms.pop().unwrap()
    } else {
        VersionSpec::Group(op, terms)
    }
}

/// Parses a single constraint atom, e.g. `>=1.2`, `=1.7`, `1.8.*` or `*`.
fn parse_constraint(atom: &str) -> Result<VersionSpec, ParseVersionSpecError> {
    let (op, version_str) = split_operator(atom);
    let version_str = version_str.trim();

    if version_str.is_empty() {
        return match op {
            None => Err(ParseVersionSpecError::EmptyConstraint(atom.to_owned())),
            Some(_) => Err(ParseVersionSpecError::MissingVersion(atom.to_owned())),
        };
    }

    // A lone `*` matches anything regardless of a (permissive) operator.
    if version_str == "*" || version_str == "*.*" {
        return match op {
            None
            | Some(VersionOperator::Equals)
            | Some(VersionOperator::StartsWith)
            | Some(VersionOperator::Compatible)
            | Some(VersionOperator::Range(RangeOperator::GreaterEquals))
            | Some(VersionOperator::Range(RangeOperator::LessEquals)) => Ok(VersionSpec::Any),
            Some(_) => Err(ParseVersionSpecError::GlobIncompatibleWithOperator(
                atom.to_owned(),
            )),
        };
    }

    // Trailing glob: `1.7.*`, `1.7*`, and the sloppy `1.7.*.` / `1.7.*.*`.
    let mut trimmed = version_str;
    loop {
        if trimmed.ends_with(".*.*") {
            trimmed = &trimmed[..trimmed.len() - 2];
        } else if trimmed.ends_with(".*.") {
            trimmed = &trimmed[..trimmed.len() - 1];
        } else {
            break;
        }
    }
    if let Some(head) = trimmed.strip_suffix(".*") {
        return glob_constraint(atom, op, head, true);
    }
    if let Some(head) = trimmed.strip_suffix('*') {
        return glob_constraint(atom, op, head, false);
    }

    let version = Version::from_str(trimmed)?;
    Ok(VersionSpec::Constraint(
        op.unwrap_or(VersionOperator::Equals),
        version,
    ))
}

fn glob_constraint(
    atom: &str,
    op: Option<VersionOperator>,
    head: &str,
    explicit_dot: bool,
) -> Result<VersionSpec, ParseVersionSpecError> {
    let version = Version::from_str(head.trim_end_matches('.'))?;
    let op = match op {
        None | Some(VersionOperator::Equals) | Some(VersionOperator::StartsWith) => {
            VersionOperator::StartsWith
        }
        Some(VersionOperator::NotEquals) | Some(VersionOperator::NotStartsWith) => {
            VersionOperator::NotStartsWith
        }
        // `>=1.7*` and friends: the glob adds nothing, keep the operator.
        Some(VersionOperator::Range(RangeOperator::GreaterEquals)) => {
            VersionOperator::Range(RangeOperator::GreaterEquals)
        }
        Some(VersionOperator::Range(RangeOperator::Greater)) if !explicit_dot => {
            VersionOperator::Range(RangeOperator::GreaterEquals)
        }
        Some(_) => {
            return Err(ParseVersionSpecError::GlobIncompatibleWithOperator(
                atom.to_owned(),
            ))
        }
    };
    Ok(VersionSpec::Constraint(op, version))
}

/// Splits a leading comparison operator off a constraint atom.
fn split_operator(atom: &str) -> (Option<VersionOperator>, &str) {
    for (token, op) in [
        ("==", VersionOperator::Equals),
        ("!=", VersionOperator::NotEquals),
        (">=", VersionOperator::Range(RangeOperator::GreaterEquals)),
        ("<=", VersionOperator::Range(RangeOperator::LessEquals)),
        ("~=", VersionOperator::Compatible),
        (">", VersionOperator::Range(RangeOperator::Greater)),
        ("<", VersionOperator::Range(RangeOperator::Less)),
        ("=", VersionOperator::StartsWith),
    ] {
        if let Some(rest) = atom.strip_prefix(token) {
            return (Some(op), rest);
        }
    }
    (None, atom)
}

impl Display for VersionOperator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionOperator::Equals => write!(f, "=="),
            VersionOperator::NotEquals => write!(f, "!="),
            VersionOperator::Range(RangeOperator::Greater) => write!(f, ">"),
            VersionOperator::Range(RangeOperator::GreaterEquals) => write!(f, ">="),
            VersionOperator::Range(RangeOperator::Less) => write!(f, "<"),
            VersionOperator::Range(RangeOperator::LessEquals) => write!(f, "<="),
            VersionOperator::StartsWith | VersionOperator::NotStartsWith => Ok(()),
            VersionOperator::Compatible => write!(f, "~="),
        }
    }
}

impl Display for VersionSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        fn write(
            spec: &VersionSpec,
            f: &mut Formatter<'_>,
            parent: Option<LogicalOperator>,
        ) -> std::fmt::Result {
            match spec {
                VersionSpec::Any => write!(f, "*"),
                VersionSpec::Constraint(VersionOperator::StartsWith, version) => {
                    write!(f, "{version}.*")
                }
                VersionSpec::Constraint(VersionOperator::NotStartsWith, version) => {
                    write!(f, "!={version}.*")
                }
                VersionSpec::Constraint(op, version) => write!(f, "{op}{version}"),
                VersionSpec::Group(op, group) => {
                    let parenthesize = matches!(
                        (op, parent),
                        (LogicalOperator::Or, Some(LogicalOperator::And))
                    );
                    if parenthesize {
                        write!(f, "(")?;
                    }
                    for (i, term) in group.iter().enumerate() {
                        if i > 0 {
                            match op {
                                LogicalOperator::And => write!(f, ",")?,
                                LogicalOperator::Or => write!(f, "|")?,
                            }
                        }
                        write(term, f, Some(*op))?;
                    }
                    if parenthesize {
                        write!(f, ")")?;
                    }
                    Ok(())
                }
            }
        }
        write(self, f, None)
    }
}

impl Serialize for VersionSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for VersionSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let str = std::borrow::Cow::<'de, str>::deserialize(deserializer)?;
        VersionSpec::from_str(&str).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn v(s: &str) -> Version {
        Version::from_str(s).unwrap()
    }

    fn vs(s: &str) -> VersionSpec {
        VersionSpec::from_str(s).unwrap()
    }

    #[test]
    fn simple_constraints() {
        assert_eq!(
            vs("1.2.3"),
            VersionSpec::Constraint(VersionOperator::Equals, v("1.2.3"))
        );
        assert_eq!(
            vs(">=1.2.3"),
            VersionSpec::Constraint(
                VersionOperator::Range(RangeOperator::GreaterEquals),
                v("1.2.3")
            )
        );
        assert_eq!(
            vs("=1.7"),
            VersionSpec::Constraint(VersionOperator::StartsWith, v("1.7"))
        );
        assert_eq!(vs("1.7.*"), vs("=1.7"));
        assert_eq!(vs("*"), VersionSpec::Any);
    }

    #[test]
    fn groups() {
        assert_eq!(
            vs(">=1.2,<2.0"),
            VersionSpec::Group(
                LogicalOperator::And,
                vec![
                    VersionSpec::Constraint(
                        VersionOperator::Range(RangeOperator::GreaterEquals),
                        v("1.2")
                    ),
                    VersionSpec::Constraint(VersionOperator::Range(RangeOperator::Less), v("2.0")),
                ]
            )
        );
        assert_eq!(vs("((>=1.2)|<1.0)"), vs(">=1.2|<1.0"));
    }

    #[test]
    fn matches() {
        assert!(vs(">=1.2.3,<2").matches(&v("1.3")));
        assert!(!vs(">=1.2.3,<2").matches(&v("2.0")));
        assert!(vs("1.2").matches(&v("1.2.0")));
        assert!(!vs("1.2").matches(&v("1.2.3")));
        assert!(vs("=1.2").matches(&v("1.2.3")));
        assert!(vs("1.7|1.8.*").matches(&v("1.8.2")));
        assert!(!vs("!=1.8.*").matches(&v("1.8.2")));
        assert!(vs("~=2.4").matches(&v("2.5")));
        assert!(!vs("~=2.4").matches(&v("3.1")));
    }

    #[test]
    fn sloppy_globs() {
        assert_eq!(vs(">2.10*"), vs(">=2.10"));
        assert_eq!(vs("2023.*.*"), vs("2023.*"));
        assert_eq!(vs("0.2.18.*."), vs("0.2.18.*"));
        assert_eq!(vs(">=*"), VersionSpec::Any);
        assert_eq!(vs("=*"), VersionSpec::Any);
    }

    #[test]
    fn glob_operator_conflicts() {
        assert_matches!(
            VersionSpec::from_str(">*"),
            Err(ParseVersionSpecError::GlobIncompatibleWithOperator(_))
        );
        assert_matches!(
            VersionSpec::from_str("!=*"),
            Err(ParseVersionSpecError::GlobIncompatibleWithOperator(_))
        );
    }

    #[test]
    fn rejects_malformed() {
        assert_matches!(
            VersionSpec::from_str(">=1,,<2"),
            Err(ParseVersionSpecError::EmptyConstraint(_))
        );
        assert_matches!(
            VersionSpec::from_str("(>=1,<2"),
            Err(ParseVersionSpecError::UnbalancedParenthesis(_))
        );
        assert_matches!(
            VersionSpec::from_str(">="),
            Err(ParseVersionSpecError::MissingVersion(_))
        );
    }

    #[test]
    fn display_roundtrip() {
        for spec in [">=1.2,<2.0", ">=1.2|<1.0", "(>=1|<2),>3", "1.8.*", "*"] {
            assert_eq!(vs(spec), vs(&vs(spec).to_string()));
        }
    }
}
