//! Matching of build strings, either exactly or with `*` globs.

use std::{
    fmt::{Display, Formatter},
    hash::{Hash, Hasher},
    str::FromStr,
};

use serde::{Serialize, Serializer};
use thiserror::Error;

/// Matches a string either exactly or by glob, where `*` matches zero or more
/// characters: `py*` matches anything starting with `py`, `*_0` anything
/// ending in `_0`.
#[derive(Debug, Clone)]
pub enum StringMatcher {
    /// Match the string exactly.
    Exact(String),
    /// Match the string by glob.
    Glob(glob::Pattern),
}

impl StringMatcher {
    /// Returns whether the given string matches.
    pub fn matches(&self, other: &str) -> bool {
        match self {
            StringMatcher::Exact(s) => s == other,
            StringMatcher::Glob(pattern) => pattern.matches(other),
        }
    }

    /// Returns the exact string if this matcher does not glob.
    pub fn as_exact(&self) -> Option<&str> {
        match self {
            StringMatcher::Exact(s) => Some(s),
            StringMatcher::Glob(_) => None,
        }
    }
}

/// An error that occurred while parsing a [`StringMatcher`].
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum StringMatcherParseError {
    /// The glob pattern was malformed.
    #[error("invalid glob: {glob}")]
    InvalidGlob {
        /// The offending pattern.
        glob: String,
    },
}

impl FromStr for StringMatcher {
    type Err = StringMatcherParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains('*') {
            Ok(StringMatcher::Glob(glob::Pattern::new(s).map_err(
                |_| StringMatcherParseError::InvalidGlob { glob: s.to_owned() },
            )?))
        } else {
            Ok(StringMatcher::Exact(s.to_owned()))
        }
    }
}

impl Display for StringMatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StringMatcher::Exact(s) => write!(f, "{s}"),
            StringMatcher::Glob(pattern) => write!(f, "{}", pattern.as_str()),
        }
    }
}

impl PartialEq for StringMatcher {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (StringMatcher::Exact(a), StringMatcher::Exact(b)) => a == b,
            (StringMatcher::Glob(a), StringMatcher::Glob(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

impl Eq for StringMatcher {}

impl Hash for StringMatcher {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            StringMatcher::Exact(s) => s.hash(state),
            StringMatcher::Glob(pattern) => pattern.as_str().hash(state),
        }
    }
}

impl Serialize for StringMatcher {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}
