//! Conda version numbers and their total order.
//!
//! A conda version is an optional epoch (`1!`), followed by `.`-separated
//! segments. Each segment is an alternation of numeric and alphabetic
//! components (`1alpha2` is `[1, "alpha", 2]`). Versions of different segment
//! counts are compared as if padded with zeros, so `1.1` equals `1.1.0`.
//! The literals `dev` and `post` sort below respectively above everything
//! else in their position; other alphabetic components sort below any number.

use std::{
    cmp::Ordering,
    fmt::{Display, Formatter},
    hash::{Hash, Hasher},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smallvec::SmallVec;
use thiserror::Error;

/// A single parsed component of a version segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Component {
    /// `dev` sorts below everything, including implicit zeros.
    Dev,
    /// Any other alphabetic run. Sorts below numbers, alphabetically among
    /// itself.
    Alpha(Box<str>),
    /// A numeric run.
    Numeral(u64),
    /// `post` sorts above everything.
    Post,
}

impl Component {
    fn rank(&self) -> u8 {
        match self {
            Component::Dev => 0,
            Component::Alpha(_) => 1,
            Component::Numeral(_) => 2,
            Component::Post => 3,
        }
    }

    fn is_zero(&self) -> bool {
        matches!(self, Component::Numeral(0))
    }
}

impl Ord for Component {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Component::Alpha(a), Component::Alpha(b)) => a.cmp(b),
            (Component::Numeral(a), Component::Numeral(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl PartialOrd for Component {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

type Segment = SmallVec<[Component; 2]>;

/// A conda version number.
///
/// Instances keep the string they were parsed from; [`Display`] returns it
/// verbatim. Equality, ordering and hashing operate on the parsed form, so
/// `1.1` and `1.1.0` compare equal while displaying differently.
#[derive(Debug, Clone)]
pub struct Version {
    source: Box<str>,
    epoch: u64,
    segments: Vec<Segment>,
}

/// An error that occurred while parsing a [`Version`].
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ParseVersionError {
    /// The version string was empty.
    #[error("empty version string")]
    Empty,

    /// The epoch part could not be parsed as an integer.
    #[error("invalid epoch in '{0}'")]
    InvalidEpoch(String),

    /// More than one `!` separator was found.
    #[error("duplicated epoch separator in '{0}'")]
    DuplicateEpochSeparator(String),

    /// A numeric component overflowed.
    #[error("numeric component too large in '{0}'")]
    NumeralTooLarge(String),

    /// The version contained a character outside `[A-Za-z0-9._\-!+]`.
    #[error("invalid character '{1}' in version '{0}'")]
    InvalidCharacter(String, char),
}

impl Version {
    /// Returns the epoch of this version. Versions without an explicit epoch
    /// have epoch 0.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns the number of segments in this version.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Returns the string this version was parsed from.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns true if `self` starts with `prefix` in the conda sense: the
    /// epoch matches and every segment of `prefix` equals the corresponding
    /// (zero-padded) segment of `self`. This is the semantics of the `=1.7`
    /// and `1.7.*` spec forms.
    pub fn starts_with(&self, prefix: &Version) -> bool {
        if self.epoch != prefix.epoch {
            return false;
        }
        (0..prefix.segments.len()).all(|idx| {
            compare_segments(
                self.segments.get(idx).map_or(&[], |s| s.as_slice()),
                prefix.segments.get(idx).map_or(&[], |s| s.as_slice()),
            ) == Ordering::Equal
        })
    }

    /// Returns true if `self` is compatible with `limit` in the `~=` sense:
    /// at least `limit`, and sharing all but the last segment of it.
    pub fn compatible_with(&self, limit: &Version) -> bool {
        if self < limit {
            return false;
        }
        let truncated = Version {
            source: limit.source.clone(),
            epoch: limit.epoch,
            segments: limit.segments[..limit.segments.len().saturating_sub(1)].to_vec(),
        };
        self.starts_with(&truncated)
    }

    /// Removes the last segment, returning `None` when there is only one.
    pub fn pop_segment(&self) -> Option<Version> {
        if self.segments.len() <= 1 {
            return None;
        }
        let segments = self.segments[..self.segments.len() - 1].to_vec();
        let source = self
            .source
            .rsplit_once('.')
            .map_or_else(|| self.source.clone(), |(head, _)| head.into());
        Some(Version {
            source,
            epoch: self.epoch,
            segments,
        })
    }
}

/// Compares two segments, treating missing components as zero.
fn compare_segments(left: &[Component], right: &[Component]) -> Ordering {
    const FILL: Component = Component::Numeral(0);
    let len = left.len().max(right.len());
    for idx in 0..len {
        let l = left.get(idx).unwrap_or(&FILL);
        let r = right.get(idx).unwrap_or(&FILL);
        match l.cmp(r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch.cmp(&other.epoch).then_with(|| {
            let len = self.segments.len().max(other.segments.len());
            for idx in 0..len {
                let ordering = compare_segments(
                    self.segments.get(idx).map_or(&[], |s| s.as_slice()),
                    other.segments.get(idx).map_or(&[], |s| s.as_slice()),
                );
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Hash the canonical form: trailing zero components and trailing zero
        // segments stripped, so that versions that compare equal hash equal.
        self.epoch.hash(state);
        let mut segments: Vec<&[Component]> = self
            .segments
            .iter()
            .map(|segment| {
                let trimmed = segment
                    .iter()
                    .rposition(|c| !c.is_zero())
                    .map_or(0, |idx| idx + 1);
                &segment.as_slice()[..trimmed]
            })
            .collect();
        while segments.last().is_some_and(|s| s.is_empty()) {
            segments.pop();
        }
        for segment in segments {
            for component in segment {
                match component {
                    Component::Dev => 0u8.hash(state),
                    Component::Alpha(a) => {
                        1u8.hash(state);
                        a.hash(state);
                    }
                    Component::Numeral(n) => {
                        2u8.hash(state);
                        n.hash(state);
                    }
                    Component::Post => 3u8.hash(state),
                }
            }
            u8::MAX.hash(state);
        }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl FromStr for Version {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let source = s.trim();
        if source.is_empty() {
            return Err(ParseVersionError::Empty);
        }

        let (epoch, rest) = match source.split_once('!') {
            None => (0, source),
            Some((epoch, rest)) => {
                if rest.contains('!') {
                    return Err(ParseVersionError::DuplicateEpochSeparator(
                        source.to_owned(),
                    ));
                }
                let epoch = epoch
                    .parse()
                    .map_err(|_| ParseVersionError::InvalidEpoch(source.to_owned()))?;
                (epoch, rest)
            }
        };

        // Local version labels (`+something`) order after the release part;
        // conda treats the `+` like another separator.
        let lowered = rest.to_ascii_lowercase();
        let mut segments = Vec::new();
        for raw in lowered.split(['.', '-', '_', '+']) {
            segments.push(parse_segment(source, raw)?);
        }

        Ok(Version {
            source: source.into(),
            epoch,
            segments,
        })
    }
}

fn parse_segment(source: &str, raw: &str) -> Result<Segment, ParseVersionError> {
    let mut segment = Segment::new();
    let mut chars = raw.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            let mut value: u64 = 0;
            while let Some(&d) = chars.peek() {
                let Some(digit) = d.to_digit(10) else { break };
                value = value
                    .checked_mul(10)
                    .and_then(|v| v.checked_add(u64::from(digit)))
                    .ok_or_else(|| ParseVersionError::NumeralTooLarge(source.to_owned()))?;
                chars.next();
            }
            segment.push(Component::Numeral(value));
        } else if c.is_ascii_alphabetic() {
            let mut alpha = String::new();
            while let Some(&a) = chars.peek() {
                if !a.is_ascii_alphabetic() {
                    break;
                }
                alpha.push(a);
                chars.next();
            }
            segment.push(match alpha.as_str() {
                "dev" => Component::Dev,
                "post" => Component::Post,
                _ => Component::Alpha(alpha.into_boxed_str()),
            });
        } else {
            return Err(ParseVersionError::InvalidCharacter(source.to_owned(), c));
        }
    }
    // A segment like `a1` compares as `0a1`, an empty segment as `0`.
    if segment.first().is_none_or(|c| c.rank() != 2) {
        segment.insert(0, Component::Numeral(0));
    }
    Ok(segment)
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let str = std::borrow::Cow::<'de, str>::deserialize(deserializer)?;
        Version::from_str(&str).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::from_str(s).unwrap()
    }

    #[rstest::rstest]
    #[case("1.0", "1.1")]
    #[case("1.1", "1.1.1")]
    #[case("1.1.1", "1.2")]
    #[case("1.9", "1.10")]
    #[case("0.4.1", "0.5.0")]
    #[case("2.0", "1!0.1")]
    #[case("1.0rc1", "1.0")]
    #[case("1.0", "1.0.post1")]
    fn ordering(#[case] lower: &str, #[case] higher: &str) {
        assert!(v(lower) < v(higher), "{lower} should sort below {higher}");
    }

    #[test]
    fn padding_makes_versions_equal() {
        assert_eq!(v("1.1"), v("1.1.0"));
        assert_eq!(v("1.0"), v("1.0.0.0"));
        assert_ne!(v("1.1"), v("1.1.1"));
    }

    #[test]
    fn alpha_components_sort_below_numbers() {
        assert!(v("1.0a") < v("1.0"));
        assert!(v("1.0alpha") < v("1.0beta"));
        assert!(v("1.0rc1") < v("1.0"));
        assert!(v("1.0.dev1") < v("1.0a1"));
        assert!(v("1.0") < v("1.0.post1"));
    }

    #[test]
    fn separators_are_equivalent() {
        assert_eq!(v("1.0-1"), v("1.0.1"));
        assert_eq!(v("1.0_1"), v("1.0.1"));
    }

    #[test]
    fn starts_with() {
        assert!(v("1.7.4").starts_with(&v("1.7")));
        assert!(v("1.7").starts_with(&v("1.7")));
        assert!(v("2.38").starts_with(&v("2.38.0")));
        assert!(!v("2.38").starts_with(&v("2.38.0.1")));
        assert!(!v("2.38").starts_with(&v("2.38.0a")));
        assert!(!v("1.71").starts_with(&v("1.7")));
        assert!(!v("1!1.7.4").starts_with(&v("1.7")));
    }

    #[test]
    fn compatible_with() {
        assert!(v("2.4").compatible_with(&v("2.4")));
        assert!(v("2.5").compatible_with(&v("2.4")));
        assert!(!v("2.1").compatible_with(&v("2.4")));
        assert!(!v("3.1").compatible_with(&v("2.4")));
    }

    #[test]
    fn equal_versions_hash_equal() {
        use std::collections::hash_map::DefaultHasher;
        fn hash(version: &Version) -> u64 {
            let mut hasher = DefaultHasher::new();
            version.hash(&mut hasher);
            hasher.finish()
        }
        assert_eq!(hash(&v("1.1")), hash(&v("1.1.0")));
        assert_eq!(hash(&v("1.1")), hash(&v("1.1.0.0")));
        assert_ne!(hash(&v("1.1")), hash(&v("1.1.1")));
    }

    #[test]
    fn display_preserves_source() {
        assert_eq!(v("1.1.0").to_string(), "1.1.0");
        assert_eq!(v("1!2.0rc1").to_string(), "1!2.0rc1");
    }

    #[test]
    fn parse_errors() {
        assert_eq!(Version::from_str(""), Err(ParseVersionError::Empty));
        assert!(matches!(
            Version::from_str("1!2!3"),
            Err(ParseVersionError::DuplicateEpochSeparator(_))
        ));
        assert!(matches!(
            Version::from_str("x!1.0"),
            Err(ParseVersionError::InvalidEpoch(_))
        ));
        assert!(matches!(
            Version::from_str("1.0≥"),
            Err(ParseVersionError::InvalidCharacter(..))
        ));
    }
}
