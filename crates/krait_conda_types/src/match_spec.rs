//! Parsing and evaluation of conda match specs.
//!
//! A match spec constrains the set of packages a user is asking for:
//!
//! ```text
//! conda-forge::python >=3.9,<3.13 *_cpython [license="PSF", subdir=linux-64]
//! ```
//!
//! The grammar is `[channel[/subdir]::]name [version [build]] [brackets]
//! [parens]`, where brackets carry `key=value` qualifiers and parens carry
//! `target`/`optional`. A bare path or url to a `.tar.bz2`/`.conda` file is
//! also a valid spec; its name is inferred from the filename.

use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use krait_digest::{parse_digest_from_hex, Md5, Md5Hash, Sha256, Sha256Hash};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_till1, take_while},
    character::complete::{char, multispace0},
    combinator::opt,
    multi::separated_list0,
    sequence::{delimited, separated_pair},
    Finish, IResult, Parser,
};
use smallvec::SmallVec;
use thiserror::Error;
use url::Url;

use crate::{
    package::ArchiveIdentifier, BuildNumberSpec, ParseBuildNumberSpecError, ParseVersionSpecError,
    Platform, RepoDataRecord, StringMatcher, StringMatcherParseError, VersionSpec,
};

/// A parsed package constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchSpec {
    /// The name of the package. Only absent when the spec is a direct url
    /// reference whose filename could not be parsed.
    pub name: Option<String>,
    /// The version range the package must fall in.
    pub version: Option<VersionSpec>,
    /// A matcher for the build string.
    pub build: Option<StringMatcher>,
    /// A predicate over the build number.
    pub build_number: Option<BuildNumberSpec>,
    /// The channel the package must come from, as written by the user.
    pub channel: Option<String>,
    /// The subdir the package must come from.
    pub subdir: Option<Platform>,
    /// A direct url to the package archive.
    pub url: Option<Url>,
    /// The exact filename of the package archive.
    pub file_name: Option<String>,
    /// The expected MD5 digest of the archive.
    pub md5: Option<Md5Hash>,
    /// The expected SHA256 digest of the archive.
    pub sha256: Option<Sha256Hash>,
    /// The license the package must carry.
    pub license: Option<String>,
    /// The target prefix this spec is intended for, from `(target=...)`.
    pub target: Option<String>,
    /// Whether the spec is optional, from `(optional)`.
    pub optional: bool,
}

/// An error that occurred while parsing a [`MatchSpec`]. Parsing is total:
/// every input either parses or produces one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseMatchSpecError {
    /// The spec was empty after stripping comments and whitespace.
    #[error("missing package name")]
    MissingPackageName,

    /// A bracket section could not be parsed.
    #[error("invalid bracket section")]
    InvalidBracket,

    /// A bracket key is not recognized.
    #[error("invalid bracket key: {0}")]
    InvalidBracketKey(String),

    /// More than one bracket section was found.
    #[error("multiple bracket sections not allowed")]
    MultipleBracketSectionsNotAllowed,

    /// The package name contains invalid characters.
    #[error("invalid package name: '{0}'")]
    InvalidPackageName(String),

    /// The version part of the spec was invalid.
    #[error(transparent)]
    InvalidVersionSpec(#[from] ParseVersionSpecError),

    /// The build string matcher was invalid.
    #[error(transparent)]
    InvalidStringMatcher(#[from] StringMatcherParseError),

    /// The build number predicate was invalid.
    #[error(transparent)]
    InvalidBuildNumber(#[from] ParseBuildNumberSpecError),

    /// A digest in the spec was not valid hex.
    #[error("unable to parse hash digest from hex")]
    InvalidHashDigest,

    /// The url of a direct package reference was invalid.
    #[error("invalid package url '{0}'")]
    InvalidPackageUrl(String),

    /// The platform in a `channel/subdir::` prefix was invalid.
    #[error(transparent)]
    InvalidSubdir(#[from] crate::ParsePlatformError),
}

type BracketVec<'a> = SmallVec<[(&'a str, &'a str); 2]>;

impl FromStr for MatchSpec {
    type Err = ParseMatchSpecError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        // Strip a trailing comment first; everything after '#' is ignored.
        let input = input.split_once('#').map_or(input, |(spec, _)| spec).trim();
        if input.is_empty() {
            return Err(ParseMatchSpecError::MissingPackageName);
        }

        // A direct reference to an archive on disk or on a server.
        if let Some(url) = parse_url_like(input)? {
            return MatchSpec::from_url(url);
        }

        let (input, parens) = strip_parens(input)?;
        let (input, brackets) = strip_brackets(input.trim())?;
        let mut spec = MatchSpec::default();
        apply_bracket_keys(&mut spec, &brackets)?;
        apply_paren_keys(&mut spec, &parens)?;

        // Split off the `channel[/subdir]::` prefix. Only the final `::` is
        // significant so channel urls containing `:` survive.
        let input = input.trim();
        let input = match input.rsplit_once("::") {
            Some((channel_str, rest)) => {
                let channel_str = channel_str.trim();
                if !channel_str.is_empty() {
                    let (channel, subdir) = split_channel_and_subdir(channel_str)?;
                    spec.channel.get_or_insert_with(|| channel.to_owned());
                    if let Some(subdir) = subdir {
                        spec.subdir.get_or_insert(subdir);
                    }
                }
                rest
            }
            None => input,
        };

        // The name runs until the first whitespace or version operator.
        let name_end = input
            .find(|c: char| c.is_whitespace() || "><=!~,|".contains(c))
            .unwrap_or(input.len());
        let (name, rest) = input.split_at(name_end);
        let name = name.trim();
        if name.is_empty() {
            return Err(ParseMatchSpecError::MissingPackageName);
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c))
        {
            return Err(ParseMatchSpecError::InvalidPackageName(name.to_owned()));
        }
        spec.name = Some(name.to_lowercase());

        let rest = rest.trim();
        if !rest.is_empty() {
            let (version, build) = parse_version_and_build(rest)?;
            spec.version = spec.version.take().or(version);
            spec.build = spec.build.take().or(build);
        }

        Ok(spec)
    }
}

impl MatchSpec {
    /// Constructs a spec from a direct url to a package archive.
    pub fn from_url(url: Url) -> Result<MatchSpec, ParseMatchSpecError> {
        let identifier = ArchiveIdentifier::try_from_url(&url)
            .ok_or_else(|| ParseMatchSpecError::InvalidPackageUrl(url.to_string()))?;
        let version = identifier
            .version
            .parse()
            .map(|v| VersionSpec::Constraint(crate::version_spec::VersionOperator::Equals, v))
            .ok();
        Ok(MatchSpec {
            name: Some(identifier.name.clone()),
            version,
            build: Some(StringMatcher::Exact(identifier.build.clone())),
            file_name: Some(identifier.to_file_name()),
            url: Some(url),
            ..MatchSpec::default()
        })
    }

    /// Returns true when this spec points at a concrete package archive
    /// rather than describing a range of candidates.
    pub fn is_package(&self) -> bool {
        self.url.is_some() || self.file_name.is_some()
    }

    /// Returns whether the given record satisfies this spec.
    pub fn matches(&self, record: &RepoDataRecord) -> bool {
        let package = &record.package_record;
        if let Some(name) = &self.name {
            if name != &package.name {
                return false;
            }
        }
        if let Some(version) = &self.version {
            if !version.matches(&package.version) {
                return false;
            }
        }
        if let Some(build) = &self.build {
            if !build.matches(&package.build) {
                return false;
            }
        }
        if let Some(build_number) = &self.build_number {
            if !build_number.matches(package.build_number) {
                return false;
            }
        }
        if let Some(subdir) = self.subdir {
            if package.subdir.as_deref() != Some(subdir.as_str()) {
                return false;
            }
        }
        if let Some(file_name) = &self.file_name {
            if file_name != &record.file_name {
                return false;
            }
        }
        if let Some(url) = &self.url {
            if url != &record.url {
                return false;
            }
        }
        if let Some(channel) = &self.channel {
            if !channel_matches(channel, &record.channel) {
                return false;
            }
        }
        if let Some(md5) = &self.md5 {
            if package.md5.as_ref() != Some(md5) {
                return false;
            }
        }
        if let Some(sha256) = &self.sha256 {
            if package.sha256.as_ref() != Some(sha256) {
                return false;
            }
        }
        if let Some(license) = &self.license {
            if package.license.as_deref() != Some(license.as_str()) {
                return false;
            }
        }
        true
    }

    /// Renders the spec in `"name version build"` form, omitting empty
    /// trailing parts. This is the format conda-build consumes.
    pub fn conda_build_form(&self) -> String {
        let name = self.name.as_deref().unwrap_or("*");
        match (&self.version, &self.build) {
            (Some(version), Some(build)) => format!("{name} {version} {build}"),
            (Some(version), None) => format!("{name} {version}"),
            (None, _) => name.to_owned(),
        }
    }
}

/// Compares the channel of a spec with the canonical channel of a record.
/// The record side is a canonical name or url; the spec side is whatever the
/// user wrote, so the record channel matches when it equals the spec or ends
/// with `/<spec>`.
fn channel_matches(spec_channel: &str, record_channel: &str) -> bool {
    let spec_channel = spec_channel.trim_matches('/');
    let record_channel = record_channel.trim_end_matches('/');
    record_channel == spec_channel
        || record_channel
            .strip_suffix(spec_channel)
            .is_some_and(|head| head.ends_with('/'))
}

/// Recognizes a path or url spec: absolute or home-relative paths, and urls
/// with a `file`, `http(s)`, `ftp` or `s3` scheme, pointing at an archive.
fn parse_url_like(input: &str) -> Result<Option<Url>, ParseMatchSpecError> {
    let is_path = input.starts_with('/')
        || input.starts_with("./")
        || input.starts_with("../")
        || input.starts_with("~/");
    let has_scheme = ["file://", "http://", "https://", "ftp://", "s3://"]
        .iter()
        .any(|scheme| input.starts_with(scheme));

    if !is_path && !has_scheme {
        return Ok(None);
    }
    // Only treat it as a direct reference when it names an archive.
    if ArchiveIdentifier::try_from_filename(input.rsplit(['/', '\\']).next().unwrap_or(input))
        .is_none()
    {
        return Ok(None);
    }

    let url = if has_scheme {
        Url::parse(input).map_err(|_| ParseMatchSpecError::InvalidPackageUrl(input.to_owned()))?
    } else {
        let path = if let Some(rest) = input.strip_prefix("~/") {
            let Some(home) = dirs::home_dir() else {
                return Err(ParseMatchSpecError::InvalidPackageUrl(input.to_owned()));
            };
            home.join(rest)
        } else {
            let path = std::path::Path::new(input);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                std::env::current_dir()
                    .map_err(|_| ParseMatchSpecError::InvalidPackageUrl(input.to_owned()))?
                    .join(path)
            }
        };
        Url::from_file_path(&path)
            .map_err(|()| ParseMatchSpecError::InvalidPackageUrl(input.to_owned()))?
    };
    Ok(Some(url))
}

/// Splits `conda-forge/linux-64` into channel and subdir; the subdir part is
/// only split off when it is a valid platform name.
fn split_channel_and_subdir(
    input: &str,
) -> Result<(&str, Option<Platform>), ParseMatchSpecError> {
    if let Some((channel, subdir)) = input.rsplit_once('/') {
        if let Ok(platform) = Platform::from_str(subdir) {
            return Ok((channel, Some(platform)));
        }
    }
    Ok((input, None))
}

/// Strips a trailing `(...)` section and parses its `key=value` or bare-flag
/// entries. Parenthesized version groups (`foo (>=1|<2)`) also end in `)`;
/// the section only counts as a paren section when every entry uses a
/// recognized paren key.
fn strip_parens(input: &str) -> Result<(&str, BracketVec<'_>), ParseMatchSpecError> {
    if !input.ends_with(')') {
        return Ok((input, SmallVec::new()));
    }
    let Some(open) = input.rfind('(') else {
        return Ok((input, SmallVec::new()));
    };
    let contents = &input[open + 1..input.len() - 1];
    let mut pairs = SmallVec::new();
    for entry in contents.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (key, value) = match entry.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (entry, ""),
        };
        if !matches!(key, "target" | "optional") {
            return Ok((input, SmallVec::new()));
        }
        pairs.push((key, value));
    }
    Ok((&input[..open], pairs))
}

/// Strips the trailing `[...]` section and parses its contents.
fn strip_brackets(input: &str) -> Result<(&str, BracketVec<'_>), ParseMatchSpecError> {
    if !input.contains('[') {
        return Ok((input, SmallVec::new()));
    }
    let Some(open) = input.find('[') else {
        return Ok((input, SmallVec::new()));
    };
    let bracket_str = &input[open..];
    if !bracket_str.ends_with(']') {
        return Err(ParseMatchSpecError::InvalidBracket);
    }
    if bracket_str[1..bracket_str.len() - 1].contains('[') {
        return Err(ParseMatchSpecError::MultipleBracketSectionsNotAllowed);
    }
    let pairs = parse_bracket_list(bracket_str)?;
    Ok((&input[..open], pairs))
}

/// Parses the contents of a bracket list, e.g. `[version="1.2.3", subdir=linux-64]`.
fn parse_bracket_list(input: &str) -> Result<BracketVec<'_>, ParseMatchSpecError> {
    fn whitespace_enclosed<'a, F, O>(inner: F) -> impl Parser<&'a str, Output = O, Error = nom::error::Error<&'a str>>
    where
        F: Parser<&'a str, Output = O, Error = nom::error::Error<&'a str>>,
    {
        delimited(multispace0, inner, multispace0)
    }

    fn parse_key(input: &str) -> IResult<&str, &str> {
        whitespace_enclosed(take_while(|c: char| {
            c.is_alphanumeric() || c == '_' || c == '-'
        }))
        .parse(input)
    }

    fn parse_value(input: &str) -> IResult<&str, &str> {
        whitespace_enclosed(alt((
            delimited(char('"'), take_till1(|c| c == '"'), char('"')),
            delimited(char('\''), take_till1(|c| c == '\''), char('\'')),
            take_till1(|c| c == ',' || c == ']' || c == '\'' || c == '"'),
        )))
        .parse(input)
    }

    fn parse_key_value(input: &str) -> IResult<&str, (&str, &str)> {
        separated_pair(parse_key, char('='), parse_value).parse(input)
    }

    fn bracket_list(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
        delimited(
            char('['),
            separated_list0(whitespace_enclosed(char(',')), parse_key_value),
            (opt(whitespace_enclosed(tag(","))), char(']')),
        )
        .parse(input)
    }

    match bracket_list(input).finish() {
        Ok(("", values)) => Ok(values.into()),
        _ => Err(ParseMatchSpecError::InvalidBracket),
    }
}

fn apply_bracket_keys(
    spec: &mut MatchSpec,
    brackets: &BracketVec<'_>,
) -> Result<(), ParseMatchSpecError> {
    for &(key, value) in brackets {
        match key {
            "version" => spec.version = Some(value.parse()?),
            "build" => spec.build = Some(value.parse()?),
            "build_number" => spec.build_number = Some(value.parse()?),
            "md5" => {
                spec.md5 = Some(
                    parse_digest_from_hex::<Md5>(value)
                        .ok_or(ParseMatchSpecError::InvalidHashDigest)?,
                );
            }
            "sha256" => {
                spec.sha256 = Some(
                    parse_digest_from_hex::<Sha256>(value)
                        .ok_or(ParseMatchSpecError::InvalidHashDigest)?,
                );
            }
            "url" => {
                spec.url = Some(
                    Url::parse(value)
                        .map_err(|_| ParseMatchSpecError::InvalidPackageUrl(value.to_owned()))?,
                );
            }
            "fn" => spec.file_name = Some(value.to_owned()),
            "channel" => {
                let (channel, subdir) = split_channel_and_subdir(value)?;
                spec.channel = Some(channel.to_owned());
                if let Some(subdir) = subdir {
                    spec.subdir.get_or_insert(subdir);
                }
            }
            "subdir" => spec.subdir = Some(value.parse()?),
            "license" => spec.license = Some(value.to_owned()),
            key => return Err(ParseMatchSpecError::InvalidBracketKey(key.to_owned())),
        }
    }
    Ok(())
}

fn apply_paren_keys(
    spec: &mut MatchSpec,
    parens: &BracketVec<'_>,
) -> Result<(), ParseMatchSpecError> {
    for &(key, value) in parens {
        match key {
            "target" => spec.target = Some(value.to_owned()),
            "optional" => spec.optional = true,
            key => return Err(ParseMatchSpecError::InvalidBracketKey(key.to_owned())),
        }
    }
    Ok(())
}

/// Splits the part after the package name into a version spec and an optional
/// build matcher. Handles both the space-separated form (`1.0 py38_0`) and
/// the conda `=`-separated form (`==1.0=py38_0`).
fn parse_version_and_build(
    input: &str,
) -> Result<(Option<VersionSpec>, Option<StringMatcher>), ParseMatchSpecError> {
    if input.contains('[') {
        return Err(ParseMatchSpecError::MultipleBracketSectionsNotAllowed);
    }
    let input = input.trim().trim_start_matches(' ');

    let (version_str, build_str) = if let Some((version, build)) = input.rsplit_once(char::is_whitespace) {
        (version.trim(), Some(build.trim()))
    } else if input.contains([',', '|', '(']) {
        // Grouped expressions never carry a `=`-separated build string.
        (input, None)
    } else {
        // Single-constraint form: split a trailing `=build` off, ignoring
        // the leading operator characters.
        let op_len = input
            .find(|c: char| !"<>=!~".contains(c))
            .unwrap_or(input.len());
        match input[op_len..].split_once('=') {
            Some((version, build)) if !build.is_empty() => {
                (&input[..op_len + version.len()], Some(build))
            }
            _ => (input, None),
        }
    };

    let version = if version_str.is_empty() {
        None
    } else {
        Some(version_str.parse()?)
    };
    let build = match build_str {
        Some(build) if !build.is_empty() => Some(build.parse()?),
        _ => None,
    };
    Ok((version, build))
}

impl Display for MatchSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(channel) = &self.channel {
            write!(f, "{}", channel.trim_end_matches('/'))?;
            if let Some(subdir) = self.subdir {
                write!(f, "/{subdir}")?;
            }
            write!(f, "::")?;
        }
        match &self.name {
            Some(name) => write!(f, "{name}")?,
            None => write!(f, "*")?,
        }
        if let Some(version) = &self.version {
            write!(f, " {version}")?;
            if let Some(build) = &self.build {
                write!(f, " {build}")?;
            }
        }

        // Bracket keys are rendered in a fixed order so that formatting is
        // deterministic and re-parsable.
        let mut brackets = Vec::new();
        if self.version.is_none() {
            if let Some(build) = &self.build {
                brackets.push(format!("build={build}"));
            }
        }
        if let Some(build_number) = &self.build_number {
            brackets.push(format!("build_number=\"{build_number}\""));
        }
        if let Some(subdir) = self.subdir {
            if self.channel.is_none() {
                brackets.push(format!("subdir={subdir}"));
            }
        }
        if let Some(url) = &self.url {
            brackets.push(format!("url={url}"));
        }
        if let Some(file_name) = &self.file_name {
            brackets.push(format!("fn=\"{file_name}\""));
        }
        if let Some(md5) = &self.md5 {
            brackets.push(format!("md5={md5:x}"));
        }
        if let Some(sha256) = &self.sha256 {
            brackets.push(format!("sha256={sha256:x}"));
        }
        if let Some(license) = &self.license {
            brackets.push(format!("license={license}"));
        }
        if !brackets.is_empty() {
            write!(f, "[{}]", brackets.join(", "))?;
        }
        Ok(())
    }
}
