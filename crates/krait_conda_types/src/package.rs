//! Metadata files contained in a package archive (`info/index.json`,
//! `info/paths.json`) and helpers for the two conda archive formats.

use std::{
    fmt::{Display, Formatter},
    path::{Path, PathBuf},
    str::FromStr,
};

use krait_digest::{serde::HexDigest, Sha256, Sha256Hash};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none};

/// The extension of a conda package archive.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ArchiveType {
    /// A bzip2-compressed tarball, `.tar.bz2`.
    TarBz2,
    /// The newer zip envelope with zstd-compressed inner tarballs, `.conda`.
    Conda,
}

impl ArchiveType {
    /// Returns the archive type of the given filename, if any.
    pub fn try_from(path: impl AsRef<str>) -> Option<ArchiveType> {
        Self::split_str(path.as_ref()).map(|(_, ty)| ty)
    }

    /// Splits a filename into its stem and archive type.
    pub fn split_str(path: &str) -> Option<(&str, ArchiveType)> {
        if let Some(stem) = path.strip_suffix(".tar.bz2") {
            Some((stem, ArchiveType::TarBz2))
        } else {
            path.strip_suffix(".conda")
                .map(|stem| (stem, ArchiveType::Conda))
        }
    }

    /// Returns the file extension of this archive type, including the dot.
    pub const fn extension(self) -> &'static str {
        match self {
            ArchiveType::TarBz2 => ".tar.bz2",
            ArchiveType::Conda => ".conda",
        }
    }
}

/// The `<name>-<version>-<build>` triple encoded in a package filename.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ArchiveIdentifier {
    /// The package name.
    pub name: String,
    /// The version string.
    pub version: String,
    /// The build string.
    pub build: String,
    /// The type of archive the identifier was taken from.
    pub archive_type: ArchiveType,
}

impl ArchiveIdentifier {
    /// Parses an identifier from a filename like
    /// `python-3.12.0-h1234567_0.conda`.
    pub fn try_from_filename(filename: &str) -> Option<ArchiveIdentifier> {
        let (stem, archive_type) = ArchiveType::split_str(filename)?;
        let (rest, build) = stem.rsplit_once('-')?;
        let (name, version) = rest.rsplit_once('-')?;
        if name.is_empty() || version.is_empty() {
            return None;
        }
        Some(ArchiveIdentifier {
            name: name.to_lowercase(),
            version: version.to_owned(),
            build: build.to_owned(),
            archive_type,
        })
    }

    /// Parses an identifier from the last segment of a url or path.
    pub fn try_from_url(url: &url::Url) -> Option<ArchiveIdentifier> {
        Self::try_from_filename(url.path_segments()?.next_back()?)
    }

    /// Reconstructs the filename this identifier was parsed from.
    pub fn to_file_name(&self) -> String {
        format!(
            "{}-{}-{}{}",
            self.name,
            self.version,
            self.build,
            self.archive_type.extension()
        )
    }
}

impl Display for ArchiveIdentifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.name, self.version, self.build)
    }
}

/// The parsed `info/index.json` of a package archive.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexJson {
    /// The name of the package.
    pub name: String,

    /// The version of the package.
    pub version: crate::Version,

    /// The build string.
    pub build: String,

    /// The build number.
    #[serde(default)]
    pub build_number: u64,

    /// The subdir the package was built for.
    pub subdir: Option<String>,

    /// Specs of the packages this package depends on.
    #[serde(default)]
    pub depends: Vec<String>,

    /// Specs of packages this package constrains.
    #[serde(default)]
    pub constrains: Vec<String>,

    /// The license of the package.
    pub license: Option<String>,

    /// Upload timestamp in milliseconds since the epoch.
    pub timestamp: Option<i64>,
}

/// How a path in a package is materialized in a prefix.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathType {
    /// The file is hard-linked from the package cache.
    HardLink,
    /// The file is a symbolic link.
    SoftLink,
    /// The file is a directory.
    Directory,
}

/// Whether a file containing the prefix placeholder is text or binary.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileMode {
    /// The placeholder may be replaced by a string of any length.
    Text,
    /// The placeholder must be replaced by a string of equal length.
    Binary,
}

/// One entry of `info/paths.json`.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsEntry {
    /// The relative path of the file inside the package.
    #[serde(rename = "_path")]
    pub relative_path: PathBuf,

    /// How the path should be linked into a prefix.
    pub path_type: PathType,

    /// The placeholder prefix baked into the file at build time, if any.
    pub prefix_placeholder: Option<String>,

    /// Whether the placeholder is in a text or binary file.
    pub file_mode: Option<FileMode>,

    /// If set, the file must never be hard-linked, only copied.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_link: bool,

    /// The size of the file in bytes.
    pub size_in_bytes: Option<u64>,

    /// The SHA256 digest of the file contents.
    #[serde_as(as = "Option<HexDigest<Sha256>>")]
    pub sha256: Option<Sha256Hash>,
}

/// The parsed `info/paths.json` of a package archive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsJson {
    /// All paths in the package.
    pub paths: Vec<PathsEntry>,

    /// The version of the file format.
    pub paths_version: u64,
}

/// Reading errors for the metadata files in this module.
#[derive(Debug, thiserror::Error)]
pub enum PackageFileError {
    /// The file could not be read.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The file could not be parsed.
    #[error("failed to parse {0}: {1}")]
    Parse(&'static str, #[source] serde_json::Error),
}

impl IndexJson {
    /// Reads the `info/index.json` file from an extracted package directory.
    pub fn from_package_directory(path: impl AsRef<Path>) -> Result<Self, PackageFileError> {
        let content = fs_err::read_to_string(path.as_ref().join("info/index.json"))?;
        serde_json::from_str(&content).map_err(|e| PackageFileError::Parse("info/index.json", e))
    }
}

impl PathsJson {
    /// Reads the `info/paths.json` file from an extracted package directory.
    pub fn from_package_directory(path: impl AsRef<Path>) -> Result<Self, PackageFileError> {
        let content = fs_err::read_to_string(path.as_ref().join("info/paths.json"))?;
        serde_json::from_str(&content).map_err(|e| PackageFileError::Parse("info/paths.json", e))
    }
}

impl FromStr for PathsJson {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_identifier_from_filename() {
        let id = ArchiveIdentifier::try_from_filename("python-3.12.0-h1234567_0.conda").unwrap();
        assert_eq!(id.name, "python");
        assert_eq!(id.version, "3.12.0");
        assert_eq!(id.build, "h1234567_0");
        assert_eq!(id.archive_type, ArchiveType::Conda);
        assert_eq!(id.to_file_name(), "python-3.12.0-h1234567_0.conda");

        let id = ArchiveIdentifier::try_from_filename("zlib-1.2.13-0.tar.bz2").unwrap();
        assert_eq!(id.name, "zlib");
        assert_eq!(id.archive_type, ArchiveType::TarBz2);

        assert!(ArchiveIdentifier::try_from_filename("no-extension").is_none());
        assert!(ArchiveIdentifier::try_from_filename("single.tar.bz2").is_none());
    }

    #[test]
    fn paths_json_parses() {
        let paths: PathsJson = r#"{
            "paths": [
                {
                    "_path": "bin/tool",
                    "path_type": "hardlink",
                    "prefix_placeholder": "/opt/placeholder",
                    "file_mode": "text",
                    "size_in_bytes": 12,
                    "sha256": "7ed530efddd47a96c11197906b4008405b90e3bc2f4e0df722a36e0e6103fd9c"
                },
                {
                    "_path": "lib/liba.so",
                    "path_type": "softlink",
                    "no_link": true
                }
            ],
            "paths_version": 1
        }"#
        .parse()
        .unwrap();
        assert_eq!(paths.paths.len(), 2);
        assert_eq!(paths.paths[0].path_type, PathType::HardLink);
        assert_eq!(paths.paths[0].file_mode, Some(FileMode::Text));
        assert!(paths.paths[1].no_link);
    }
}
