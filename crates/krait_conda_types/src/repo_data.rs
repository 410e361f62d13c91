//! The `repodata.json` data model: the index of a single channel subdir.

use std::path::Path;

use indexmap::IndexMap;
use krait_digest::{serde::HexDigest, Md5, Md5Hash, Sha256, Sha256Hash};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none};
use url::Url;

use crate::{Channel, MatchSpec, Platform, Version};

/// The parsed contents of a `repodata.json` file for one subdir.
///
/// Besides the index itself, the fetcher merges a small preamble
/// (`_url`, `_etag`, `_mod`, `_cache_control`) into the top-level object when
/// persisting the file; those fields round-trip byte-for-byte.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoData {
    /// The URL the repodata was fetched from. Part of the cache preamble.
    #[serde(rename = "_url")]
    pub url: Option<String>,

    /// The ETag of the last response. Part of the cache preamble.
    #[serde(rename = "_etag")]
    pub etag: Option<String>,

    /// The Last-Modified header of the last response. Part of the cache
    /// preamble.
    #[serde(rename = "_mod")]
    pub last_modified: Option<String>,

    /// The Cache-Control header of the last response. Part of the cache
    /// preamble.
    #[serde(rename = "_cache_control")]
    pub cache_control: Option<String>,

    /// Metadata about the subdir.
    pub info: Option<ChannelInfo>,

    /// `.tar.bz2` packages, keyed by filename.
    #[serde(default)]
    pub packages: IndexMap<String, PackageRecord>,

    /// `.conda` packages, keyed by filename.
    #[serde(default, rename = "packages.conda")]
    pub conda_packages: IndexMap<String, PackageRecord>,
}

/// The `info` block of a repodata file.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// The subdir the repodata describes.
    pub subdir: Option<String>,

    /// The base url of the channel, if the server advertises one.
    pub base_url: Option<String>,
}

/// A single package entry in repodata.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageRecord {
    /// The (lowercase) name of the package.
    pub name: String,

    /// The version of the package.
    pub version: Version,

    /// The build string, e.g. `py38h1234567_0`.
    #[serde(alias = "build_string")]
    pub build: String,

    /// The build number.
    #[serde(default)]
    pub build_number: u64,

    /// The subdir this package was indexed under.
    #[serde(default)]
    pub subdir: Option<String>,

    /// Specs this package depends on.
    #[serde(default)]
    pub depends: Vec<String>,

    /// Specs this package constrains without depending on them.
    #[serde(default)]
    pub constrains: Vec<String>,

    /// The MD5 digest of the archive.
    #[serde_as(as = "Option<HexDigest<Md5>>")]
    pub md5: Option<Md5Hash>,

    /// The SHA256 digest of the archive.
    #[serde_as(as = "Option<HexDigest<Sha256>>")]
    pub sha256: Option<Sha256Hash>,

    /// The size of the archive in bytes.
    pub size: Option<u64>,

    /// Upload timestamp in milliseconds since the epoch.
    pub timestamp: Option<i64>,

    /// The license of the package.
    pub license: Option<String>,

    /// The noarch kind (`python` or `generic`), absent for arch packages.
    pub noarch: Option<String>,
}

impl PackageRecord {
    /// Constructs a minimal record, useful in tests and for synthesizing
    /// records from package filenames.
    pub fn new(name: impl Into<String>, version: Version, build: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version,
            build: build.into(),
            build_number: 0,
            subdir: None,
            depends: Vec::new(),
            constrains: Vec::new(),
            md5: None,
            sha256: None,
            size: None,
            timestamp: None,
            license: None,
            noarch: None,
        }
    }

    /// The `<name>-<version>-<build>` identifier of this record.
    pub fn dist_str(&self) -> String {
        format!("{}-{}-{}", self.name, self.version, self.build)
    }
}

impl AsRef<PackageRecord> for PackageRecord {
    fn as_ref(&self) -> &PackageRecord {
        self
    }
}

impl std::fmt::Display for PackageRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}={}", self.name, self.version, self.build)
    }
}

/// A [`PackageRecord`] joined with its provenance: the filename it was keyed
/// by and the channel and url it can be downloaded from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoDataRecord {
    /// The record from the repodata.
    #[serde(flatten)]
    pub package_record: PackageRecord,

    /// The filename of the archive, e.g. `python-3.12.0-h1234567_0.conda`.
    #[serde(rename = "fn")]
    pub file_name: String,

    /// The canonical download url of the archive.
    pub url: Url,

    /// The canonical name of the channel the record came from.
    pub channel: String,
}

impl AsRef<PackageRecord> for RepoDataRecord {
    fn as_ref(&self) -> &PackageRecord {
        &self.package_record
    }
}

impl RepoDataRecord {
    /// Returns true when the given spec matches this record.
    pub fn matches(&self, spec: &MatchSpec) -> bool {
        spec.matches(self)
    }
}

impl RepoData {
    /// Reads and parses a repodata file from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let content = fs_err::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Builds [`RepoDataRecord`]s from all entries, attributing them to the
    /// given channel and platform.
    pub fn into_repo_data_records(
        self,
        channel: &Channel,
        platform: Platform,
    ) -> Vec<RepoDataRecord> {
        let channel_name = channel.canonical_name();
        let base_url = channel.platform_url(platform, false);
        let mut records = Vec::with_capacity(self.packages.len() + self.conda_packages.len());
        for (file_name, package_record) in self.packages.into_iter().chain(self.conda_packages) {
            let Ok(url) = base_url.join(&file_name) else {
                tracing::warn!("skipping package with unrepresentable url: {file_name}");
                continue;
            };
            records.push(RepoDataRecord {
                package_record,
                file_name,
                url,
                channel: channel_name.clone(),
            });
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    const REPODATA: &str = r#"{
        "_url": "https://conda.anaconda.org/conda-forge/noarch",
        "_etag": "W/\"bec332621e00fc4ad87ba185171bcf46\"",
        "_mod": "Mon, 13 Feb 2023 13:49:56 GMT",
        "_cache_control": "public, max-age=1200",
        "info": { "subdir": "noarch" },
        "packages": {
            "six-1.16.0-pyh6c4a22f_0.tar.bz2": {
                "build": "pyh6c4a22f_0",
                "build_number": 0,
                "depends": ["python"],
                "md5": "ac6c1ae0dcd0d051fdd0cb0db5c7c927",
                "name": "six",
                "sha256": "a85c38227b446f42c5b90d9b642f2c0567880c15d72492b8da8350b5ecc66bd4",
                "size": 14259,
                "subdir": "noarch",
                "timestamp": 1620240338595,
                "version": "1.16.0"
            }
        },
        "packages.conda": {
            "asttokens-2.2.1-pyhd8ed1ab_0.conda": {
                "build": "pyhd8ed1ab_0",
                "build_number": 0,
                "constrains": [],
                "depends": ["python >=3.5", "six"],
                "license": "Apache-2.0",
                "name": "asttokens",
                "size": 27831,
                "subdir": "noarch",
                "version": "2.2.1"
            }
        }
    }"#;

    #[test]
    fn parse_repodata() {
        let repodata: RepoData = serde_json::from_str(REPODATA).unwrap();
        assert_eq!(repodata.packages.len(), 1);
        assert_eq!(repodata.conda_packages.len(), 1);
        let six = &repodata.packages["six-1.16.0-pyh6c4a22f_0.tar.bz2"];
        assert_eq!(six.version, Version::from_str("1.16.0").unwrap());
        assert_eq!(six.depends, vec!["python".to_string()]);
        assert_eq!(six.size, Some(14259));
    }

    #[test]
    fn preamble_roundtrip() {
        let repodata: RepoData = serde_json::from_str(REPODATA).unwrap();
        let serialized = serde_json::to_string(&repodata).unwrap();
        let reparsed: RepoData = serde_json::from_str(&serialized).unwrap();
        assert_eq!(
            reparsed.url.as_deref(),
            Some("https://conda.anaconda.org/conda-forge/noarch")
        );
        assert_eq!(
            reparsed.etag.as_deref(),
            Some("W/\"bec332621e00fc4ad87ba185171bcf46\"")
        );
        assert_eq!(
            reparsed.last_modified.as_deref(),
            Some("Mon, 13 Feb 2023 13:49:56 GMT")
        );
        assert_eq!(
            reparsed.cache_control.as_deref(),
            Some("public, max-age=1200")
        );
    }

    #[test]
    fn dist_str() {
        let record = PackageRecord::new("six", Version::from_str("1.16.0").unwrap(), "py_0");
        assert_eq!(record.dist_str(), "six-1.16.0-py_0");
    }
}
