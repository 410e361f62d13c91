//! The `conda-meta/<name>-<version>-<build>.json` record of an installed
//! package.

use std::path::{Path, PathBuf};

use krait_digest::{serde::HexDigest, Sha256, Sha256Hash};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none};

use crate::{package, RepoDataRecord};

pub use crate::package::FileMode;

/// The way a file was placed into a prefix.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    /// A hard link to the file in the package cache.
    HardLink,
    /// A symbolic link.
    SoftLink,
    /// A plain copy.
    Copy,
    /// A directory created for the package.
    Directory,
    /// The file was generated at link time (placeholder patching).
    Patched,
}

/// Link provenance stored in a [`PrefixRecord`].
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    /// The package cache directory the package was linked from.
    pub source: PathBuf,
    /// How the files were linked.
    #[serde(rename = "type")]
    pub link_type: Option<LinkType>,
}

/// One file of an installed package as recorded in the prefix.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsEntry {
    /// The path relative to the prefix root.
    #[serde(rename = "_path")]
    pub relative_path: PathBuf,

    /// How this file was materialized.
    pub path_type: Option<package::PathType>,

    /// The placeholder prefix that was substituted, if any.
    pub prefix_placeholder: Option<String>,

    /// Whether the placeholder file was text or binary.
    pub file_mode: Option<FileMode>,

    /// The SHA256 of the file as shipped in the package.
    #[serde_as(as = "Option<HexDigest<Sha256>>")]
    pub sha256: Option<Sha256Hash>,

    /// The SHA256 of the file as present in the prefix (differs from
    /// `sha256` for placeholder-patched files).
    #[serde_as(as = "Option<HexDigest<Sha256>>")]
    pub sha256_in_prefix: Option<Sha256Hash>,

    /// The size of the file in bytes.
    pub size_in_bytes: Option<u64>,
}

/// The full record of an installed package, written to
/// `conda-meta/<name>-<version>-<build>.json`.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefixRecord {
    /// The repodata record the package was installed from.
    #[serde(flatten)]
    pub repodata_record: RepoDataRecord,

    /// The path of the archive the package was installed from.
    pub package_tarball_full_path: Option<PathBuf>,

    /// The cache directory the package was extracted to.
    pub extracted_package_dir: Option<PathBuf>,

    /// All files of the package, relative to the prefix.
    #[serde(default)]
    pub files: Vec<PathBuf>,

    /// Detailed per-file information.
    #[serde(default)]
    pub paths_data: Vec<PathsEntry>,

    /// How the package was linked.
    pub link: Option<Link>,

    /// The spec that requested this package, if it was explicitly requested.
    pub requested_spec: Option<String>,
}

impl PrefixRecord {
    /// Creates a record from a repodata record with no file data yet.
    pub fn from_repodata_record(repodata_record: RepoDataRecord) -> Self {
        Self {
            repodata_record,
            package_tarball_full_path: None,
            extracted_package_dir: None,
            files: Vec::new(),
            paths_data: Vec::new(),
            link: None,
            requested_spec: None,
        }
    }

    /// The canonical filename of this record inside `conda-meta/`.
    pub fn file_name(&self) -> String {
        format!(
            "{}.json",
            self.repodata_record.package_record.dist_str()
        )
    }

    /// Reads a record from a file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let content = fs_err::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Writes this record to `<prefix>/conda-meta/`, creating the directory
    /// when missing.
    pub fn write_to_prefix(&self, prefix: impl AsRef<Path>) -> Result<(), std::io::Error> {
        let meta_dir = prefix.as_ref().join("conda-meta");
        fs_err::create_dir_all(&meta_dir)?;
        let path = meta_dir.join(self.file_name());
        fs_err::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

impl AsRef<RepoDataRecord> for PrefixRecord {
    fn as_ref(&self) -> &RepoDataRecord {
        &self.repodata_record
    }
}

impl AsRef<crate::PackageRecord> for PrefixRecord {
    fn as_ref(&self) -> &crate::PackageRecord {
        &self.repodata_record.package_record
    }
}
