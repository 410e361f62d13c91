//! Validation of an extracted package directory against its own metadata.
//!
//! Every conda package ships an `info/paths.json` describing its files.
//! [`validate_package_directory`] checks that an extracted tree actually
//! matches: every entry exists, sizes agree, and (for hard links) the
//! SHA256 digests agree.

use std::path::{Path, PathBuf};

use krait_conda_types::package::{IndexJson, PackageFileError, PathType, PathsEntry, PathsJson};
use krait_digest::{compute_file_digest, Sha256};
use thiserror::Error;

/// The extracted directory does not match its metadata.
#[derive(Debug, Error)]
pub enum PackageValidationError {
    /// The metadata files themselves could not be read.
    #[error(transparent)]
    Metadata(#[from] PackageFileError),

    /// A specific entry is corrupted.
    #[error("the path '{0}' is corrupted")]
    CorruptedEntry(PathBuf, #[source] EntryValidationError),
}

/// What is wrong with a single entry.
#[derive(Debug, Error)]
pub enum EntryValidationError {
    /// The file is missing.
    #[error("the file does not exist")]
    NotFound,

    /// A symlink was expected.
    #[error("expected a symbolic link")]
    ExpectedSymlink,

    /// A directory was expected.
    #[error("expected a directory")]
    ExpectedDirectory,

    /// The size on disk differs from the recorded size.
    #[error("incorrect size, expected {expected} but found {actual}")]
    IncorrectSize {
        /// The recorded size.
        expected: u64,
        /// The size on disk.
        actual: u64,
    },

    /// The digest on disk differs from the recorded digest.
    #[error("sha256 mismatch, expected {expected}")]
    HashMismatch {
        /// The recorded digest.
        expected: String,
    },

    /// An io error while checking.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Validates the extracted package at `package_dir`, returning its parsed
/// metadata on success.
pub fn validate_package_directory(
    package_dir: &Path,
) -> Result<(IndexJson, PathsJson), PackageValidationError> {
    let index = IndexJson::from_package_directory(package_dir)?;
    let paths = PathsJson::from_package_directory(package_dir)?;
    for entry in &paths.paths {
        validate_entry(package_dir, entry)
            .map_err(|e| PackageValidationError::CorruptedEntry(entry.relative_path.clone(), e))?;
    }
    Ok((index, paths))
}

fn validate_entry(package_dir: &Path, entry: &PathsEntry) -> Result<(), EntryValidationError> {
    let path = package_dir.join(&entry.relative_path);
    let metadata = match fs_err::symlink_metadata(&path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(EntryValidationError::NotFound)
        }
        Err(e) => return Err(e.into()),
    };

    match entry.path_type {
        PathType::SoftLink => {
            if !metadata.file_type().is_symlink() {
                return Err(EntryValidationError::ExpectedSymlink);
            }
        }
        PathType::Directory => {
            if !metadata.is_dir() {
                return Err(EntryValidationError::ExpectedDirectory);
            }
        }
        PathType::HardLink => {
            if let Some(expected) = entry.size_in_bytes {
                if metadata.len() != expected {
                    return Err(EntryValidationError::IncorrectSize {
                        expected,
                        actual: metadata.len(),
                    });
                }
            }
            if let Some(expected) = &entry.sha256 {
                let actual = compute_file_digest::<Sha256>(&path)?;
                if &actual != expected {
                    return Err(EntryValidationError::HashMismatch {
                        expected: format!("{expected:x}"),
                    });
                }
            }
        }
    }
    Ok(())
}
