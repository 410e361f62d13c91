//! Removing an installed package from a prefix.

use std::path::{Path, PathBuf};

use krait_conda_types::PrefixRecord;
use thiserror::Error;

/// An error that occurred while unlinking a package.
#[derive(Debug, Error)]
pub enum UnlinkError {
    /// A file could neither be removed nor renamed out of the way.
    #[error("failed to remove '{path}'")]
    FailedToRemove {
        /// The file that failed, relative to the prefix.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The prefix record file could not be deleted.
    #[error("failed to remove prefix record")]
    FailedToRemoveRecord(#[source] std::io::Error),
}

/// Removes every file recorded for the package, prunes directories that
/// became empty, and deletes the `conda-meta` record. Files that cannot be
/// removed (e.g. still open on some platforms) are renamed out of the way
/// with a timestamped `.c~` suffix instead.
pub fn unlink_package(prefix: &Path, record: &PrefixRecord) -> Result<(), UnlinkError> {
    let mut directories = std::collections::BTreeSet::new();

    for file in &record.files {
        let path = prefix.join(file);
        match fs_err::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "file was already gone while unlinking");
            }
            Err(remove_error) => {
                let timestamp = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map_or(0, |d| d.as_secs());
                let mut trash_name = path.as_os_str().to_os_string();
                trash_name.push(format!(".c~{timestamp}"));
                if let Err(e) = fs_err::rename(&path, PathBuf::from(&trash_name)) {
                    tracing::debug!(error = %e, "trash rename also failed");
                    return Err(UnlinkError::FailedToRemove {
                        path: file.clone(),
                        source: remove_error,
                    });
                }
            }
        }
        if let Some(parent) = file.parent() {
            directories.insert(parent.to_path_buf());
        }
    }

    // Prune directories that became empty, deepest first, never reaching
    // above the prefix.
    for directory in directories.into_iter().rev() {
        let mut current = Some(directory);
        while let Some(dir) = current {
            if dir.as_os_str().is_empty() {
                break;
            }
            let absolute = prefix.join(&dir);
            match fs_err::remove_dir(&absolute) {
                Ok(()) => current = dir.parent().map(Path::to_path_buf),
                Err(_) => break,
            }
        }
    }

    let record_path = prefix.join("conda-meta").join(record.file_name());
    match fs_err::remove_file(&record_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(UnlinkError::FailedToRemoveRecord(e)),
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use krait_conda_types::{PackageRecord, RepoDataRecord, Version};
    use url::Url;

    use super::*;

    fn installed_record(prefix: &Path, files: &[&str]) -> PrefixRecord {
        for file in files {
            let path = prefix.join(file);
            fs_err::create_dir_all(path.parent().unwrap()).unwrap();
            fs_err::write(&path, b"content").unwrap();
        }
        let mut record = PrefixRecord::from_repodata_record(RepoDataRecord {
            package_record: PackageRecord::new("pkg", Version::from_str("1.0").unwrap(), "0"),
            file_name: "pkg-1.0-0.tar.bz2".to_owned(),
            url: Url::parse("https://example.com/pkg-1.0-0.tar.bz2").unwrap(),
            channel: "test".to_owned(),
        });
        record.files = files.iter().map(PathBuf::from).collect();
        record.write_to_prefix(prefix).unwrap();
        record
    }

    #[test]
    fn removes_files_dirs_and_record() {
        let prefix = tempfile::tempdir().unwrap();
        let record = installed_record(prefix.path(), &["bin/tool", "lib/pkg/data.txt"]);

        unlink_package(prefix.path(), &record).unwrap();

        assert!(!prefix.path().join("bin/tool").exists());
        assert!(!prefix.path().join("lib/pkg").exists());
        assert!(!prefix.path().join("lib").exists());
        assert!(!prefix
            .path()
            .join("conda-meta/pkg-1.0-0.json")
            .exists());
        // The prefix itself must survive.
        assert!(prefix.path().exists());
    }

    #[test]
    fn shared_directories_are_kept() {
        let prefix = tempfile::tempdir().unwrap();
        let record = installed_record(prefix.path(), &["bin/tool"]);
        fs_err::write(prefix.path().join("bin/other"), b"other").unwrap();

        unlink_package(prefix.path(), &record).unwrap();

        assert!(!prefix.path().join("bin/tool").exists());
        assert!(prefix.path().join("bin/other").exists());
    }

    #[test]
    fn missing_files_are_tolerated() {
        let prefix = tempfile::tempdir().unwrap();
        let record = installed_record(prefix.path(), &["bin/tool"]);
        fs_err::remove_file(prefix.path().join("bin/tool")).unwrap();

        unlink_package(prefix.path(), &record).unwrap();
    }
}
