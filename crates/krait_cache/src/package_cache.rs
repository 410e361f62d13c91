//! The package cache directory: selection, presence queries and locking.

use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use krait_conda_types::{package::ArchiveType, RepoDataRecord};
use krait_digest::{compute_file_digest, Md5, Sha256};
use thiserror::Error;

/// Errors of the package cache.
#[derive(Debug, Error)]
pub enum PackageCacheError {
    /// None of the candidate directories can be created and written to.
    #[error("no writable package cache directory among {0:?}")]
    NoWritableDirectory(Vec<PathBuf>),

    /// The advisory lock could not be acquired.
    #[error("failed to lock package cache at {0}")]
    LockError(PathBuf, #[source] std::io::Error),

    /// Any other io failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// An exclusive, PID-stamped advisory lock on a cache directory. Held while
/// writing; read-only users never take it. The lock is released on drop and
/// by the OS when the holding process dies, so a stale PID stamp never
/// blocks a new writer.
#[derive(Debug)]
pub struct CacheLock {
    file: std::fs::File,
    path: PathBuf,
}

impl CacheLock {
    fn acquire(cache_dir: &Path) -> Result<Self, PackageCacheError> {
        let path = cache_dir.join(".lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| PackageCacheError::LockError(path.clone(), e))?;
        file.lock_exclusive()
            .map_err(|e| PackageCacheError::LockError(path.clone(), e))?;

        // Stamp the holder so a human inspecting a busy cache can find it.
        use std::io::{Seek, Write};
        let mut writer = &file;
        let _ = writer.seek(std::io::SeekFrom::Start(0));
        let _ = writer.set_len(0);
        let _ = writeln!(writer, "{}", std::process::id());

        Ok(Self { file, path })
    }

    /// The path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// The package cache: archives and extracted package trees keyed by
/// filename.
#[derive(Debug, Clone)]
pub struct PackageCache {
    cache_dir: PathBuf,
}

impl PackageCache {
    /// Picks the first writable directory from the ordered candidates.
    /// Missing directories are created lazily; a directory is writable iff
    /// a probe file can be created in it.
    pub fn from_search_path(candidates: &[PathBuf]) -> Result<Self, PackageCacheError> {
        for candidate in candidates {
            if fs_err::create_dir_all(candidate).is_err() {
                continue;
            }
            if is_writable(candidate) {
                return Ok(Self {
                    cache_dir: candidate.clone(),
                });
            }
            tracing::debug!(dir = %candidate.display(), "package cache candidate is not writable");
        }
        Err(PackageCacheError::NoWritableDirectory(candidates.to_vec()))
    }

    /// Uses exactly the given directory, creating it when missing.
    pub fn at(cache_dir: impl Into<PathBuf>) -> Result<Self, PackageCacheError> {
        let cache_dir = cache_dir.into();
        fs_err::create_dir_all(&cache_dir)?;
        Ok(Self { cache_dir })
    }

    /// The directory of this cache.
    pub fn dir(&self) -> &Path {
        &self.cache_dir
    }

    /// The path the archive of a record is stored at.
    pub fn archive_path(&self, record: &RepoDataRecord) -> PathBuf {
        self.cache_dir.join(&record.file_name)
    }

    /// The directory the archive of a record is extracted to.
    pub fn extracted_dir(&self, record: &RepoDataRecord) -> PathBuf {
        let stem = ArchiveType::split_str(&record.file_name)
            .map_or(record.file_name.as_str(), |(stem, _)| stem);
        self.cache_dir.join(stem)
    }

    /// Returns whether a package is present in the cache: either its
    /// archive validates against the record's size and digests, or an
    /// extracted tree carries a `repodata_record.json` agreeing with the
    /// record. Once true this stays true until an explicit removal.
    pub fn query(&self, record: &RepoDataRecord) -> bool {
        self.archive_is_valid(record) || self.extracted_record_matches(record)
    }

    fn archive_is_valid(&self, record: &RepoDataRecord) -> bool {
        let path = self.archive_path(record);
        let Ok(metadata) = fs_err::metadata(&path) else {
            return false;
        };
        if let Some(expected) = record.package_record.size {
            if metadata.len() != expected {
                return false;
            }
        }
        if let Some(expected) = &record.package_record.sha256 {
            return compute_file_digest::<Sha256>(&path)
                .map_or(false, |actual| &actual == expected);
        }
        if let Some(expected) = &record.package_record.md5 {
            return compute_file_digest::<Md5>(&path).map_or(false, |actual| &actual == expected);
        }
        // Without digests only existence and size can be checked.
        record.package_record.size.is_some()
    }

    fn extracted_record_matches(&self, record: &RepoDataRecord) -> bool {
        let path = self.extracted_dir(record).join("info/repodata_record.json");
        let Ok(content) = fs_err::read_to_string(&path) else {
            return false;
        };
        let Ok(cached) = serde_json::from_str::<RepoDataRecord>(&content) else {
            tracing::warn!(path = %path.display(), "unreadable repodata_record.json in cache");
            return false;
        };
        cached.package_record.name == record.package_record.name
            && cached.package_record.version == record.package_record.version
            && cached.package_record.build == record.package_record.build
            && cached.url == record.url
    }

    /// Writes the `repodata_record.json` of a freshly extracted package.
    pub fn write_extracted_record(
        &self,
        record: &RepoDataRecord,
    ) -> Result<(), PackageCacheError> {
        let info_dir = self.extracted_dir(record).join("info");
        fs_err::create_dir_all(&info_dir)?;
        fs_err::write(
            info_dir.join("repodata_record.json"),
            serde_json::to_string_pretty(record)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?,
        )?;
        Ok(())
    }

    /// Appends a url to the legacy `urls.txt` log, one url per line.
    pub fn append_url(&self, url: &str) -> Result<(), PackageCacheError> {
        use std::io::Write;
        let mut file = fs_err::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.cache_dir.join("urls.txt"))?;
        writeln!(file, "{url}")?;
        Ok(())
    }

    /// Takes the exclusive writer lock of this cache. Blocks until the lock
    /// is available.
    pub fn lock(&self) -> Result<CacheLock, PackageCacheError> {
        CacheLock::acquire(&self.cache_dir)
    }

    /// Removes a package's archive and extracted tree from the cache.
    pub fn remove(&self, record: &RepoDataRecord) -> Result<(), PackageCacheError> {
        let archive = self.archive_path(record);
        if archive.exists() {
            fs_err::remove_file(&archive)?;
        }
        let extracted = self.extracted_dir(record);
        if extracted.exists() {
            fs_err::remove_dir_all(&extracted)?;
        }
        Ok(())
    }
}

fn is_writable(dir: &Path) -> bool {
    tempfile::Builder::new()
        .prefix(".writable-probe")
        .tempfile_in(dir)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use krait_conda_types::{PackageRecord, Version};
    use url::Url;

    use super::*;

    fn record(name: &str, content: Option<&[u8]>) -> RepoDataRecord {
        let mut package_record = PackageRecord::new(name, Version::from_str("1.0").unwrap(), "0");
        if let Some(content) = content {
            package_record.size = Some(content.len() as u64);
            package_record.sha256 = Some(krait_digest::compute_bytes_digest::<Sha256>(content));
        }
        RepoDataRecord {
            file_name: format!("{name}-1.0-0.tar.bz2"),
            url: Url::parse(&format!("https://example.com/{name}-1.0-0.tar.bz2")).unwrap(),
            channel: "test".to_owned(),
            package_record,
        }
    }

    #[test]
    fn first_writable_directory_wins() {
        let base = tempfile::tempdir().unwrap();
        let unwritable = base.path().join("file-not-dir");
        fs_err::write(&unwritable, b"occupied").unwrap();
        let writable = base.path().join("pkgs");

        let cache =
            PackageCache::from_search_path(&[unwritable.clone(), writable.clone()]).unwrap();
        assert_eq!(cache.dir(), writable);
    }

    #[test]
    fn no_writable_directory_is_an_error() {
        let base = tempfile::tempdir().unwrap();
        let occupied = base.path().join("occupied");
        fs_err::write(&occupied, b"x").unwrap();
        assert!(matches!(
            PackageCache::from_search_path(&[occupied]),
            Err(PackageCacheError::NoWritableDirectory(_))
        ));
    }

    #[test]
    fn query_validates_archive_digests() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PackageCache::at(dir.path()).unwrap();
        let content = b"pretend this is a tarball";
        let record = record("pkg", Some(content));

        assert!(!cache.query(&record));

        fs_err::write(cache.archive_path(&record), content).unwrap();
        assert!(cache.query(&record));

        // Corrupt content of the right size fails the digest check.
        fs_err::write(cache.archive_path(&record), b"pretend this is x tarball").unwrap();
        assert!(!cache.query(&record));
    }

    #[test]
    fn query_accepts_matching_extracted_record() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PackageCache::at(dir.path()).unwrap();
        let record = record("pkg", None);

        cache.write_extracted_record(&record).unwrap();
        assert!(cache.query(&record));

        // A different version does not satisfy the query.
        let mut other = record.clone();
        other.package_record.version = Version::from_str("2.0").unwrap();
        assert!(!cache.query(&other));
    }

    #[test]
    fn urls_txt_is_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PackageCache::at(dir.path()).unwrap();
        cache.append_url("https://example.com/a-1.0-0.conda").unwrap();
        cache.append_url("https://example.com/b-2.0-0.conda").unwrap();
        let content = fs_err::read_to_string(dir.path().join("urls.txt")).unwrap();
        assert_eq!(
            content,
            "https://example.com/a-1.0-0.conda\nhttps://example.com/b-2.0-0.conda\n"
        );
    }

    #[test]
    fn lock_stamps_pid_and_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PackageCache::at(dir.path()).unwrap();

        let lock = cache.lock().unwrap();
        let stamp = fs_err::read_to_string(lock.path()).unwrap();
        assert_eq!(stamp.trim(), std::process::id().to_string());
        drop(lock);

        // Re-acquirable after release.
        let _again = cache.lock().unwrap();
    }
}
