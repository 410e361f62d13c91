//! Executing a solved transaction against a prefix.
//!
//! Execution has two phases. The fetch phase brings every package the
//! transaction installs into the package cache: missing archives are
//! downloaded (validated by size and digest) and extracted. The link phase
//! walks the ordered steps, unlinking and linking in dependency order while
//! keeping a rollback stack; a failure or interrupt unwinds every executed
//! operation before the error is returned. On success the user request is
//! appended to the prefix history.

use krait_cache::{extract::ExtractError, PackageCache, PackageCacheError};
use krait_conda_types::{
    History, HistoryEntry, Platform, PrefixData, PrefixRecord, RepoDataRecord,
};
use krait_fetch::{DownloadError, DownloadTarget, MultiDownload};
use krait_solve::Transaction;
use thiserror::Error;

use super::{link_package, unlink_package, LinkError, UnlinkError};

/// Options of one transaction execution.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// When set, nothing is executed; the gate the caller's prompt/dry-run
    /// handling sits behind.
    pub dry_run: bool,
    /// The command line recorded in the history entry.
    pub command_line: Option<String>,
    /// The specs the user asked for, recorded in the history entry.
    pub requested_specs: Vec<String>,
    /// The specs recorded as updates in the history entry.
    pub update_specs: Vec<String>,
    /// The specs recorded as removals in the history entry.
    pub remove_specs: Vec<String>,
}

/// An error during transaction execution. Link-phase errors imply that the
/// already-executed operations were rolled back.
#[derive(Debug, Error)]
pub enum ExecuteError {
    /// A package download failed.
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// The package cache failed.
    #[error(transparent)]
    Cache(#[from] PackageCacheError),

    /// Extracting an archive failed.
    #[error(transparent)]
    Extract(#[from] ExtractError),

    /// Linking failed; the transaction was rolled back.
    #[error("failed to link package, transaction rolled back")]
    Link(#[source] LinkError),

    /// Unlinking failed; the transaction was rolled back.
    #[error("failed to unlink package, transaction rolled back")]
    Unlink(#[source] UnlinkError),

    /// The interrupt flag was observed; the transaction was rolled back.
    #[error("transaction interrupted")]
    Interrupted,

    /// Reading the prefix state failed.
    #[error(transparent)]
    Prefix(#[from] krait_conda_types::PrefixDataError),

    /// Appending the history entry failed.
    #[error(transparent)]
    History(#[from] krait_conda_types::HistoryError),
}

impl ExecuteError {
    /// True when the failure was an interrupt.
    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            ExecuteError::Interrupted | ExecuteError::Download(DownloadError::Interrupted)
        )
    }
}

/// One executed operation on the rollback stack.
enum ExecutedOp {
    Linked(PrefixRecord),
    Unlinked(PrefixRecord),
}

/// Executes the transaction against the prefix.
pub async fn execute(
    transaction: &Transaction,
    prefix: &std::path::Path,
    platform: Platform,
    cache: &PackageCache,
    downloader: &MultiDownload,
    options: &ExecuteOptions,
) -> Result<(), ExecuteError> {
    if options.dry_run {
        tracing::info!(steps = transaction.steps.len(), "dry run, nothing executed");
        return Ok(());
    }

    fetch_missing_packages(transaction, cache, downloader).await?;

    let prefix_data = PrefixData::from_prefix(prefix)?;
    let mut executed: Vec<ExecutedOp> = Vec::new();

    for step in &transaction.steps {
        if downloader.cancellation().is_cancelled() {
            rollback(prefix, platform, executed);
            return Err(ExecuteError::Interrupted);
        }

        // Unlink side first, then the paired link.
        if let Some(old) = step.record_to_remove() {
            match find_installed(&prefix_data, &executed, &old.package_record.name) {
                Some(record) => {
                    if let Err(e) = unlink_package(prefix, &record) {
                        rollback(prefix, platform, executed);
                        return Err(ExecuteError::Unlink(e));
                    }
                    executed.push(ExecutedOp::Unlinked(record));
                }
                None => {
                    tracing::warn!(
                        package = %old.package_record,
                        "no prefix record for package scheduled for removal"
                    );
                }
            }
        }
        if let Some(new) = step.record_to_install() {
            let package_dir = cache.extracted_dir(new);
            match link_package(new, &package_dir, prefix, platform) {
                Ok(record) => executed.push(ExecutedOp::Linked(record)),
                Err(e) => {
                    rollback(prefix, platform, executed);
                    return Err(ExecuteError::Link(e));
                }
            }
        }
    }

    append_history(transaction, prefix, options)?;
    Ok(())
}

/// Downloads and extracts every package the transaction installs that the
/// cache does not already hold. The cache's writer lock is held throughout.
async fn fetch_missing_packages(
    transaction: &Transaction,
    cache: &PackageCache,
    downloader: &MultiDownload,
) -> Result<(), ExecuteError> {
    let missing: Vec<&RepoDataRecord> = transaction
        .records_to_install()
        .filter(|record| !cache.query(record))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    let _lock = cache.lock()?;

    let targets: Vec<DownloadTarget> = missing
        .iter()
        .map(|record| DownloadTarget {
            url: record.url.clone(),
            destination: cache.archive_path(record),
            expected_size: record.package_record.size,
            sha256: record.package_record.sha256,
            md5: record.package_record.md5,
            etag: None,
            last_modified: None,
        })
        .collect();

    let results = downloader.run(targets, None).await;
    for (record, result) in missing.iter().zip(results) {
        result?;
        // Extraction is serialized internally; see krait_cache::extract.
        krait_cache::extract::extract(&cache.archive_path(record), &cache.extracted_dir(record))?;
        cache.write_extracted_record(record)?;
        cache.append_url(record.url.as_str())?;
    }
    Ok(())
}

/// The record of the currently installed package with the given name, taking
/// the operations of this very transaction into account.
fn find_installed(
    prefix_data: &PrefixData,
    executed: &[ExecutedOp],
    name: &str,
) -> Option<PrefixRecord> {
    // A record linked earlier in this transaction wins over the on-disk
    // state read before execution started.
    for op in executed.iter().rev() {
        if let ExecutedOp::Linked(record) = op {
            if record.repodata_record.package_record.name == name {
                return Some(record.clone());
            }
        }
    }
    prefix_data.get(name).cloned()
}

/// Unwinds executed operations in reverse order. Rollback is best-effort:
/// individual failures are logged, not propagated.
fn rollback(prefix: &std::path::Path, platform: Platform, mut executed: Vec<ExecutedOp>) {
    tracing::warn!(ops = executed.len(), "rolling back transaction");
    while let Some(op) = executed.pop() {
        match op {
            ExecutedOp::Linked(record) => {
                if let Err(e) = unlink_package(prefix, &record) {
                    tracing::error!(
                        package = %record.repodata_record.package_record,
                        "rollback failed to unlink: {e}"
                    );
                }
            }
            ExecutedOp::Unlinked(record) => {
                let Some(package_dir) = record.extracted_package_dir.clone() else {
                    tracing::error!(
                        package = %record.repodata_record.package_record,
                        "rollback cannot relink without an extracted package dir"
                    );
                    continue;
                };
                if let Err(e) =
                    link_package(&record.repodata_record, &package_dir, prefix, platform)
                {
                    tracing::error!(
                        package = %record.repodata_record.package_record,
                        "rollback failed to relink: {e}"
                    );
                }
            }
        }
    }
}

fn append_history(
    transaction: &Transaction,
    prefix: &std::path::Path,
    options: &ExecuteOptions,
) -> Result<(), ExecuteError> {
    let mut entry = HistoryEntry::prefilled();
    entry.cmd.clone_from(&options.command_line);
    entry.requested_specs.clone_from(&options.requested_specs);
    entry.update_specs.clone_from(&options.update_specs);
    entry.remove_specs.clone_from(&options.remove_specs);
    entry.unlink_dists = transaction
        .records_to_remove()
        .map(|record| record.package_record.dist_str())
        .collect();
    entry.link_dists = transaction
        .records_to_install()
        .map(|record| record.package_record.dist_str())
        .collect();
    History::from_prefix(prefix).add_entry(&entry)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use krait_conda_types::{PackageRecord, Version};
    use krait_fetch::Cancellation;
    use krait_solve::TransactionStep;
    use url::Url;

    use super::*;

    fn downloader() -> MultiDownload {
        MultiDownload::with_defaults(reqwest_middleware_client())
    }

    fn reqwest_middleware_client() -> reqwest_middleware::ClientWithMiddleware {
        reqwest_middleware::ClientWithMiddleware::from(reqwest::Client::new())
    }

    fn test_record(name: &str, version: &str) -> RepoDataRecord {
        RepoDataRecord {
            package_record: PackageRecord::new(name, Version::from_str(version).unwrap(), "0"),
            file_name: format!("{name}-{version}-0.tar.bz2"),
            url: Url::parse(&format!("https://example.com/{name}-{version}-0.tar.bz2")).unwrap(),
            channel: "test".to_owned(),
        }
    }

    /// Puts a fake extracted package into the cache: payload files plus the
    /// metadata link_package consumes.
    fn seed_cache(cache: &PackageCache, record: &RepoDataRecord, files: &[(&str, &str)]) {
        let dir = cache.extracted_dir(record);
        fs_err::create_dir_all(dir.join("info")).unwrap();
        let mut entries = Vec::new();
        for (path, content) in files {
            let full = dir.join(path);
            fs_err::create_dir_all(full.parent().unwrap()).unwrap();
            fs_err::write(&full, content).unwrap();
            entries.push(format!(
                r#"{{"_path": "{path}", "path_type": "hardlink", "size_in_bytes": {}}}"#,
                content.len()
            ));
        }
        fs_err::write(
            dir.join("info/paths.json"),
            format!(
                r#"{{"paths": [{}], "paths_version": 1}}"#,
                entries.join(", ")
            ),
        )
        .unwrap();
        fs_err::write(
            dir.join("info/index.json"),
            format!(
                r#"{{"name": "{}", "version": "{}", "build": "0"}}"#,
                record.package_record.name, record.package_record.version
            ),
        )
        .unwrap();
        cache.write_extracted_record(record).unwrap();
    }

    fn single_install(record: RepoDataRecord) -> Transaction {
        Transaction {
            steps: vec![TransactionStep::Install(record)],
        }
    }

    #[tokio::test]
    async fn install_links_files_and_appends_history() {
        let cache_dir = tempfile::tempdir().unwrap();
        let prefix = tempfile::tempdir().unwrap();
        let cache = PackageCache::at(cache_dir.path()).unwrap();
        let record = test_record("tool", "1.0");
        seed_cache(&cache, &record, &[("bin/tool", "payload")]);

        let history = History::from_prefix(prefix.path());
        let before = history.parse().unwrap().len();

        execute(
            &single_install(record.clone()),
            prefix.path(),
            Platform::current(),
            &cache,
            &downloader(),
            &ExecuteOptions {
                command_line: Some("install tool".to_owned()),
                requested_specs: vec!["tool".to_owned()],
                ..ExecuteOptions::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(
            fs_err::read_to_string(prefix.path().join("bin/tool")).unwrap(),
            "payload"
        );
        assert!(prefix
            .path()
            .join("conda-meta/tool-1.0-0.json")
            .exists());

        let entries = history.parse().unwrap();
        assert_eq!(entries.len(), before + 1);
        assert_eq!(entries.last().unwrap().link_dists, vec!["tool-1.0-0"]);
    }

    #[tokio::test]
    async fn remove_unlinks_files_and_record() {
        let cache_dir = tempfile::tempdir().unwrap();
        let prefix = tempfile::tempdir().unwrap();
        let cache = PackageCache::at(cache_dir.path()).unwrap();
        let record = test_record("tool", "1.0");
        seed_cache(&cache, &record, &[("bin/tool", "payload")]);

        execute(
            &single_install(record.clone()),
            prefix.path(),
            Platform::current(),
            &cache,
            &downloader(),
            &ExecuteOptions::default(),
        )
        .await
        .unwrap();

        let removal = Transaction {
            steps: vec![TransactionStep::Remove(record)],
        };
        execute(
            &removal,
            prefix.path(),
            Platform::current(),
            &cache,
            &downloader(),
            &ExecuteOptions::default(),
        )
        .await
        .unwrap();

        assert!(!prefix.path().join("bin/tool").exists());
        assert!(!prefix.path().join("conda-meta/tool-1.0-0.json").exists());
    }

    #[tokio::test]
    async fn upgrade_replaces_the_old_version() {
        let cache_dir = tempfile::tempdir().unwrap();
        let prefix = tempfile::tempdir().unwrap();
        let cache = PackageCache::at(cache_dir.path()).unwrap();
        let old = test_record("tool", "1.0");
        let new = test_record("tool", "2.0");
        seed_cache(&cache, &old, &[("bin/tool", "old payload")]);
        seed_cache(&cache, &new, &[("bin/tool", "new payload")]);

        execute(
            &single_install(old.clone()),
            prefix.path(),
            Platform::current(),
            &cache,
            &downloader(),
            &ExecuteOptions::default(),
        )
        .await
        .unwrap();

        let upgrade = Transaction {
            steps: vec![TransactionStep::Upgraded { old, new }],
        };
        execute(
            &upgrade,
            prefix.path(),
            Platform::current(),
            &cache,
            &downloader(),
            &ExecuteOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(
            fs_err::read_to_string(prefix.path().join("bin/tool")).unwrap(),
            "new payload"
        );
        assert!(!prefix.path().join("conda-meta/tool-1.0-0.json").exists());
        assert!(prefix.path().join("conda-meta/tool-2.0-0.json").exists());
    }

    #[tokio::test]
    async fn link_failure_rolls_back_previous_steps() {
        let cache_dir = tempfile::tempdir().unwrap();
        let prefix = tempfile::tempdir().unwrap();
        let cache = PackageCache::at(cache_dir.path()).unwrap();

        let good = test_record("good", "1.0");
        seed_cache(&cache, &good, &[("bin/good", "fine")]);

        // The broken package's paths.json names a file that does not exist
        // in the extracted tree, so linking it must fail.
        let broken = test_record("broken", "1.0");
        seed_cache(&cache, &broken, &[("bin/present", "x")]);
        fs_err::remove_file(cache.extracted_dir(&broken).join("bin/present")).unwrap();

        let transaction = Transaction {
            steps: vec![
                TransactionStep::Install(good),
                TransactionStep::Install(broken),
            ],
        };
        let result = execute(
            &transaction,
            prefix.path(),
            Platform::current(),
            &cache,
            &downloader(),
            &ExecuteOptions::default(),
        )
        .await;

        assert!(matches!(result, Err(ExecuteError::Link(_))));
        // The successfully linked package was rolled back again.
        assert!(!prefix.path().join("bin/good").exists());
        assert!(!prefix.path().join("conda-meta/good-1.0-0.json").exists());
        // No history entry for a failed transaction.
        assert!(History::from_prefix(prefix.path()).parse().unwrap().is_empty());
    }

    #[tokio::test]
    async fn interrupt_before_execution_changes_nothing() {
        let cache_dir = tempfile::tempdir().unwrap();
        let prefix = tempfile::tempdir().unwrap();
        let cache = PackageCache::at(cache_dir.path()).unwrap();
        let record = test_record("tool", "1.0");
        seed_cache(&cache, &record, &[("bin/tool", "payload")]);

        let cancellation = Cancellation::new();
        cancellation.cancel();
        let downloader = MultiDownload::new(
            reqwest_middleware_client(),
            2,
            krait_fetch::RetryPolicy::default(),
            cancellation,
        );

        let result = execute(
            &single_install(record),
            prefix.path(),
            Platform::current(),
            &cache,
            &downloader,
            &ExecuteOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(ExecuteError::Interrupted)));
        assert!(!prefix.path().join("bin/tool").exists());
    }

    #[tokio::test]
    async fn fetch_phase_downloads_and_extracts() {
        let cache_dir = tempfile::tempdir().unwrap();
        let prefix = tempfile::tempdir().unwrap();
        let served = tempfile::tempdir().unwrap();
        let cache = PackageCache::at(cache_dir.path()).unwrap();

        // Build a real .tar.bz2 archive served from a file:// url.
        let archive_path = served.path().join("tool-1.0-0.tar.bz2");
        {
            let file = fs_err::File::create(&archive_path).unwrap();
            let encoder = bzip2::write::BzEncoder::new(file, bzip2::Compression::fast());
            let mut builder = tar::Builder::new(encoder);
            for (name, content) in [
                ("bin/tool", "payload".as_bytes()),
                (
                    "info/index.json",
                    br#"{"name": "tool", "version": "1.0", "build": "0"}"# as &[u8],
                ),
                (
                    "info/paths.json",
                    br#"{"paths": [{"_path": "bin/tool", "path_type": "hardlink", "size_in_bytes": 7}], "paths_version": 1}"#,
                ),
            ] {
                let mut header = tar::Header::new_gnu();
                header.set_size(content.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, name, content).unwrap();
            }
            builder.into_inner().unwrap().finish().unwrap();
        }

        let mut record = test_record("tool", "1.0");
        record.url = Url::from_file_path(&archive_path).unwrap();
        record.package_record.size =
            Some(fs_err::metadata(&archive_path).unwrap().len());

        execute(
            &single_install(record.clone()),
            prefix.path(),
            Platform::current(),
            &cache,
            &downloader(),
            &ExecuteOptions::default(),
        )
        .await
        .unwrap();

        // Archive cached, tree extracted, record written, url logged.
        assert!(cache.archive_path(&record).exists());
        assert!(cache
            .extracted_dir(&record)
            .join("info/repodata_record.json")
            .exists());
        assert!(cache.query(&record));
        let urls = fs_err::read_to_string(cache_dir.path().join("urls.txt")).unwrap();
        assert!(urls.contains("tool-1.0-0.tar.bz2"));
        // And the package is linked.
        assert_eq!(
            fs_err::read_to_string(prefix.path().join("bin/tool")).unwrap(),
            "payload"
        );
    }

    #[tokio::test]
    async fn dry_run_is_a_no_op() {
        let cache_dir = tempfile::tempdir().unwrap();
        let prefix = tempfile::tempdir().unwrap();
        let cache = PackageCache::at(cache_dir.path()).unwrap();
        let record = test_record("tool", "1.0");
        seed_cache(&cache, &record, &[("bin/tool", "payload")]);

        execute(
            &single_install(record),
            prefix.path(),
            Platform::current(),
            &cache,
            &downloader(),
            &ExecuteOptions {
                dry_run: true,
                ..ExecuteOptions::default()
            },
        )
        .await
        .unwrap();
        assert!(!prefix.path().join("bin/tool").exists());
    }

}
