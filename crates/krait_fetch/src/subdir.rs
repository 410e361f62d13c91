//! The per-(channel, platform) repodata cache.
//!
//! Each subdir is cached under `<cache_dir>/<hash8>.json` where `hash8` is
//! the first 8 hex characters of the MD5 of the subdir's credential-free
//! repodata url. The cached json carries a preamble — `_url`, `_etag`,
//! `_mod`, `_cache_control` merged into the top-level object — which drives
//! freshness decisions and conditional refetches. A `<hash8>.solv` sidecar
//! holds the same data pre-parsed (MessagePack); it is used when its mtime
//! is at least that of the json.

use std::{
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use krait_conda_types::{Channel, Platform, RepoData};
use krait_digest::{compute_bytes_digest, Md5};
use url::Url;

use crate::{
    download::{DownloadTarget, MultiDownload},
    error::SubdirError,
};

/// Which repodata encoding to request from the server. The downloader picks
/// the decompressor from the url suffix.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum RepodataEncoding {
    /// Plain `repodata.json`.
    #[default]
    Json,
    /// `repodata.json.bz2`.
    Bz2,
    /// `repodata.json.zst`.
    Zst,
}

impl RepodataEncoding {
    fn file_name(self) -> &'static str {
        match self {
            RepodataEncoding::Json => "repodata.json",
            RepodataEncoding::Bz2 => "repodata.json.bz2",
            RepodataEncoding::Zst => "repodata.json.zst",
        }
    }
}

/// Configuration of the repodata cache.
#[derive(Debug, Clone)]
pub struct SubdirConfig {
    /// The cache directory, usually `<pkgs_dir>/cache`.
    pub cache_dir: PathBuf,
    /// Overrides the server-provided `max-age`, in seconds. `None` honors
    /// the `_cache_control` preamble.
    pub local_repodata_ttl: Option<u64>,
    /// When set, the cache is always trusted and the network never used.
    pub offline: bool,
    /// The encoding to request.
    pub encoding: RepodataEncoding,
}

impl SubdirConfig {
    /// Creates a config with default freshness rules for the given cache
    /// directory.
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            local_repodata_ttl: None,
            offline: false,
            encoding: RepodataEncoding::default(),
        }
    }
}

/// How a load was satisfied.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CacheResult {
    /// The cache was within its max-age (or offline mode was on).
    FromDiskFresh,
    /// A conditional request returned 304; only the mtime was bumped.
    FromDiskConditional304,
    /// Fresh repodata was downloaded and persisted.
    Downloaded,
}

/// The result of [`SubdirData::load`].
#[derive(Debug)]
pub struct SubdirFetchResult {
    /// The parsed repodata.
    pub repo_data: RepoData,
    /// How the data was obtained.
    pub cache_result: CacheResult,
    /// The cache file the data lives in.
    pub path: PathBuf,
}

/// The repodata index of one (channel, platform) pair.
#[derive(Debug)]
pub struct SubdirData {
    channel: Channel,
    platform: Platform,
    config: SubdirConfig,
}

impl SubdirData {
    /// Creates a handle for one subdir of a channel.
    pub fn new(channel: Channel, platform: Platform, config: SubdirConfig) -> Self {
        Self {
            channel,
            platform,
            config,
        }
    }

    /// The channel this subdir belongs to.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// The platform of this subdir.
    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// The url the repodata is fetched from, including credentials.
    pub fn repodata_url(&self) -> Url {
        self.channel
            .platform_url(self.platform, true)
            .join(self.config.encoding.file_name())
            .expect("repodata filename is a valid url fragment")
    }

    /// The credential-free url that keys the cache.
    fn cache_key_url(&self) -> Url {
        self.channel
            .platform_url(self.platform, false)
            .join(self.config.encoding.file_name())
            .expect("repodata filename is a valid url fragment")
    }

    /// The `<hash8>.json` path of this subdir.
    pub fn cache_path(&self) -> PathBuf {
        self.config
            .cache_dir
            .join(format!("{}.json", cache_hash(self.cache_key_url().as_str())))
    }

    /// The `<hash8>.solv` sidecar path.
    pub fn solv_path(&self) -> PathBuf {
        self.cache_path().with_extension("solv")
    }

    /// Loads the repodata for this subdir, going to the network only when
    /// the cache is missing or stale.
    pub async fn load(
        &self,
        downloader: &MultiDownload,
    ) -> Result<SubdirFetchResult, SubdirError> {
        let json_path = self.cache_path();
        let cached = self.read_cache(&json_path)?;

        if let Some(cached) = &cached {
            if self.config.offline || self.is_fresh(cached, &json_path) {
                tracing::debug!(url = %self.cache_key_url(), "repodata cache is fresh");
                return Ok(SubdirFetchResult {
                    repo_data: cached.clone(),
                    cache_result: CacheResult::FromDiskFresh,
                    path: json_path,
                });
            }
        } else if self.config.offline {
            return Err(SubdirError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("offline mode and no cached repodata for {}", self.cache_key_url()),
            )));
        }

        // Stale or missing: issue a (possibly conditional) request into a
        // temporary download location.
        fs_err::create_dir_all(&self.config.cache_dir)?;
        let download_path = json_path.with_extension("json.new");
        let mut target = DownloadTarget::new(self.repodata_url(), download_path.clone());
        if let Some(cached) = &cached {
            target.etag.clone_from(&cached.etag);
            target.last_modified.clone_from(&cached.last_modified);
        }

        let result = downloader.download(target, None).await?;

        if result.unchanged {
            // 304: the cached content is still valid, only refresh its age.
            let cached = cached.expect("a 304 can only answer a conditional request");
            filetime::set_file_mtime(&json_path, filetime::FileTime::now())?;
            return Ok(SubdirFetchResult {
                repo_data: cached,
                cache_result: CacheResult::FromDiskConditional304,
                path: json_path,
            });
        }

        // Parse the downloaded body and merge the preamble before persisting.
        let content = fs_err::read_to_string(&download_path)?;
        let mut repo_data: RepoData = serde_json::from_str(&content)
            .map_err(|e| SubdirError::InvalidRepoData(download_path.clone(), e))?;
        fs_err::remove_file(&download_path)?;
        repo_data.url = Some(self.cache_key_url().to_string());
        repo_data.etag = result.etag;
        repo_data.last_modified = result.last_modified;
        repo_data.cache_control = result.cache_control;

        self.persist(&repo_data, &json_path)?;

        Ok(SubdirFetchResult {
            repo_data,
            cache_result: CacheResult::Downloaded,
            path: json_path,
        })
    }

    /// Reads the cached repodata, preferring the pre-parsed sidecar when it
    /// is at least as new as the json.
    fn read_cache(&self, json_path: &Path) -> Result<Option<RepoData>, SubdirError> {
        let json_mtime = match fs_err::metadata(json_path) {
            Ok(metadata) => metadata.modified()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let solv_path = self.solv_path();
        if let Ok(solv_meta) = fs_err::metadata(&solv_path) {
            if solv_meta.modified().map_or(false, |m| m >= json_mtime) {
                match fs_err::read(&solv_path)
                    .ok()
                    .and_then(|bytes| rmp_serde::from_slice::<RepoData>(&bytes).ok())
                {
                    Some(repo_data) => return Ok(Some(repo_data)),
                    None => {
                        tracing::warn!(path = %solv_path.display(), "discarding unreadable repodata sidecar");
                        let _ = fs_err::remove_file(&solv_path);
                    }
                }
            }
        }

        let content = fs_err::read_to_string(json_path)?;
        let repo_data = serde_json::from_str(&content)
            .map_err(|e| SubdirError::InvalidRepoData(json_path.to_path_buf(), e))?;
        Ok(Some(repo_data))
    }

    /// Applies the freshness rule: the cache is fresh while its age is below
    /// the configured ttl or the `max-age` of its preamble.
    fn is_fresh(&self, cached: &RepoData, json_path: &Path) -> bool {
        let max_age = match self.config.local_repodata_ttl {
            Some(ttl) => ttl,
            None => cached
                .cache_control
                .as_deref()
                .and_then(max_age_from_cache_control)
                .unwrap_or(0),
        };
        if max_age == 0 {
            return false;
        }
        let Ok(mtime) = fs_err::metadata(json_path).and_then(|m| m.modified()) else {
            return false;
        };
        SystemTime::now()
            .duration_since(mtime)
            .map_or(false, |age| age < Duration::from_secs(max_age))
    }

    /// Writes the merged repodata atomically: temp file in the cache dir,
    /// fsync, rename. The sidecar is written afterwards so its mtime is
    /// never older than the json's.
    fn persist(&self, repo_data: &RepoData, json_path: &Path) -> Result<(), SubdirError> {
        let mut temp = tempfile::NamedTempFile::new_in(&self.config.cache_dir)?;
        serde_json::to_writer(&mut temp, repo_data)
            .map_err(|e| SubdirError::InvalidRepoData(json_path.to_path_buf(), e))?;
        temp.flush()?;
        temp.as_file().sync_all()?;
        temp.persist(json_path).map_err(|e| e.error)?;

        let solv_bytes = rmp_serde::to_vec_named(repo_data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs_err::write(self.solv_path(), solv_bytes)?;
        Ok(())
    }
}

/// Loads all subdirs of a channel for the given platforms. The `noarch`
/// subdir is mandatory: its failure fails the channel. Any other subdir
/// failure is downgraded to a warning and an empty contribution.
pub async fn fetch_channel(
    channel: &Channel,
    default_platforms: &[Platform],
    config: &SubdirConfig,
    downloader: &MultiDownload,
) -> Result<Vec<(Platform, RepoData)>, SubdirError> {
    let mut results = Vec::new();
    for platform in channel.platforms_or(default_platforms) {
        let subdir = SubdirData::new(channel.clone(), platform, config.clone());
        match subdir.load(downloader).await {
            Ok(result) => results.push((platform, result.repo_data)),
            Err(error) if platform == Platform::NoArch => {
                return Err(SubdirError::NoArchUnavailable {
                    channel: channel.canonical_name(),
                    source: Box::new(error),
                });
            }
            Err(error) => {
                tracing::warn!(
                    channel = %channel.canonical_name(),
                    platform = %platform,
                    "failed to fetch subdir, ignoring: {error}"
                );
            }
        }
    }
    Ok(results)
}

/// First 8 hex characters of the MD5 of the url.
fn cache_hash(url: &str) -> String {
    format!("{:x}", compute_bytes_digest::<Md5>(url))[..8].to_owned()
}

/// Extracts `max-age=<N>` from a `Cache-Control` header value.
fn max_age_from_cache_control(value: &str) -> Option<u64> {
    lazy_regex::regex_captures!(r"max-age=(\d+)", value).and_then(|(_, secs)| secs.parse().ok())
}
