//! Multi-target streaming downloads.
//!
//! A [`DownloadTarget`] names a url, a destination file, and optional
//! validation data (size, digests) and cache headers. A [`MultiDownload`]
//! drives up to `max_concurrent` transfers at once; targets complete in
//! arbitrary order. Bodies are streamed straight into a `.part` sibling of
//! the destination (never into memory), hashed on the fly, optionally
//! decompressed, and atomically renamed into place on success.

use std::{
    io::ErrorKind,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{stream, StreamExt};
use krait_digest::{digest::Digest, Md5, Md5Hash, Sha256, Sha256Hash};
use reqwest::{header, StatusCode};
use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use url::Url;

use crate::error::{Cancellation, DownloadError};

/// Abort a transfer that stays below this many bytes per second...
const LOW_SPEED_LIMIT: u64 = 30;
/// ...for this long.
const LOW_SPEED_TIME: Duration = Duration::from_secs(60);
/// Minimum interval between two progress callbacks for one target.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(166);

/// How transient download failures are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// How often a failed target is retried before giving up.
    pub max_retries: u32,
    /// The wait before the first retry.
    pub backoff_base: Duration,
    /// The factor the wait grows by after every attempt.
    pub backoff_factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(2),
            backoff_factor: 3,
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base * self.backoff_factor.saturating_pow(attempt)
    }
}

/// One file to download.
#[derive(Debug, Clone)]
pub struct DownloadTarget {
    /// The url to fetch.
    pub url: Url,
    /// Where the finished file ends up.
    pub destination: PathBuf,
    /// The expected byte count of the finished file.
    pub expected_size: Option<u64>,
    /// The expected SHA256 of the finished file.
    pub sha256: Option<Sha256Hash>,
    /// The expected MD5 of the finished file; only checked when no SHA256 is
    /// present.
    pub md5: Option<Md5Hash>,
    /// A previous `ETag`, sent as `If-None-Match`.
    pub etag: Option<String>,
    /// A previous `Last-Modified`, sent as `If-Modified-Since`.
    pub last_modified: Option<String>,
}

impl DownloadTarget {
    /// Creates a target with no validation data.
    pub fn new(url: Url, destination: PathBuf) -> Self {
        Self {
            url,
            destination,
            expected_size: None,
            sha256: None,
            md5: None,
            etag: None,
            last_modified: None,
        }
    }
}

/// The outcome of one successful target.
#[derive(Debug)]
pub struct DownloadResult {
    /// The url that was fetched.
    pub url: Url,
    /// The destination path.
    pub path: PathBuf,
    /// True when the server answered 304 and nothing was written.
    pub unchanged: bool,
    /// The `ETag` of the response, if any.
    pub etag: Option<String>,
    /// The `Last-Modified` of the response, if any.
    pub last_modified: Option<String>,
    /// The `Cache-Control` of the response, if any.
    pub cache_control: Option<String>,
    /// The number of bytes written to disk.
    pub bytes: u64,
}

/// A progress report for one target.
#[derive(Debug, Clone)]
pub struct Progress {
    /// The url being fetched.
    pub url: Url,
    /// Bytes written so far.
    pub bytes: u64,
    /// Total expected bytes, when the server announced them.
    pub total: Option<u64>,
}

/// A rate-limited progress callback.
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Drives several downloads with bounded concurrency.
pub struct MultiDownload {
    client: reqwest_middleware::ClientWithMiddleware,
    max_concurrent: usize,
    retry_policy: RetryPolicy,
    cancellation: Cancellation,
}

impl MultiDownload {
    /// Creates a new instance over the given client.
    pub fn new(
        client: reqwest_middleware::ClientWithMiddleware,
        max_concurrent: usize,
        retry_policy: RetryPolicy,
        cancellation: Cancellation,
    ) -> Self {
        Self {
            client,
            max_concurrent: max_concurrent.max(1),
            retry_policy,
            cancellation,
        }
    }

    /// Creates an instance with default concurrency (5) and retry policy.
    pub fn with_defaults(client: reqwest_middleware::ClientWithMiddleware) -> Self {
        Self::new(client, 5, RetryPolicy::default(), Cancellation::new())
    }

    /// Returns the shared cancellation flag.
    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    /// Downloads all targets. The result vector is in target order even
    /// though transfers complete in arbitrary order.
    pub async fn run(
        &self,
        targets: Vec<DownloadTarget>,
        progress: Option<ProgressCallback>,
    ) -> Vec<Result<DownloadResult, DownloadError>> {
        let mut results: Vec<Option<Result<DownloadResult, DownloadError>>> =
            targets.iter().map(|_| None).collect();

        let mut stream = stream::iter(targets.into_iter().enumerate())
            .map(|(index, target)| {
                let progress = progress.clone();
                async move { (index, self.download(target, progress).await) }
            })
            .buffer_unordered(self.max_concurrent);

        while let Some((index, result)) = stream.next().await {
            results[index] = Some(result);
        }
        drop(stream);

        results
            .into_iter()
            .map(|slot| slot.expect("every target produces a result"))
            .collect()
    }

    /// Downloads a single target, retrying transient failures.
    pub async fn download(
        &self,
        target: DownloadTarget,
        progress: Option<ProgressCallback>,
    ) -> Result<DownloadResult, DownloadError> {
        let mut attempt = 0;
        loop {
            if self.cancellation.is_cancelled() {
                return Err(DownloadError::Interrupted);
            }
            match self.download_once(&target, progress.as_ref()).await {
                Ok(result) => return Ok(result),
                Err(err) if err.is_transient() && attempt < self.retry_policy.max_retries => {
                    let wait = self.retry_policy.backoff(attempt);
                    tracing::info!(
                        url = %target.url,
                        attempt,
                        "download failed ({err}), retrying in {wait:?}"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn download_once(
        &self,
        target: &DownloadTarget,
        progress: Option<&ProgressCallback>,
    ) -> Result<DownloadResult, DownloadError> {
        if target.url.scheme() == "file" {
            return self.download_file_url(target, progress).await;
        }

        let mut request = self.client.get(target.url.clone());
        if let Some(etag) = &target.etag {
            request = request.header(header::IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &target.last_modified {
            request = request.header(header::IF_MODIFIED_SINCE, last_modified);
        }

        let response = request.send().await.map_err(|source| DownloadError::Network {
            url: target.url.clone(),
            source,
        })?;

        let headers = response.headers();
        let header_str = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(ToOwned::to_owned)
        };
        let etag = header_str(header::ETAG);
        let last_modified = header_str(header::LAST_MODIFIED);
        let cache_control = header_str(header::CACHE_CONTROL);

        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(DownloadResult {
                url: target.url.clone(),
                path: target.destination.clone(),
                unchanged: true,
                etag,
                last_modified,
                cache_control,
                bytes: 0,
            });
        }
        if !response.status().is_success() {
            return Err(DownloadError::HttpStatus {
                status: response.status().as_u16(),
                url: target.url.clone(),
            });
        }

        let total = response.content_length();
        let body = StreamReader::new(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| std::io::Error::new(ErrorKind::Other, e))),
        );
        let bytes = self
            .stream_to_destination(target, body, total, progress)
            .await?;

        Ok(DownloadResult {
            url: target.url.clone(),
            path: target.destination.clone(),
            unchanged: false,
            etag,
            last_modified,
            cache_control,
            bytes,
        })
    }

    async fn download_file_url(
        &self,
        target: &DownloadTarget,
        progress: Option<&ProgressCallback>,
    ) -> Result<DownloadResult, DownloadError> {
        let path = target
            .url
            .to_file_path()
            .map_err(|()| std::io::Error::new(ErrorKind::InvalidInput, "invalid file url"))?;
        let file = tokio::fs::File::open(&path).await?;
        let total = file.metadata().await.ok().map(|m| m.len());
        let reader = tokio::io::BufReader::new(file);
        let bytes = self
            .stream_to_destination(target, reader, total, progress)
            .await?;
        Ok(DownloadResult {
            url: target.url.clone(),
            path: target.destination.clone(),
            unchanged: false,
            etag: None,
            last_modified: None,
            cache_control: None,
            bytes,
        })
    }

    /// Streams a body into `<destination>.part`, hashing and (by url suffix)
    /// decompressing on the fly, then validates and renames into place.
    async fn stream_to_destination(
        &self,
        target: &DownloadTarget,
        body: impl AsyncBufRead + Unpin + Send,
        total: Option<u64>,
        progress: Option<&ProgressCallback>,
    ) -> Result<u64, DownloadError> {
        let mut reader: Box<dyn tokio::io::AsyncRead + Unpin + Send> =
            match compression_for_target(target) {
                Compression::Bz2 => {
                    Box::new(async_compression::tokio::bufread::BzDecoder::new(body))
                }
                Compression::Zstd => {
                    Box::new(async_compression::tokio::bufread::ZstdDecoder::new(body))
                }
                Compression::None => Box::new(body),
            };

        if let Some(parent) = target.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part_path = part_path(&target.destination);
        let mut file = tokio::fs::File::create(&part_path).await?;

        let mut sha256 = Sha256::default();
        let mut md5 = Md5::default();
        let mut written: u64 = 0;
        let mut buffer = vec![0u8; 64 * 1024];

        let mut window_start = Instant::now();
        let mut window_bytes: u64 = 0;
        let mut last_progress = Instant::now() - PROGRESS_INTERVAL;

        loop {
            if self.cancellation.is_cancelled() {
                drop(file);
                let _ = tokio::fs::remove_file(&part_path).await;
                return Err(DownloadError::Interrupted);
            }
            let read = reader.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            let chunk = &buffer[..read];
            sha256.update(chunk);
            md5.update(chunk);
            file.write_all(chunk).await?;
            written += read as u64;
            window_bytes += read as u64;

            if window_start.elapsed() >= LOW_SPEED_TIME {
                let required = LOW_SPEED_LIMIT * window_start.elapsed().as_secs();
                if window_bytes < required {
                    drop(file);
                    let _ = tokio::fs::remove_file(&part_path).await;
                    return Err(DownloadError::LowBandwidth {
                        url: target.url.clone(),
                    });
                }
                window_start = Instant::now();
                window_bytes = 0;
            }

            if let Some(progress) = progress {
                if last_progress.elapsed() >= PROGRESS_INTERVAL {
                    (progress.as_ref())(Progress {
                        url: target.url.clone(),
                        bytes: written,
                        total,
                    });
                    last_progress = Instant::now();
                }
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Some(progress) = progress {
            (progress.as_ref())(Progress {
                url: target.url.clone(),
                bytes: written,
                total,
            });
        }

        self.validate(target, &part_path, written, sha256.finalize(), md5.finalize())
            .map_err(|err| {
                let _ = std::fs::remove_file(&part_path);
                err
            })?;

        tokio::fs::rename(&part_path, &target.destination).await?;
        Ok(written)
    }

    fn validate(
        &self,
        target: &DownloadTarget,
        part_path: &std::path::Path,
        written: u64,
        sha256: Sha256Hash,
        md5: Md5Hash,
    ) -> Result<(), DownloadError> {
        if let Some(expected) = target.expected_size {
            if expected != written {
                return Err(DownloadError::Checksum {
                    path: part_path.to_path_buf(),
                    kind: "size",
                    expected: expected.to_string(),
                    actual: written.to_string(),
                });
            }
        }
        if let Some(expected) = &target.sha256 {
            if expected != &sha256 {
                return Err(DownloadError::Checksum {
                    path: part_path.to_path_buf(),
                    kind: "sha256",
                    expected: format!("{expected:x}"),
                    actual: format!("{sha256:x}"),
                });
            }
        } else if let Some(expected) = &target.md5 {
            if expected != &md5 {
                return Err(DownloadError::Checksum {
                    path: part_path.to_path_buf(),
                    kind: "md5",
                    expected: format!("{expected:x}"),
                    actual: format!("{md5:x}"),
                });
            }
        }
        Ok(())
    }
}

enum Compression {
    None,
    Bz2,
    Zstd,
}

/// Decides whether the body is decompressed while streaming. The url suffix
/// names the encoding; when the destination keeps the same suffix the caller
/// wants the compressed file itself (a package archive), so the body passes
/// through untouched.
fn compression_for_target(target: &DownloadTarget) -> Compression {
    let path = target.url.path();
    let destination = target.destination.to_string_lossy();
    let wants_raw = |suffix: &str| destination.ends_with(suffix);
    if path.ends_with(".bz2") && !wants_raw(".bz2") {
        Compression::Bz2
    } else if (path.ends_with(".zst") && !wants_raw(".zst"))
        || (path.ends_with(".zck") && !wants_raw(".zck"))
    {
        Compression::Zstd
    } else {
        Compression::None
    }
}

fn part_path(destination: &std::path::Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::SimpleChannelServer;
    use assert_matches::assert_matches;

    fn client() -> reqwest_middleware::ClientWithMiddleware {
        reqwest_middleware::ClientWithMiddleware::from(reqwest::Client::new())
    }

    fn quick_retries() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            backoff_base: Duration::from_millis(5),
            backoff_factor: 2,
        }
    }

    #[tokio::test]
    async fn downloads_to_destination() {
        let served = tempfile::tempdir().unwrap();
        std::fs::write(served.path().join("data.json"), b"{\"ok\": true}").unwrap();
        let server = SimpleChannelServer::start(served.path().to_path_buf()).await;

        let dest = tempfile::tempdir().unwrap();
        let downloader = MultiDownload::with_defaults(client());
        let target = DownloadTarget::new(
            server.url().join("data.json").unwrap(),
            dest.path().join("data.json"),
        );
        let result = downloader.download(target, None).await.unwrap();

        assert!(!result.unchanged);
        assert_eq!(result.bytes, 12);
        assert_eq!(
            std::fs::read(dest.path().join("data.json")).unwrap(),
            b"{\"ok\": true}"
        );
        // No leftover temp file.
        assert!(!dest.path().join("data.json.part").exists());
    }

    #[tokio::test]
    async fn not_modified_short_circuits() {
        let served = tempfile::tempdir().unwrap();
        std::fs::write(served.path().join("data.json"), b"payload").unwrap();
        let server = SimpleChannelServer::start(served.path().to_path_buf()).await;

        let dest = tempfile::tempdir().unwrap();
        let downloader = MultiDownload::with_defaults(client());

        let first = downloader
            .download(
                DownloadTarget::new(
                    server.url().join("data.json").unwrap(),
                    dest.path().join("data.json"),
                ),
                None,
            )
            .await
            .unwrap();
        let etag = first.etag.clone().expect("server sends an etag");

        let mut second_target = DownloadTarget::new(
            server.url().join("data.json").unwrap(),
            dest.path().join("data.json"),
        );
        second_target.etag = Some(etag);
        let second = downloader.download(second_target, None).await.unwrap();
        assert!(second.unchanged);
        assert_eq!(second.bytes, 0);
    }

    #[tokio::test]
    async fn missing_file_is_fatal() {
        let served = tempfile::tempdir().unwrap();
        let server = SimpleChannelServer::start(served.path().to_path_buf()).await;

        let dest = tempfile::tempdir().unwrap();
        let downloader = MultiDownload::new(
            client(),
            2,
            quick_retries(),
            Cancellation::new(),
        );
        let result = downloader
            .download(
                DownloadTarget::new(
                    server.url().join("missing.json").unwrap(),
                    dest.path().join("missing.json"),
                ),
                None,
            )
            .await;
        assert_matches!(
            result,
            Err(DownloadError::HttpStatus { status: 404, .. })
        );
    }

    #[tokio::test]
    async fn checksum_mismatch_is_fatal() {
        let served = tempfile::tempdir().unwrap();
        std::fs::write(served.path().join("data.bin"), b"not what you expect").unwrap();
        let server = SimpleChannelServer::start(served.path().to_path_buf()).await;

        let dest = tempfile::tempdir().unwrap();
        let downloader = MultiDownload::with_defaults(client());
        let mut target = DownloadTarget::new(
            server.url().join("data.bin").unwrap(),
            dest.path().join("data.bin"),
        );
        target.sha256 = Some(krait_digest::compute_bytes_digest::<Sha256>(b"other data"));
        let result = downloader.download(target, None).await;
        assert_matches!(
            result,
            Err(DownloadError::Checksum { kind: "sha256", .. })
        );
        assert!(!dest.path().join("data.bin").exists());
    }

    #[tokio::test]
    async fn file_urls_are_copied() {
        let served = tempfile::tempdir().unwrap();
        let source = served.path().join("local.txt");
        std::fs::write(&source, b"local bytes").unwrap();

        let dest = tempfile::tempdir().unwrap();
        let downloader = MultiDownload::with_defaults(client());
        let target = DownloadTarget::new(
            Url::from_file_path(&source).unwrap(),
            dest.path().join("local.txt"),
        );
        let result = downloader.download(target, None).await.unwrap();
        assert_eq!(result.bytes, 11);
        assert_eq!(
            std::fs::read(dest.path().join("local.txt")).unwrap(),
            b"local bytes"
        );
    }

    #[tokio::test]
    async fn cancellation_aborts_run() {
        let served = tempfile::tempdir().unwrap();
        std::fs::write(served.path().join("data.json"), b"payload").unwrap();
        let server = SimpleChannelServer::start(served.path().to_path_buf()).await;

        let cancellation = Cancellation::new();
        cancellation.cancel();
        let downloader = MultiDownload::new(client(), 2, quick_retries(), cancellation);
        let results = downloader
            .run(
                vec![DownloadTarget::new(
                    server.url().join("data.json").unwrap(),
                    tempfile::tempdir().unwrap().path().join("data.json"),
                )],
                None,
            )
            .await;
        assert_matches!(results[0], Err(DownloadError::Interrupted));
    }

    #[tokio::test]
    async fn multiple_targets_complete() {
        let served = tempfile::tempdir().unwrap();
        for i in 0..8 {
            std::fs::write(served.path().join(format!("f{i}")), format!("file-{i}")).unwrap();
        }
        let server = SimpleChannelServer::start(served.path().to_path_buf()).await;

        let dest = tempfile::tempdir().unwrap();
        let downloader = MultiDownload::new(client(), 3, quick_retries(), Cancellation::new());
        let targets = (0..8)
            .map(|i| {
                DownloadTarget::new(
                    server.url().join(&format!("f{i}")).unwrap(),
                    dest.path().join(format!("f{i}")),
                )
            })
            .collect();
        let results = downloader.run(targets, None).await;
        assert_eq!(results.len(), 8);
        for (i, result) in results.iter().enumerate() {
            let result = result.as_ref().unwrap();
            assert!(result.path.ends_with(format!("f{i}")));
            assert_eq!(
                std::fs::read_to_string(&result.path).unwrap(),
                format!("file-{i}")
            );
        }
    }
}
