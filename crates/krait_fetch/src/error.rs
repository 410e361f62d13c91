//! Error and cancellation types shared by the downloader and the repodata
//! cache.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use thiserror::Error;
use url::Url;

/// A process-wide interrupt flag. Cloning shares the underlying flag; every
/// blocking loop in the workspace polls it at well-defined points.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    /// Creates a new, unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag. Safe to call from a signal handler thread.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Returns whether the flag has been set.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// An error that occurred while downloading a single target.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// A transport-level failure (DNS, TLS, connection), after retries were
    /// exhausted.
    #[error("failed to download {url}")]
    Network {
        /// The url that failed.
        url: Url,
        /// The underlying transport error.
        #[source]
        source: reqwest_middleware::Error,
    },

    /// The server responded with a non-retryable status code.
    #[error("http status {status} for {url}")]
    HttpStatus {
        /// The status code.
        status: u16,
        /// The url that failed.
        url: Url,
    },

    /// The downloaded content did not match the expected size or digest.
    #[error("checksum mismatch for {path}: expected {kind} {expected}, got {actual}")]
    Checksum {
        /// The file that failed validation.
        path: PathBuf,
        /// The kind of check: `size`, `sha256` or `md5`.
        kind: &'static str,
        /// The expected value.
        expected: String,
        /// The observed value.
        actual: String,
    },

    /// The transfer rate stayed below 30 bytes/s for over a minute.
    #[error("transfer of {url} was too slow for too long")]
    LowBandwidth {
        /// The url that was aborted.
        url: Url,
    },

    /// An io error while writing the destination file.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The interrupt flag was observed.
    #[error("download interrupted")]
    Interrupted,
}

impl DownloadError {
    /// Returns true when the error is worth retrying: transport errors and
    /// server-side (5xx) status codes.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            DownloadError::Network { .. } => true,
            DownloadError::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// An error that occurred while loading or refreshing a repodata subdir.
#[derive(Debug, Error)]
pub enum SubdirError {
    /// The underlying download failed.
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// The cached or downloaded repodata could not be parsed.
    #[error("invalid repodata at {0}")]
    InvalidRepoData(PathBuf, #[source] serde_json::Error),

    /// An io error in the cache directory.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The mandatory `noarch` subdir of a channel could not be fetched.
    #[error("required subdir 'noarch' of channel '{channel}' is unavailable")]
    NoArchUnavailable {
        /// The channel whose noarch listing failed.
        channel: String,
        /// The error that caused it.
        #[source]
        source: Box<SubdirError>,
    },
}
