#![deny(missing_docs)]

//! Network plumbing for krait: a bounded-concurrency streaming downloader
//! and the on-disk repodata cache.
//!
//! The [`download`] module moves bytes: it drives several HTTP(S)/file
//! transfers at once, retries transient failures with exponential backoff,
//! validates sizes and digests on the fly, and transparently decompresses
//! `.bz2`/`.zst`/`.zck` payloads. The [`subdir`] module gives those bytes
//! meaning: one [`subdir::SubdirData`] per (channel, platform) fetches
//! `repodata.json`, keeps it fresh via `max-age` and conditional requests,
//! and persists it in a content-addressed cache directory.

pub mod download;
mod error;
pub mod subdir;

#[cfg(test)]
mod test_utils;

pub use download::{DownloadResult, DownloadTarget, MultiDownload, Progress, RetryPolicy};
pub use error::{Cancellation, DownloadError, SubdirError};
pub use subdir::{
    fetch_channel, CacheResult, RepodataEncoding, SubdirConfig, SubdirData, SubdirFetchResult,
};
