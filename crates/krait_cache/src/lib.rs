#![deny(missing_docs)]

//! The package cache of krait: the on-disk store of downloaded archives and
//! their extracted trees, shared between environments and processes.
//!
//! A [`PackageCache`] picks the first writable directory from an ordered
//! list of candidates, answers presence queries against archive digests or
//! extracted metadata, and serializes writers across processes with a
//! PID-stamped advisory file lock. The [`extract`] module unpacks both
//! conda archive formats behind a single mutex (the archive backends are
//! not thread-safe).

pub mod extract;
mod package_cache;
pub mod validation;

pub use package_cache::{CacheLock, PackageCache, PackageCacheError};
