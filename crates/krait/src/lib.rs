#![deny(missing_docs)]

//! Transactional environment management: the crate that takes a solved
//! [`krait_solve::Transaction`] and makes it true on disk.
//!
//! The [`install`] module downloads and extracts missing packages into the
//! [`krait_cache::PackageCache`], links and unlinks files in dependency
//! order, rolls back on failure or interrupt, and appends the user request
//! to the prefix history.

pub mod install;
pub mod ops;

mod error;

pub use error::{ExitStatus, KraitError};
pub use install::driver::{execute, ExecuteError, ExecuteOptions};
pub use ops::{plan, Plan, PlanOptions};
