#![deny(missing_docs)]

//! Verification of the signed trust root that gates repodata acceptance.
//!
//! Channels that support content trust publish a chain of `N.root.json`
//! files. Each file is signed; an update from version `N` to `N+1` is only
//! accepted when enough keys of the *current* root delegation have signed
//! the candidate. Two metadata formats exist: the `0.6` format used by
//! conda-content-trust (roles `root` and `key_mgr`, signatures keyed by
//! public key) and the `1.x` TUF-style format (roles `root`, `targets`,
//! `snapshot`, `timestamp`, a key table, and signature lists). Both are
//! supported; upgrading from `0.6` to `1.x` goes through the explicit
//! [`TrustRoot::upgrade`] path.

mod canonical;
mod model;
mod root;

pub use model::{Delegation, KeyEntry, KeyValue, RootV06, RootV1, Signature, SignatureList};
pub use root::TrustRoot;

use thiserror::Error;

/// Errors produced while validating trust metadata. Any of these aborts the
/// update and leaves the currently trusted root untouched.
#[derive(Debug, Error)]
pub enum TrustError {
    /// The candidate version does not advance the chain by exactly one.
    #[error("rollback detected: expected root version {expected}, got {actual}")]
    Rollback {
        /// The version the chain requires next.
        expected: u32,
        /// The version the candidate declared.
        actual: u32,
    },

    /// Not enough valid signatures from the required delegation.
    #[error("threshold not reached for role '{role}': {valid} of {threshold} required signatures")]
    Threshold {
        /// The role whose threshold was not met.
        role: String,
        /// The number of valid signatures found.
        valid: u32,
        /// The number of signatures required.
        threshold: u32,
    },

    /// The file could not be read, or its name does not match
    /// `<version>.root.json`.
    #[error("invalid role file: {0}")]
    RoleFile(String),

    /// The metadata structure is invalid (wrong type, missing or unexpected
    /// roles, empty delegations).
    #[error("invalid role metadata: {0}")]
    RoleMetadata(String),

    /// The spec version of the candidate is incompatible with the current
    /// root.
    #[error("incompatible metadata spec version: current {current}, candidate {candidate}")]
    SpecVersion {
        /// The spec version of the trusted root.
        current: String,
        /// The spec version of the candidate.
        candidate: String,
    },

    /// A signature (or public key) could not be decoded at all.
    #[error("malformed signature or key: {0}")]
    Signature(String),
}
