//! Canonical JSON serialization of signed payloads.
//!
//! Signatures cover the exact bytes of the `signed` object serialized with
//! sorted keys and two-space indentation, matching what conda-content-trust
//! produces. `serde_json::Value` objects are backed by a sorted map, so
//! pretty-printing a round-tripped value yields the canonical form.

use ed25519_dalek::{Signer, SigningKey};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serializes a JSON value canonically: sorted keys, two-space indent.
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec_pretty(value)
}

/// Computes the SHA256 of the canonical serialization, as a hex string.
pub fn payload_hash(value: &Value) -> Result<String, serde_json::Error> {
    let bytes = canonical_bytes(value)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Signs the canonical serialization of a payload. Only used by tests and
/// tooling that produce metadata; verification lives in [`crate::model`].
pub fn sign_payload(key: &SigningKey, value: &Value) -> Result<String, serde_json::Error> {
    let bytes = canonical_bytes(value)?;
    Ok(hex::encode(key.sign(&bytes).to_bytes()))
}
