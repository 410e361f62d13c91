//! Serde models for the two trust metadata formats and their signature
//! verification primitives.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature as Ed25519Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{canonical, TrustError};

/// A single signature in the `0.6` format, keyed by the hex public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    /// Extra GPG header data mixed into the digest, when the signature was
    /// produced by a GPG key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_headers: Option<String>,

    /// The hex-encoded ed25519 signature.
    pub signature: String,
}

/// A single signature entry in the `1.x` format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureList {
    /// The id of the key that produced the signature.
    pub keyid: String,

    /// The hex-encoded ed25519 signature.
    pub sig: String,
}

/// A role delegation: the keys that may sign for the role and how many of
/// them must agree. The `0.6` format stores public keys inline
/// (`pubkeys`); the `1.x` format stores key ids (`keyids`) resolved through
/// the key table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delegation {
    /// Hex public keys (`0.6`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pubkeys: Vec<String>,

    /// Key ids (`1.x`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keyids: Vec<String>,

    /// The number of distinct valid signatures required.
    pub threshold: u32,
}

impl Delegation {
    /// Returns the keys of this delegation, resolving key ids through the
    /// given key table when necessary.
    pub fn resolved_keys(&self, keys: Option<&BTreeMap<String, KeyEntry>>) -> Vec<String> {
        if !self.pubkeys.is_empty() {
            return self.pubkeys.clone();
        }
        let Some(keys) = keys else { return Vec::new() };
        self.keyids
            .iter()
            .filter_map(|keyid| keys.get(keyid).map(|entry| entry.keyval.public.clone()))
            .collect()
    }
}

/// An entry of the `1.x` key table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEntry {
    /// The key type, `ed25519`.
    pub keytype: String,

    /// The signing scheme, `ed25519`.
    pub scheme: String,

    /// The key material.
    pub keyval: KeyValue,
}

/// The key material of a [`KeyEntry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValue {
    /// The hex-encoded public key.
    pub public: String,
}

/// The parsed `signed` section of a `0.6` root file.
#[derive(Debug, Clone, Deserialize)]
pub struct SignedV06 {
    /// The role delegations.
    pub delegations: BTreeMap<String, Delegation>,

    /// When the metadata expires.
    pub expiration: DateTime<Utc>,

    /// The metadata spec version, e.g. `0.6.0`.
    pub metadata_spec_version: String,

    /// The type of the file; must be `root` for root metadata.
    #[serde(rename = "type")]
    pub file_type: String,

    /// The chain version.
    pub version: u32,
}

/// A `0.6`-format root document: the raw `signed` value (kept verbatim so
/// signatures cover the exact bytes) plus its parsed form and signatures.
#[derive(Debug, Clone)]
pub struct RootV06 {
    /// Signatures keyed by hex public key.
    pub signatures: BTreeMap<String, Signature>,

    /// The raw signed payload.
    pub signed_value: Value,

    /// The parsed signed payload.
    pub signed: SignedV06,
}

/// The parsed `signed` section of a `1.x` root file.
#[derive(Debug, Clone, Deserialize)]
pub struct SignedV1 {
    /// The type of the file; must be `root`.
    #[serde(rename = "_type")]
    pub file_type: String,

    /// The metadata spec version, e.g. `1.0.17`.
    pub spec_version: String,

    /// The chain version.
    pub version: u32,

    /// When the metadata expires.
    pub expires: DateTime<Utc>,

    /// The key table.
    pub keys: BTreeMap<String, KeyEntry>,

    /// The role delegations.
    pub roles: BTreeMap<String, Delegation>,
}

/// A `1.x`-format root document.
#[derive(Debug, Clone)]
pub struct RootV1 {
    /// The signature list.
    pub signatures: Vec<SignatureList>,

    /// The raw signed payload.
    pub signed_value: Value,

    /// The parsed signed payload.
    pub signed: SignedV1,
}

impl RootV06 {
    /// Parses a full document from a JSON value.
    pub fn from_value(value: &Value) -> Result<Self, TrustError> {
        let signatures = value
            .get("signatures")
            .cloned()
            .ok_or_else(|| TrustError::RoleMetadata("missing 'signatures'".to_owned()))?;
        let signatures: BTreeMap<String, Signature> = serde_json::from_value(signatures)
            .map_err(|e| TrustError::RoleMetadata(format!("invalid signatures: {e}")))?;
        let signed_value = value
            .get("signed")
            .cloned()
            .ok_or_else(|| TrustError::RoleMetadata("missing 'signed'".to_owned()))?;
        let signed: SignedV06 = serde_json::from_value(signed_value.clone())
            .map_err(|e| TrustError::RoleMetadata(format!("invalid signed payload: {e}")))?;
        Ok(Self {
            signatures,
            signed_value,
            signed,
        })
    }

    /// Counts the distinct keys of `delegation` that produced a valid
    /// signature over this document's payload.
    pub fn count_valid_signatures(&self, delegation: &Delegation) -> Result<u32, TrustError> {
        let bytes = canonical::canonical_bytes(&self.signed_value)
            .map_err(|e| TrustError::Signature(e.to_string()))?;
        let mut valid = 0;
        for pubkey in delegation.resolved_keys(None) {
            if let Some(signature) = self.signatures.get(&pubkey) {
                if verify_signature(
                    &pubkey,
                    &signature.signature,
                    signature.other_headers.as_deref(),
                    &bytes,
                )? {
                    valid += 1;
                }
            }
        }
        Ok(valid)
    }
}

impl RootV1 {
    /// Parses a full document from a JSON value.
    pub fn from_value(value: &Value) -> Result<Self, TrustError> {
        let signatures = value
            .get("signatures")
            .cloned()
            .ok_or_else(|| TrustError::RoleMetadata("missing 'signatures'".to_owned()))?;
        let signatures: Vec<SignatureList> = serde_json::from_value(signatures)
            .map_err(|e| TrustError::RoleMetadata(format!("invalid signatures: {e}")))?;
        let signed_value = value
            .get("signed")
            .cloned()
            .ok_or_else(|| TrustError::RoleMetadata("missing 'signed'".to_owned()))?;
        let signed: SignedV1 = serde_json::from_value(signed_value.clone())
            .map_err(|e| TrustError::RoleMetadata(format!("invalid signed payload: {e}")))?;
        Ok(Self {
            signatures,
            signed_value,
            signed,
        })
    }

    /// Counts the distinct keys of `delegation` (resolved through the given
    /// key table) that produced a valid signature over this payload.
    ///
    /// The delegation may also carry inline `pubkeys` (the previous root in
    /// an `0.6` → `1.x` upgrade); keys are therefore resolved first and each
    /// signature entry tried against them, preferring a matching `keyid`.
    pub fn count_valid_signatures(
        &self,
        delegation: &Delegation,
        keys: &BTreeMap<String, KeyEntry>,
    ) -> Result<u32, TrustError> {
        let bytes = canonical::canonical_bytes(&self.signed_value)
            .map_err(|e| TrustError::Signature(e.to_string()))?;
        let mut valid = 0;
        for pubkey in delegation.resolved_keys(Some(keys)) {
            let verified = self.signatures.iter().any(|signature| {
                verify_signature(&pubkey, &signature.sig, None, &bytes).unwrap_or(false)
            });
            if verified {
                valid += 1;
            }
        }
        Ok(valid)
    }
}

/// Verifies one ed25519 signature over the canonical payload bytes. When
/// `other_headers` is present the GPG-compatible digest is used: the payload
/// is hashed together with the header data, a `0x04 0xff` marker and the
/// big-endian header length.
pub(crate) fn verify_signature(
    pubkey_hex: &str,
    signature_hex: &str,
    other_headers: Option<&str>,
    payload: &[u8],
) -> Result<bool, TrustError> {
    let pubkey_bytes: [u8; 32] = hex::decode(pubkey_hex)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| TrustError::Signature(format!("malformed public key '{pubkey_hex}'")))?;
    let Ok(verifying_key) = VerifyingKey::from_bytes(&pubkey_bytes) else {
        return Ok(false);
    };
    let signature_bytes = hex::decode(signature_hex)
        .map_err(|_| TrustError::Signature("signature is not valid hex".to_owned()))?;
    let Ok(signature) = Ed25519Signature::try_from(signature_bytes.as_slice()) else {
        return Ok(false);
    };

    match other_headers {
        Some(other_headers) => {
            let header_data = hex::decode(other_headers)
                .map_err(|_| TrustError::Signature("other_headers is not valid hex".to_owned()))?;
            let mut hasher = Sha256::new();
            hasher.update(payload);
            hasher.update(&header_data);
            hasher.update(b"\x04\xff");
            hasher.update((header_data.len() as u32).to_be_bytes());
            let digest = hasher.finalize();
            Ok(verifying_key.verify(&digest, &signature).is_ok())
        }
        None => Ok(verifying_key.verify(payload, &signature).is_ok()),
    }
}
