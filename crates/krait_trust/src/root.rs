//! The trusted root chain and its update protocol.

use std::{collections::BTreeMap, path::Path};

use serde_json::Value;

use crate::{
    model::{Delegation, KeyEntry, RootV06, RootV1},
    TrustError,
};

/// Roles every `0.6` root must delegate.
const REQUIRED_ROLES_V06: &[&str] = &["root", "key_mgr"];
/// Roles every `1.x` root must delegate.
const REQUIRED_ROLES_V1: &[&str] = &["root", "targets", "snapshot", "timestamp"];
/// Roles that may appear beyond the required set.
const OPTIONAL_ROLES: &[&str] = &["mirrors"];

/// The currently trusted root of one channel, in either metadata format.
#[derive(Debug, Clone)]
pub enum TrustRoot {
    /// A root in the conda-content-trust `0.6` format.
    V06(RootV06),
    /// A root in the TUF-style `1.x` format.
    V1(RootV1),
}

impl TrustRoot {
    /// Loads and validates an initial trusted root from a file. The initial
    /// root is trusted on first use; it still has to be self-consistent
    /// (signed by its own root delegation).
    pub fn from_path(path: &Path) -> Result<Self, TrustError> {
        let content = fs_err::read_to_string(path)
            .map_err(|e| TrustError::RoleFile(format!("{}: {e}", path.display())))?;
        let value: Value = serde_json::from_str(&content)
            .map_err(|e| TrustError::RoleFile(format!("{}: {e}", path.display())))?;
        Self::from_value(&value)
    }

    /// Parses and validates an initial trusted root from JSON.
    pub fn from_value(value: &Value) -> Result<Self, TrustError> {
        let root = Self::parse(value)?;
        root.check_structure()?;
        root.check_self_consistency()?;
        Ok(root)
    }

    fn parse(value: &Value) -> Result<Self, TrustError> {
        // The formats are distinguished by the shape of the signed payload:
        // `1.x` has a `_type` tag and a key table, `0.6` a `type` tag.
        let signed = value
            .get("signed")
            .ok_or_else(|| TrustError::RoleMetadata("missing 'signed'".to_owned()))?;
        let root = if signed.get("_type").is_some() {
            TrustRoot::V1(RootV1::from_value(value)?)
        } else {
            TrustRoot::V06(RootV06::from_value(value)?)
        };
        if root.file_type() != "root" {
            return Err(TrustError::RoleMetadata(format!(
                "expected type 'root', found '{}'",
                root.file_type()
            )));
        }
        Ok(root)
    }

    /// The version of this root in the chain.
    pub fn version(&self) -> u32 {
        match self {
            TrustRoot::V06(root) => root.signed.version,
            TrustRoot::V1(root) => root.signed.version,
        }
    }

    /// The metadata spec version of this root.
    pub fn spec_version(&self) -> &str {
        match self {
            TrustRoot::V06(root) => &root.signed.metadata_spec_version,
            TrustRoot::V1(root) => &root.signed.spec_version,
        }
    }

    fn file_type(&self) -> &str {
        match self {
            TrustRoot::V06(root) => &root.signed.file_type,
            TrustRoot::V1(root) => &root.signed.file_type,
        }
    }

    fn root_delegation(&self) -> Result<&Delegation, TrustError> {
        match self {
            TrustRoot::V06(root) => root.signed.delegations.get("root"),
            TrustRoot::V1(root) => root.signed.roles.get("root"),
        }
        .ok_or_else(|| TrustError::RoleMetadata("missing 'root' delegation".to_owned()))
    }

    fn key_table(&self) -> Option<&BTreeMap<String, KeyEntry>> {
        match self {
            TrustRoot::V06(_) => None,
            TrustRoot::V1(root) => Some(&root.signed.keys),
        }
    }

    /// Updates the chain from a `<version>.root.json` file. The filename
    /// must announce the version it carries.
    pub fn update_from_path(&self, path: &Path) -> Result<Self, TrustError> {
        let expected_name = format!("{}.root.json", self.version() + 1);
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        if file_name != expected_name {
            return Err(TrustError::RoleFile(format!(
                "expected file named '{expected_name}', found '{file_name}'"
            )));
        }
        let content = fs_err::read_to_string(path)
            .map_err(|e| TrustError::RoleFile(format!("{}: {e}", path.display())))?;
        let value: Value = serde_json::from_str(&content)
            .map_err(|e| TrustError::RoleFile(format!("{}: {e}", path.display())))?;
        self.update(&value)
    }

    /// Updates the chain from candidate JSON: the candidate must be root
    /// metadata with version `current + 1`, a compatible spec version, and
    /// enough signatures from both the current and its own root delegation.
    pub fn update(&self, candidate: &Value) -> Result<Self, TrustError> {
        let candidate = Self::parse(candidate)?;

        if !spec_versions_compatible(self.spec_version(), candidate.spec_version()) {
            return Err(TrustError::SpecVersion {
                current: self.spec_version().to_owned(),
                candidate: candidate.spec_version().to_owned(),
            });
        }

        self.accept(candidate)
    }

    /// Upgrades a `0.6` root to the `1.x` format. This is the only path on
    /// which the spec version may bump its major.
    pub fn upgrade(&self, candidate: &Value) -> Result<Self, TrustError> {
        let candidate = Self::parse(candidate)?;
        match (self, &candidate) {
            (TrustRoot::V06(_), TrustRoot::V1(_)) => self.accept(candidate),
            _ => Err(TrustError::SpecVersion {
                current: self.spec_version().to_owned(),
                candidate: candidate.spec_version().to_owned(),
            }),
        }
    }

    fn accept(&self, candidate: TrustRoot) -> Result<Self, TrustError> {
        let expected = self.version() + 1;
        if candidate.version() != expected {
            return Err(TrustError::Rollback {
                expected,
                actual: candidate.version(),
            });
        }

        candidate.check_structure()?;

        // Signatures from the delegation we currently trust...
        let current_delegation = self.root_delegation()?;
        let valid = count_signatures(&candidate, current_delegation, self.key_table())?;
        if valid < current_delegation.threshold {
            return Err(TrustError::Threshold {
                role: "root".to_owned(),
                valid,
                threshold: current_delegation.threshold,
            });
        }

        // ...and from the candidate's own, so the new root can verify itself
        // after the update.
        candidate.check_self_consistency()?;

        tracing::debug!(
            version = candidate.version(),
            spec_version = candidate.spec_version(),
            "accepted root update"
        );
        Ok(candidate)
    }

    fn check_self_consistency(&self) -> Result<(), TrustError> {
        let delegation = self.root_delegation()?;
        let valid = count_signatures(self, delegation, self.key_table())?;
        if valid < delegation.threshold {
            return Err(TrustError::Threshold {
                role: "root".to_owned(),
                valid,
                threshold: delegation.threshold,
            });
        }
        Ok(())
    }

    fn check_structure(&self) -> Result<(), TrustError> {
        let (roles, required): (Vec<(&String, &Delegation)>, &[&str]) = match self {
            TrustRoot::V06(root) => (
                root.signed.delegations.iter().collect(),
                REQUIRED_ROLES_V06,
            ),
            TrustRoot::V1(root) => (root.signed.roles.iter().collect(), REQUIRED_ROLES_V1),
        };

        for required_role in required {
            if !roles.iter().any(|(name, _)| name == required_role) {
                return Err(TrustError::RoleMetadata(format!(
                    "missing required role '{required_role}'"
                )));
            }
        }
        for (name, delegation) in roles {
            if !required.contains(&name.as_str()) && !OPTIONAL_ROLES.contains(&name.as_str()) {
                return Err(TrustError::RoleMetadata(format!(
                    "unexpected role '{name}'"
                )));
            }
            if delegation.resolved_keys(self.key_table()).is_empty() {
                return Err(TrustError::RoleMetadata(format!(
                    "role '{name}' delegates to no keys"
                )));
            }
            if delegation.threshold < 1 {
                return Err(TrustError::RoleMetadata(format!(
                    "role '{name}' has threshold {}",
                    delegation.threshold
                )));
            }
        }
        Ok(())
    }

    /// Verifies an arbitrary delegated role document (e.g. `key_mgr`)
    /// against this root: the named delegation must reach its threshold over
    /// the document's signed payload.
    pub fn verify_delegated(&self, role: &str, document: &Value) -> Result<(), TrustError> {
        let delegation = match self {
            TrustRoot::V06(root) => root.signed.delegations.get(role),
            TrustRoot::V1(root) => root.signed.roles.get(role),
        }
        .ok_or_else(|| TrustError::RoleMetadata(format!("unknown role '{role}'")))?;

        let signed = document
            .get("signed")
            .ok_or_else(|| TrustError::RoleMetadata("missing 'signed'".to_owned()))?;
        let bytes = crate::canonical::canonical_bytes(signed)
            .map_err(|e| TrustError::Signature(e.to_string()))?;

        let mut valid = 0;
        match self {
            TrustRoot::V06(_) => {
                let signatures: BTreeMap<String, crate::model::Signature> = document
                    .get("signatures")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| TrustError::RoleMetadata(format!("invalid signatures: {e}")))?
                    .unwrap_or_default();
                for pubkey in delegation.resolved_keys(None) {
                    if let Some(signature) = signatures.get(&pubkey) {
                        if crate::model::verify_signature(
                            &pubkey,
                            &signature.signature,
                            signature.other_headers.as_deref(),
                            &bytes,
                        )? {
                            valid += 1;
                        }
                    }
                }
            }
            TrustRoot::V1(root) => {
                let signatures: Vec<crate::model::SignatureList> = document
                    .get("signatures")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| TrustError::RoleMetadata(format!("invalid signatures: {e}")))?
                    .unwrap_or_default();
                for keyid in &delegation.keyids {
                    let Some(entry) = root.signed.keys.get(keyid) else {
                        continue;
                    };
                    let Some(signature) = signatures.iter().find(|s| &s.keyid == keyid) else {
                        continue;
                    };
                    if crate::model::verify_signature(
                        &entry.keyval.public,
                        &signature.sig,
                        None,
                        &bytes,
                    )? {
                        valid += 1;
                    }
                }
            }
        }

        if valid < delegation.threshold {
            return Err(TrustError::Threshold {
                role: role.to_owned(),
                valid,
                threshold: delegation.threshold,
            });
        }
        Ok(())
    }
}

fn count_signatures(
    document: &TrustRoot,
    delegation: &Delegation,
    keys: Option<&BTreeMap<String, KeyEntry>>,
) -> Result<u32, TrustError> {
    match document {
        TrustRoot::V06(root) => root.count_valid_signatures(delegation),
        TrustRoot::V1(root) => {
            let keys = keys.unwrap_or(&root.signed.keys);
            root.count_valid_signatures(delegation, keys)
        }
    }
}

/// Two spec versions are compatible when their majors agree; for `0.x`
/// versions the minor is part of the compatibility contract, so `0.6` and
/// `0.7` are incompatible while `0.6.0` and `0.6.1` are not.
fn spec_versions_compatible(current: &str, candidate: &str) -> bool {
    fn significant(version: &str) -> Option<(u32, Option<u32>)> {
        let mut parts = version.split('.');
        let major: u32 = parts.next()?.parse().ok()?;
        let minor = parts.next().and_then(|m| m.parse().ok());
        Some((major, if major == 0 { minor } else { None }))
    }
    matches!(
        (significant(current), significant(candidate)),
        (Some(a), Some(b)) if a == b
    )
}
