//! Reading the installed state of a prefix: all records under `conda-meta/`
//! plus the environment variables persisted in `conda-meta/state`.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::PrefixRecord;

/// The parsed `conda-meta/state` file of a prefix.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrefixState {
    /// Environment variables to set when the prefix is activated. Keys are
    /// upper-cased; insertion order is preserved.
    #[serde(default)]
    pub env_vars: IndexMap<String, String>,
}

/// An error that can occur while loading prefix data.
#[derive(Debug, Error)]
pub enum PrefixDataError {
    /// An io error while enumerating or reading records.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A record file could not be parsed.
    #[error("failed to parse prefix record '{0}'")]
    InvalidRecord(PathBuf, #[source] serde_json::Error),

    /// The state file could not be parsed.
    #[error("failed to parse conda-meta/state")]
    InvalidState(#[source] serde_json::Error),
}

/// The installed packages of a prefix, keyed by package name.
#[derive(Debug, Default)]
pub struct PrefixData {
    prefix: PathBuf,
    records: IndexMap<String, PrefixRecord>,
    state: PrefixState,
}

impl PrefixData {
    /// Loads all records from `<prefix>/conda-meta/*.json` along with the
    /// environment state. A missing `conda-meta` directory yields an empty
    /// instance, so fresh prefixes work transparently.
    pub fn from_prefix(prefix: impl Into<PathBuf>) -> Result<Self, PrefixDataError> {
        let prefix = prefix.into();
        let meta_dir = prefix.join("conda-meta");

        let mut records = Vec::new();
        match fs_err::read_dir(&meta_dir) {
            Ok(entries) => {
                for entry in entries {
                    let path = entry?.path();
                    if path.extension().is_some_and(|ext| ext == "json") {
                        let content = fs_err::read_to_string(&path)?;
                        let record: PrefixRecord = serde_json::from_str(&content)
                            .map_err(|e| PrefixDataError::InvalidRecord(path.clone(), e))?;
                        records.push(record);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // Sort for deterministic iteration regardless of directory order.
        records.sort_by(|a, b| {
            a.repodata_record
                .package_record
                .name
                .cmp(&b.repodata_record.package_record.name)
        });
        let records = records
            .into_iter()
            .map(|r| (r.repodata_record.package_record.name.clone(), r))
            .collect();

        let state = Self::load_state(&meta_dir)?;

        Ok(Self {
            prefix,
            records,
            state,
        })
    }

    fn load_state(meta_dir: &Path) -> Result<PrefixState, PrefixDataError> {
        match fs_err::read_to_string(meta_dir.join("state")) {
            Ok(content) => {
                let mut state: PrefixState =
                    serde_json::from_str(&content).map_err(PrefixDataError::InvalidState)?;
                state.env_vars = state
                    .env_vars
                    .into_iter()
                    .map(|(key, value)| (key.to_uppercase(), value))
                    .collect();
                Ok(state)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PrefixState::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// The prefix this data was loaded from.
    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// Looks up the record of an installed package by name.
    pub fn get(&self, name: &str) -> Option<&PrefixRecord> {
        self.records.get(name)
    }

    /// Iterates the records sorted by package name.
    pub fn iter(&self) -> impl Iterator<Item = &PrefixRecord> {
        self.records.values()
    }

    /// Returns the number of installed packages.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true when no package is installed.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The environment variables recorded for this prefix.
    pub fn env_vars(&self) -> &IndexMap<String, String> {
        &self.state.env_vars
    }

    /// Consumes this instance, returning the records.
    pub fn into_records(self) -> Vec<PrefixRecord> {
        self.records.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use url::Url;

    use super::*;
    use crate::{PackageRecord, RepoDataRecord, Version};

    fn write_record(prefix: &Path, name: &str, version: &str) {
        let record = PrefixRecord::from_repodata_record(RepoDataRecord {
            package_record: PackageRecord::new(name, Version::from_str(version).unwrap(), "0"),
            file_name: format!("{name}-{version}-0.tar.bz2"),
            url: Url::parse(&format!("https://example.com/{name}-{version}-0.tar.bz2")).unwrap(),
            channel: "test".to_owned(),
        });
        record.write_to_prefix(prefix).unwrap();
    }

    #[test]
    fn loads_records_sorted_by_name() {
        let prefix = tempfile::tempdir().unwrap();
        write_record(prefix.path(), "zlib", "1.2.13");
        write_record(prefix.path(), "attrs", "21.4.0");

        let data = PrefixData::from_prefix(prefix.path()).unwrap();
        assert_eq!(data.len(), 2);
        let names: Vec<_> = data
            .iter()
            .map(|r| r.repodata_record.package_record.name.as_str())
            .collect();
        assert_eq!(names, ["attrs", "zlib"]);
        assert!(data.get("zlib").is_some());
        assert!(data.get("missing").is_none());
    }

    #[test]
    fn missing_prefix_is_empty() {
        let prefix = tempfile::tempdir().unwrap();
        let data = PrefixData::from_prefix(prefix.path().join("env")).unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn state_env_vars_are_uppercased_in_order() {
        let prefix = tempfile::tempdir().unwrap();
        let meta = prefix.path().join("conda-meta");
        fs_err::create_dir_all(&meta).unwrap();
        fs_err::write(
            meta.join("state"),
            r#"{"env_vars": {"my_var": "1", "OTHER": "2"}}"#,
        )
        .unwrap();

        let data = PrefixData::from_prefix(prefix.path()).unwrap();
        let keys: Vec<_> = data.env_vars().keys().map(String::as_str).collect();
        assert_eq!(keys, ["MY_VAR", "OTHER"]);
    }
}
