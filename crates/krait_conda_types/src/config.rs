//! Dynamically-typed configuration values and their environment overrides.
//!
//! Configuration options arrive from YAML files and environment variables
//! with loose typing: sometimes a scalar, sometimes a list, sometimes a map.
//! [`ConfigValue`] models that shape; per-option decoders turn values into
//! the concrete types the subsystems consume. Environment overrides use the
//! `MAMBA_<UPPERCASE_OPTION>` convention plus a handful of well-known conda
//! variables.

use std::path::PathBuf;

use indexmap::IndexMap;

/// A loosely-typed configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    /// A string scalar.
    Str(String),
    /// A boolean scalar.
    Bool(bool),
    /// An integer scalar.
    Int(i64),
    /// A filesystem path scalar.
    Path(PathBuf),
    /// An ordered list of values.
    List(Vec<ConfigValue>),
    /// A string-keyed map of values.
    Map(IndexMap<String, ConfigValue>),
}

impl ConfigValue {
    /// Decodes the value as a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Decodes the value as a boolean. String scalars accept the usual
    /// `true/false/1/0/yes/no` spellings.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            ConfigValue::Str(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Some(true),
                "false" | "0" | "no" | "off" => Some(false),
                _ => None,
            },
            ConfigValue::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    /// Decodes the value as an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(i) => Some(*i),
            ConfigValue::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Decodes the value as a list of strings. A scalar decodes as a
    /// one-element list; string scalars additionally split on `,`.
    pub fn as_string_list(&self) -> Vec<String> {
        match self {
            ConfigValue::List(items) => items
                .iter()
                .filter_map(|item| item.as_str().map(ToOwned::to_owned))
                .collect(),
            ConfigValue::Str(s) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Str(value.to_owned())
    }
}

/// Reads one option from the environment: a `MAMBA_<UPPER>` override first,
/// then the explicit conda-compatible variable when one exists for the
/// option.
pub(crate) fn env_override(option: &str) -> Option<ConfigValue> {
    let mamba_key = format!("MAMBA_{}", option.to_uppercase());
    if let Ok(value) = std::env::var(&mamba_key) {
        return Some(ConfigValue::Str(value));
    }
    let conda_key = match option {
        "channels" => "CONDA_CHANNELS",
        "pkgs_dirs" => "CONDA_PKGS_DIRS",
        "subdir" => "CONDA_SUBDIR",
        "root_prefix" => "MAMBA_ROOT_PREFIX",
        "ssl_verify" => "REQUESTS_CA_BUNDLE",
        "ssl_no_revoke" => "MAMBA_SSL_NO_REVOKE",
        _ => return None,
    };
    std::env::var(conda_key).ok().map(ConfigValue::Str)
}

/// Reads the configured channels from the environment, empty when unset.
pub fn channels_from_env() -> Vec<String> {
    env_override("channels")
        .map(|value| value.as_string_list())
        .unwrap_or_default()
}

/// Reads the configured package cache directories from the environment.
pub fn pkgs_dirs_from_env() -> Vec<PathBuf> {
    env_override("pkgs_dirs")
        .map(|value| {
            value
                .as_string_list()
                .into_iter()
                .map(PathBuf::from)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_decoding() {
        assert_eq!(ConfigValue::from("true").as_bool(), Some(true));
        assert_eq!(ConfigValue::from("0").as_bool(), Some(false));
        assert_eq!(ConfigValue::Bool(true).as_bool(), Some(true));
        assert_eq!(ConfigValue::from("42").as_int(), Some(42));
        assert_eq!(ConfigValue::from("x").as_int(), None);
    }

    #[test]
    fn string_list_decoding() {
        assert_eq!(
            ConfigValue::from("conda-forge, bioconda").as_string_list(),
            vec!["conda-forge".to_owned(), "bioconda".to_owned()]
        );
        assert_eq!(
            ConfigValue::List(vec!["a".into(), "b".into()]).as_string_list(),
            vec!["a".to_owned(), "b".to_owned()]
        );
    }

    #[test]
    fn map_values() {
        let mut map = IndexMap::new();
        map.insert("key".to_owned(), ConfigValue::from("value"));
        let value = ConfigValue::Map(map);
        assert_eq!(
            match &value {
                ConfigValue::Map(m) => m.get("key").and_then(|v| v.as_str()),
                _ => None,
            },
            Some("value")
        );
    }
}
