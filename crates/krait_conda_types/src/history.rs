//! The append-only `conda-meta/history` log of user requests.
//!
//! Every transaction appends one block to the history file and nothing ever
//! rewrites it. A block looks like:
//!
//! ```text
//! ==> 2023-02-13 14:08:50 <==
//! # cmd: install numpy
//! # update specs: ["numpy"]
//! -zlib-1.2.12-0
//! +zlib-1.2.13-0
//! ```
//!
//! Parsing reconstructs the sequence of [`HistoryEntry`] values so that
//! `parse(format(e)) == e`.

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use chrono::Utc;
use thiserror::Error;

/// The datetime format used in revision headers.
const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One appended history block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryEntry {
    /// The timestamp of the entry, `YYYY-MM-DD HH:MM:SS` in UTC.
    pub date: String,

    /// The command line that triggered the entry, if recorded.
    pub cmd: Option<String>,

    /// The specs the user explicitly asked for.
    pub requested_specs: Vec<String>,

    /// Specs that were weakened to constraints instead of installed.
    pub neutered_specs: Vec<String>,

    /// Dists (`name-version-build`) removed by the transaction.
    pub unlink_dists: Vec<String>,

    /// Dists installed by the transaction.
    pub link_dists: Vec<String>,

    /// Specs recorded under `update specs`.
    pub update_specs: Vec<String>,

    /// Specs recorded under `remove specs`.
    pub remove_specs: Vec<String>,
}

/// A user request, seeded with the current time.
pub type UserRequest = HistoryEntry;

impl HistoryEntry {
    /// Creates an entry stamped with the current UTC time.
    pub fn prefilled() -> Self {
        Self {
            date: Utc::now().format(DATE_FORMAT).to_string(),
            ..Self::default()
        }
    }

    /// Renders the entry in the on-disk block format.
    pub fn format(&self) -> String {
        let mut out = format!("==> {} <==\n", self.date);
        if let Some(cmd) = &self.cmd {
            out.push_str(&format!("# cmd: {cmd}\n"));
        }
        for (label, specs) in [
            ("requested specs", &self.requested_specs),
            ("neutered specs", &self.neutered_specs),
            ("update specs", &self.update_specs),
            ("remove specs", &self.remove_specs),
        ] {
            if !specs.is_empty() {
                let json = serde_json::to_string(specs).expect("strings always serialize");
                out.push_str(&format!("# {label}: {json}\n"));
            }
        }
        for dist in &self.unlink_dists {
            out.push_str(&format!("-{dist}\n"));
        }
        for dist in &self.link_dists {
            out.push_str(&format!("+{dist}\n"));
        }
        out
    }
}

/// Errors produced while reading or writing a history file.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// An io error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A malformed spec list inside a comment line.
    #[error("failed to parse specs on line '{0}'")]
    InvalidSpecs(String),
}

/// Reader/writer for `<prefix>/conda-meta/history`.
#[derive(Debug, Clone)]
pub struct History {
    path: PathBuf,
}

impl History {
    /// Creates a handle for the history file of the given prefix.
    pub fn from_prefix(prefix: impl AsRef<Path>) -> Self {
        Self {
            path: prefix.as_ref().join("conda-meta").join("history"),
        }
    }

    /// The path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a block to the history file. The file and its parent
    /// directory are created when missing; existing contents are never
    /// touched.
    pub fn add_entry(&self, entry: &HistoryEntry) -> Result<(), HistoryError> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)?;
        }
        let mut file = fs_err::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(entry.format().as_bytes())?;
        Ok(())
    }

    /// Parses the whole history file. A missing file is an empty history.
    pub fn parse(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        let content = match fs_err::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        parse_history(&content)
    }

    /// Returns the sequence of user requests recorded in the history.
    pub fn get_user_requests(&self) -> Result<Vec<UserRequest>, HistoryError> {
        self.parse()
    }
}

fn parse_history(content: &str) -> Result<Vec<HistoryEntry>, HistoryError> {
    let mut entries = Vec::new();
    let mut current: Option<HistoryEntry> = None;

    for line in content.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if let Some(header) = line.strip_prefix("==>").and_then(|l| l.strip_suffix("<==")) {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(HistoryEntry {
                date: header.trim().to_owned(),
                ..HistoryEntry::default()
            });
            continue;
        }
        let Some(entry) = current.as_mut() else {
            // Garbage before the first header is ignored, like conda does.
            continue;
        };
        if let Some(comment) = line.strip_prefix('#') {
            let comment = comment.trim();
            if let Some(cmd) = comment.strip_prefix("cmd:") {
                entry.cmd = Some(cmd.trim().to_owned());
            } else if let Some((label, json)) = comment.split_once(':') {
                let target = match label.trim() {
                    "requested specs" => &mut entry.requested_specs,
                    "neutered specs" => &mut entry.neutered_specs,
                    "update specs" => &mut entry.update_specs,
                    "remove specs" => &mut entry.remove_specs,
                    _ => continue,
                };
                *target = serde_json::from_str(json.trim())
                    .map_err(|_| HistoryError::InvalidSpecs(line.to_owned()))?;
            }
        } else if let Some(dist) = line.strip_prefix('-') {
            entry.unlink_dists.push(dist.to_owned());
        } else if let Some(dist) = line.strip_prefix('+') {
            entry.link_dists.push(dist.to_owned());
        }
    }
    if let Some(entry) = current.take() {
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> HistoryEntry {
        HistoryEntry {
            date: "2023-02-13 14:08:50".to_owned(),
            cmd: Some("install numpy scipy".to_owned()),
            requested_specs: vec!["numpy".to_owned(), "scipy >=1.9".to_owned()],
            neutered_specs: Vec::new(),
            unlink_dists: vec!["numpy-1.21.2-py39_0".to_owned()],
            link_dists: vec![
                "numpy-1.24.0-py39_0".to_owned(),
                "scipy-1.10.0-py39_0".to_owned(),
            ],
            update_specs: vec!["numpy".to_owned()],
            remove_specs: Vec::new(),
        }
    }

    #[test]
    fn format_parse_roundtrip() {
        let entry = sample_entry();
        let parsed = parse_history(&entry.format()).unwrap();
        assert_eq!(parsed, vec![entry]);
    }

    #[test]
    fn append_only() {
        let dir = tempfile::tempdir().unwrap();
        let history = History::from_prefix(dir.path());

        let before = history.parse().unwrap();
        assert!(before.is_empty());

        history.add_entry(&sample_entry()).unwrap();
        assert_eq!(history.parse().unwrap().len(), 1);

        let mut second = sample_entry();
        second.date = "2023-02-14 09:00:00".to_owned();
        history.add_entry(&second).unwrap();

        let after = history.parse().unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0], sample_entry());
        assert_eq!(after[1].date, "2023-02-14 09:00:00");
    }

    #[test]
    fn prefilled_has_utc_timestamp() {
        let entry = HistoryEntry::prefilled();
        assert!(chrono::NaiveDateTime::parse_from_str(&entry.date, DATE_FORMAT).is_ok());
    }

    #[test]
    fn unknown_comments_are_ignored() {
        let content = "==> 2023-01-01 00:00:00 <==\n# conda version: 23.1.0\n+pkg-1.0-0\n";
        let entries = parse_history(content).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].link_dists, vec!["pkg-1.0-0".to_owned()]);
    }
}
