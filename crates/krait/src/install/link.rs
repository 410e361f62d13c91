//! Linking one extracted package into a prefix.
//!
//! Every file listed in the package's `info/paths.json` is materialized
//! according to its `path_type`: hard-linked from the cache, symlinked, or
//! copied. Files carrying a build-time prefix placeholder are patched
//! instead: text files get a plain substitution (plus a shebang rewrite
//! when the interpreter line grows beyond the kernel limit), binary files
//! get a padded c-string substitution that preserves offsets.

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use krait_conda_types::{
    package::{FileMode, PathType, PathsJson},
    Link, LinkType, Platform, PrefixPathsEntry, PrefixRecord, RepoDataRecord,
};
use krait_digest::{HashingWriter, Sha256};
use thiserror::Error;

/// The kernel refuses interpreter lines longer than this; such shebangs are
/// rewritten to go through `env`.
const MAX_SHEBANG_LENGTH: usize = 127;

/// An error that occurred while linking a package.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The package metadata could not be read.
    #[error(transparent)]
    Metadata(#[from] krait_conda_types::package::PackageFileError),

    /// A file could not be linked.
    #[error("failed to link '{path}'")]
    FailedToLink {
        /// The file that failed, relative to the prefix.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A binary placeholder cannot hold the target prefix.
    #[error("target prefix is too long for the binary placeholder in '{0}'")]
    PrefixTooLong(PathBuf),

    /// Writing the prefix record failed.
    #[error("failed to write prefix record")]
    FailedToWriteRecord(#[source] std::io::Error),
}

/// Links the extracted package at `package_dir` into `prefix` and writes
/// the resulting [`PrefixRecord`]. Returns the record.
pub fn link_package(
    record: &RepoDataRecord,
    package_dir: &Path,
    prefix: &Path,
    platform: Platform,
) -> Result<PrefixRecord, LinkError> {
    let paths = PathsJson::from_package_directory(package_dir)?;
    let target_prefix = prefix.to_string_lossy().into_owned();
    let target_prefix = if platform.is_windows() {
        target_prefix.replace('\\', "/")
    } else {
        target_prefix
    };

    let mut files = Vec::with_capacity(paths.paths.len());
    let mut paths_data = Vec::with_capacity(paths.paths.len());
    let mut overall_link_type: Option<LinkType> = None;

    for entry in &paths.paths {
        let source = package_dir.join(&entry.relative_path);
        let destination = prefix.join(&entry.relative_path);
        if let Some(parent) = destination.parent() {
            fs_err::create_dir_all(parent).map_err(|e| LinkError::FailedToLink {
                path: entry.relative_path.clone(),
                source: e,
            })?;
        }

        let (link_type, sha256_in_prefix) = if let Some(placeholder) = &entry.prefix_placeholder {
            let file_mode = entry.file_mode.unwrap_or(FileMode::Text);
            let digest = patch_placeholder(
                &source,
                &destination,
                placeholder,
                &target_prefix,
                file_mode,
            )
            .map_err(|e| match e {
                PatchError::PrefixTooLong => LinkError::PrefixTooLong(entry.relative_path.clone()),
                PatchError::Io(source) => LinkError::FailedToLink {
                    path: entry.relative_path.clone(),
                    source,
                },
            })?;
            (LinkType::Patched, Some(digest))
        } else {
            let link_type = match entry.path_type {
                PathType::HardLink => hardlink_or_copy(&source, &destination),
                PathType::SoftLink => symlink_to_destination(&source, &destination),
                PathType::Directory => {
                    fs_err::create_dir_all(&destination)
                        .map(|()| LinkType::Directory)
                        .map_err(Into::into)
                }
            }
            .map_err(|source| LinkError::FailedToLink {
                path: entry.relative_path.clone(),
                source,
            })?;
            (link_type, None)
        };
        overall_link_type.get_or_insert(link_type);

        files.push(entry.relative_path.clone());
        paths_data.push(PrefixPathsEntry {
            relative_path: entry.relative_path.clone(),
            path_type: Some(entry.path_type),
            prefix_placeholder: entry.prefix_placeholder.clone(),
            file_mode: entry.file_mode,
            sha256: entry.sha256,
            sha256_in_prefix,
            size_in_bytes: entry.size_in_bytes,
        });
    }

    let mut prefix_record = PrefixRecord::from_repodata_record(record.clone());
    prefix_record.extracted_package_dir = Some(package_dir.to_path_buf());
    prefix_record.files = files;
    prefix_record.paths_data = paths_data;
    prefix_record.link = Some(Link {
        source: package_dir.to_path_buf(),
        link_type: overall_link_type,
    });
    prefix_record
        .write_to_prefix(prefix)
        .map_err(LinkError::FailedToWriteRecord)?;
    Ok(prefix_record)
}

/// Hard links, falling back to a copy across filesystems.
fn hardlink_or_copy(source: &Path, destination: &Path) -> Result<LinkType, std::io::Error> {
    if destination.exists() {
        fs_err::remove_file(destination)?;
    }
    match fs_err::hard_link(source, destination) {
        Ok(()) => Ok(LinkType::HardLink),
        Err(_) => {
            fs_err::copy(source, destination)?;
            Ok(LinkType::Copy)
        }
    }
}

fn symlink_to_destination(source: &Path, destination: &Path) -> Result<LinkType, std::io::Error> {
    let target = fs_err::read_link(source)?;
    if destination.exists() {
        fs_err::remove_file(destination)?;
    }
    #[cfg(unix)]
    fs_err::os::unix::fs::symlink(&target, destination)?;
    #[cfg(windows)]
    fs_err::os::windows::fs::symlink_file(&target, destination)?;
    Ok(LinkType::SoftLink)
}

enum PatchError {
    PrefixTooLong,
    Io(std::io::Error),
}

impl From<std::io::Error> for PatchError {
    fn from(e: std::io::Error) -> Self {
        PatchError::Io(e)
    }
}

/// Copies `source` to `destination` replacing the placeholder prefix,
/// returning the digest of the written file.
fn patch_placeholder(
    source: &Path,
    destination: &Path,
    placeholder: &str,
    target_prefix: &str,
    file_mode: FileMode,
) -> Result<krait_digest::Sha256Hash, PatchError> {
    let data = fs_err::read(source)?;
    let patched = match file_mode {
        FileMode::Text => {
            let text = String::from_utf8_lossy(&data).replace(placeholder, target_prefix);
            rewrite_long_shebang(text).into_bytes()
        }
        FileMode::Binary => replace_cstring_placeholder(&data, placeholder, target_prefix)
            .ok_or(PatchError::PrefixTooLong)?,
    };

    let file = fs_err::File::create(destination)?;
    let mut writer = HashingWriter::<_, Sha256>::new(file);
    writer.write_all(&patched)?;
    let (file, digest) = writer.finalize();
    drop(file);

    // The patched file keeps the permissions of the packaged one.
    let metadata = fs_err::symlink_metadata(source)?;
    fs_err::set_permissions(destination, metadata.permissions())?;
    Ok(digest)
}

/// Rewrites a `#!` line that grew beyond the kernel limit into the
/// `#!/usr/bin/env <interpreter>` form.
fn rewrite_long_shebang(text: String) -> String {
    if !text.starts_with("#!") {
        return text;
    }
    let line_end = text.find('\n').unwrap_or(text.len());
    if line_end <= MAX_SHEBANG_LENGTH {
        return text;
    }
    let line = &text[..line_end];
    let interpreter = line[2..]
        .split_whitespace()
        .next()
        .and_then(|path| path.rsplit('/').next())
        .unwrap_or_default();
    if interpreter.is_empty() {
        return text;
    }
    format!("#!/usr/bin/env {interpreter}{}", &text[line_end..])
}

/// Replaces the placeholder inside NUL-terminated strings of a binary,
/// padding with NULs so every byte offset after the string is preserved.
/// Returns `None` when the replacement does not fit.
fn replace_cstring_placeholder(
    data: &[u8],
    placeholder: &str,
    target_prefix: &str,
) -> Option<Vec<u8>> {
    let placeholder = placeholder.as_bytes();
    let target = target_prefix.as_bytes();
    let mut out = Vec::with_capacity(data.len());
    let mut index = 0;

    while let Some(position) = find_subslice(&data[index..], placeholder) {
        let string_start = index + position;
        out.extend_from_slice(&data[index..string_start]);

        // The enclosing c-string runs until the next NUL byte.
        let string_end = memchr::memchr(0, &data[string_start..])
            .map_or(data.len(), |nul| string_start + nul);
        let region = &data[string_start..string_end];

        let mut replaced = Vec::with_capacity(region.len());
        let mut cursor = 0;
        while let Some(hit) = find_subslice(&region[cursor..], placeholder) {
            replaced.extend_from_slice(&region[cursor..cursor + hit]);
            replaced.extend_from_slice(target);
            cursor += hit + placeholder.len();
        }
        replaced.extend_from_slice(&region[cursor..]);

        if replaced.len() > region.len() {
            return None;
        }
        replaced.resize(region.len(), 0);
        out.extend_from_slice(&replaced);
        index = string_end;
    }
    out.extend_from_slice(&data[index..]);
    Some(out)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    memchr::memmem::find(haystack, needle)
}
