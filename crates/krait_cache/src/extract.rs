//! Extraction of the two conda archive formats.
//!
//! `.tar.bz2` archives are a single compressed tarball. `.conda` archives
//! are a zip envelope holding two zstd-compressed tarballs, `pkg-*.tar.zst`
//! with the payload and `info-*.tar.zst` with the metadata; both unpack
//! into the same directory. All extraction runs behind one process-wide
//! mutex: the archive backends are not thread-safe.

use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

use krait_conda_types::package::ArchiveType;
use parking_lot::Mutex;
use thiserror::Error;

static EXTRACT_MUTEX: Mutex<()> = Mutex::new(());

/// Errors produced while extracting an archive.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The filename does not carry a known archive extension.
    #[error("'{0}' is not a conda archive")]
    UnknownFormat(PathBuf),

    /// An io error while reading or writing.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The zip envelope of a `.conda` file is malformed.
    #[error("malformed .conda archive: {0}")]
    MalformedConda(String),
}

/// Extracts an archive into the destination directory, dispatching on the
/// filename extension.
pub fn extract(archive: &Path, destination: &Path) -> Result<(), ExtractError> {
    let file_name = archive
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| ExtractError::UnknownFormat(archive.to_path_buf()))?;
    match ArchiveType::try_from(file_name) {
        Some(ArchiveType::TarBz2) => extract_tar_bz2(archive, destination),
        Some(ArchiveType::Conda) => extract_conda(archive, destination),
        None => Err(ExtractError::UnknownFormat(archive.to_path_buf())),
    }
}

/// Extracts a `.tar.bz2` archive.
pub fn extract_tar_bz2(archive: &Path, destination: &Path) -> Result<(), ExtractError> {
    let _guard = EXTRACT_MUTEX.lock();
    fs_err::create_dir_all(destination)?;
    let file = File::open(archive)?;
    let decoder = bzip2::read::BzDecoder::new(file);
    let mut tar = tar::Archive::new(decoder);
    tar.set_preserve_permissions(true);
    tar.unpack(destination)?;
    Ok(())
}

/// Extracts a `.conda` archive.
pub fn extract_conda(archive: &Path, destination: &Path) -> Result<(), ExtractError> {
    let _guard = EXTRACT_MUTEX.lock();
    fs_err::create_dir_all(destination)?;
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| ExtractError::MalformedConda(e.to_string()))?;

    let mut seen_payload = false;
    for index in 0..zip.len() {
        let entry = zip
            .by_index(index)
            .map_err(|e| ExtractError::MalformedConda(e.to_string()))?;
        let name = entry.name().to_owned();
        if name.ends_with(".tar.zst") && (name.starts_with("pkg-") || name.starts_with("info-")) {
            seen_payload |= name.starts_with("pkg-");
            unpack_zstd_tar(entry, destination)?;
        }
        // `metadata.json` and anything else in the envelope is ignored.
    }
    if !seen_payload {
        return Err(ExtractError::MalformedConda(
            "no pkg-*.tar.zst member found".to_owned(),
        ));
    }
    Ok(())
}

fn unpack_zstd_tar(reader: impl Read, destination: &Path) -> Result<(), ExtractError> {
    let decoder = zstd::stream::read::Decoder::new(reader)?;
    let mut tar = tar::Archive::new(decoder);
    tar.set_preserve_permissions(true);
    tar.unpack(destination)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    /// Builds a `.tar.bz2` with the given files.
    fn build_tar_bz2(path: &Path, files: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let encoder = bzip2::write::BzEncoder::new(file, bzip2::Compression::fast());
        let mut builder = tar::Builder::new(encoder);
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    /// Builds a `.conda` envelope with an info and a pkg tarball.
    fn build_conda(
        path: &Path,
        info_files: &[(&str, &[u8])],
        pkg_files: &[(&str, &[u8])],
    ) {
        fn tar_zst(files: &[(&str, &[u8])]) -> Vec<u8> {
            let encoder = zstd::stream::write::Encoder::new(Vec::new(), 1).unwrap();
            let mut builder = tar::Builder::new(encoder);
            for (name, content) in files {
                let mut header = tar::Header::new_gnu();
                header.set_size(content.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, name, *content).unwrap();
            }
            builder.into_inner().unwrap().finish().unwrap()
        }

        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        zip.start_file("info-test-1.0-0.tar.zst", options).unwrap();
        zip.write_all(&tar_zst(info_files)).unwrap();
        zip.start_file("pkg-test-1.0-0.tar.zst", options).unwrap();
        zip.write_all(&tar_zst(pkg_files)).unwrap();
        zip.finish().unwrap();
    }

    #[test]
    fn extracts_tar_bz2() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("test-1.0-0.tar.bz2");
        build_tar_bz2(
            &archive,
            &[
                ("info/index.json", br#"{"name": "test"}"# as &[u8]),
                ("bin/tool", b"#!/bin/sh\necho hi\n"),
            ],
        );

        let dest = dir.path().join("test-1.0-0");
        extract(&archive, &dest).unwrap();
        assert!(dest.join("info/index.json").exists());
        assert_eq!(
            fs_err::read(dest.join("bin/tool")).unwrap(),
            b"#!/bin/sh\necho hi\n"
        );
    }

    #[test]
    fn extracts_conda() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("test-1.0-0.conda");
        build_conda(
            &archive,
            &[("info/index.json", br#"{"name": "test"}"# as &[u8])],
            &[("lib/data.txt", b"payload" as &[u8])],
        );

        let dest = dir.path().join("test-1.0-0");
        extract(&archive, &dest).unwrap();
        assert!(dest.join("info/index.json").exists());
        assert_eq!(fs_err::read(dest.join("lib/data.txt")).unwrap(), b"payload");
    }

    #[test]
    fn rejects_unknown_formats() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("test.zip");
        fs_err::write(&archive, b"junk").unwrap();
        assert!(matches!(
            extract(&archive, &dir.path().join("out")),
            Err(ExtractError::UnknownFormat(_))
        ));
    }

    #[test]
    fn rejects_conda_without_payload() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("test-1.0-0.conda");
        let file = File::create(&archive).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        zip.start_file("metadata.json", options).unwrap();
        zip.write_all(b"{}").unwrap();
        zip.finish().unwrap();

        assert!(matches!(
            extract(&archive, &dir.path().join("out")),
            Err(ExtractError::MalformedConda(_))
        ));
    }
}
