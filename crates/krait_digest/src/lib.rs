#![deny(missing_docs)]

//! Hashing utilities used throughout the krait crates.
//!
//! Package records, repodata cache state and downloaded archives are all
//! identified or validated by MD5 and SHA256 digests. This crate wraps the
//! [RustCrypto/hashes](https://github.com/RustCrypto/hashes) implementations
//! with the small set of helpers the rest of the workspace needs: hashing
//! files and byte slices, parsing hex digests, and a [`HashingWriter`] that
//! digests a stream while it is being written to disk.

#[cfg(feature = "serde")]
pub mod serde;

pub use digest;
pub use md5::Md5;
pub use sha2::Sha256;

use std::{
    fs::File,
    io::{self, Read, Write},
    path::Path,
};

use digest::{Digest, Output};

/// The output of a SHA256 hash.
pub type Sha256Hash = sha2::digest::Output<Sha256>;

/// The output of an MD5 hash.
pub type Md5Hash = md5::digest::Output<Md5>;

/// Computes the digest of the file at the specified location.
pub fn compute_file_digest<D: Digest + Default>(
    path: impl AsRef<Path>,
) -> Result<Output<D>, io::Error> {
    let mut file = File::open(path)?;
    let mut hasher = DigestWriter(D::default());
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.0.finalize())
}

/// Computes the digest of the given bytes.
pub fn compute_bytes_digest<D: Digest + Default>(bytes: impl AsRef<[u8]>) -> Output<D> {
    let mut hasher = D::default();
    hasher.update(bytes);
    hasher.finalize()
}

/// Parses a hex string into a digest. Returns `None` if the string is not
/// valid hex or has the wrong length for the digest type.
pub fn parse_digest_from_hex<D: Digest>(str: &str) -> Option<Output<D>> {
    let mut hash = <Output<D>>::default();
    hex::decode_to_slice(str, &mut hash).ok().map(|()| hash)
}

/// Adapter that lets any [`Digest`] act as an [`io::Write`] sink.
struct DigestWriter<D: Digest>(D);

impl<D: Digest> Write for DigestWriter<D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A writer that forwards all data to an inner writer while simultaneously
/// computing a digest of everything written through it. Call
/// [`HashingWriter::finalize`] to recover the inner writer and the digest.
pub struct HashingWriter<W, D: Digest> {
    writer: W,
    hasher: D,
}

impl<W, D: Digest + Default> HashingWriter<W, D> {
    /// Constructs a new instance from a writer and a fresh hasher.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            hasher: D::default(),
        }
    }
}

impl<W, D: Digest> HashingWriter<W, D> {
    /// Consumes this instance and returns the inner writer and the digest of
    /// all bytes written through it.
    pub fn finalize(self) -> (W, Output<D>) {
        (self.writer, self.hasher.finalize())
    }
}

impl<W: Write, D: Digest> Write for HashingWriter<W, D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.writer.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// A reader that computes a digest of everything read through it.
pub struct HashingReader<R, D: Digest> {
    reader: R,
    hasher: D,
}

impl<R, D: Digest + Default> HashingReader<R, D> {
    /// Constructs a new instance from a reader and a fresh hasher.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            hasher: D::default(),
        }
    }
}

impl<R, D: Digest> HashingReader<R, D> {
    /// Consumes this instance and returns the inner reader and the digest of
    /// all bytes read through it.
    pub fn finalize(self) -> (R, Output<D>) {
        (self.reader, self.hasher.finalize())
    }
}

impl<R: Read, D: Digest> Read for HashingReader<R, D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.reader.read(buf)?;
        self.hasher.update(&buf[..read]);
        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_digest() {
        let digest = compute_bytes_digest::<Sha256>("Hello, world!");
        assert_eq!(
            format!("{digest:x}"),
            "315f5bdb76d078c43b8ac0064e4a0164612b1fce77c869345bfc94c75894edd3"
        );
    }

    #[test]
    fn file_digest_matches_bytes_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.txt");
        std::fs::write(&path, b"some test content").unwrap();
        assert_eq!(
            compute_file_digest::<Md5>(&path).unwrap(),
            compute_bytes_digest::<Md5>(b"some test content")
        );
    }

    #[test]
    fn parse_hex_roundtrip() {
        let digest = compute_bytes_digest::<Sha256>("roundtrip");
        let parsed = parse_digest_from_hex::<Sha256>(&format!("{digest:x}")).unwrap();
        assert_eq!(digest, parsed);
    }

    #[test]
    fn parse_hex_rejects_invalid() {
        assert!(parse_digest_from_hex::<Sha256>("not-hex").is_none());
        assert!(parse_digest_from_hex::<Sha256>("abcd").is_none());
    }

    #[test]
    fn hashing_writer_digests_written_bytes() {
        let mut writer = HashingWriter::<_, Sha256>::new(Vec::new());
        writer.write_all(b"split ").unwrap();
        writer.write_all(b"stream").unwrap();
        let (buffer, digest) = writer.finalize();
        assert_eq!(buffer, b"split stream");
        assert_eq!(digest, compute_bytes_digest::<Sha256>(b"split stream"));
    }
}
