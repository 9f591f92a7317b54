//! Content checksums for staged uploads.

use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Computes the checksum recorded with each upload.
///
/// Cloud providers each define their own content hash; the replica only
/// stores whatever the injected hasher returns.
pub trait ContentHasher: Send + Sync {
    /// Short name of the algorithm.
    fn name(&self) -> &str;

    /// Checksums a byte slice.
    fn checksum(&self, bytes: &[u8]) -> String;

    /// Checksums a file's content.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    fn checksum_file(&self, path: &Path) -> io::Result<String> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        Ok(self.checksum(&bytes))
    }
}

/// Hex-encoded SHA-256.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl ContentHasher for Sha256Hasher {
    fn name(&self) -> &str {
        "sha256"
    }

    fn checksum(&self, bytes: &[u8]) -> String {
        let digest = Sha256::digest(bytes);
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(hex, "{byte:02x}");
        }
        hex
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            Sha256Hasher.checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn file_checksum_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content");
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(
            Sha256Hasher.checksum_file(&path).unwrap(),
            Sha256Hasher.checksum(b"hello")
        );
    }
}
