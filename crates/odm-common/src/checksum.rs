//! SHA-256 checksums for staged data and artifact bundles
//!
//! Consumers verify a downloaded `data.jsonl` by re-hashing it byte for byte and
//! comparing against the `checksum` recorded in the bundle metadata, so the
//! digest is always the lowercase hex encoding of the raw file contents.

use crate::error::{CommonError, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

const CHUNK_SIZE: usize = 8192;

/// Compute the checksum of a file
pub fn compute_file_checksum(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    compute_checksum(&mut file)
}

/// Compute the checksum of any readable source
pub fn compute_checksum<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; CHUNK_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Checksum of an in-memory buffer
pub fn checksum_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Verify a file against an expected checksum
///
/// Comparison ignores hex case. A mismatch is reported as
/// [`CommonError::ChecksumMismatch`] carrying both digests.
pub fn verify_file_checksum(path: impl AsRef<Path>, expected: &str) -> Result<()> {
    let actual = compute_file_checksum(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(CommonError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    const HELLO_WORLD_SHA256: &str =
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_compute_checksum() {
        let mut cursor = Cursor::new(b"hello world");
        assert_eq!(compute_checksum(&mut cursor).unwrap(), HELLO_WORLD_SHA256);
        assert_eq!(checksum_bytes(b"hello world"), HELLO_WORLD_SHA256);
    }

    #[test]
    fn test_checksum_spans_multiple_chunks() {
        let data = vec![b'x'; CHUNK_SIZE * 3 + 17];
        let mut cursor = Cursor::new(data.clone());
        assert_eq!(compute_checksum(&mut cursor).unwrap(), checksum_bytes(&data));
    }

    #[test]
    fn test_verify_file_checksum() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();

        verify_file_checksum(file.path(), HELLO_WORLD_SHA256).unwrap();
        verify_file_checksum(file.path(), &HELLO_WORLD_SHA256.to_uppercase()).unwrap();

        match verify_file_checksum(file.path(), "deadbeef") {
            Err(CommonError::ChecksumMismatch { expected, actual }) => {
                assert_eq!(expected, "deadbeef");
                assert_eq!(actual, HELLO_WORLD_SHA256);
            },
            other => panic!("expected checksum mismatch, got {:?}", other),
        }
    }
}
