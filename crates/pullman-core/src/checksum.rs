//! File checksum verification
//!
//! Hashing is CPU-bound, so the async entry point offloads to a
//! blocking worker thread and streams the file in fixed-size chunks.

use crate::error::PullmanError;
use digest::Digest;
use md5::Md5;
use pullman_types::{ChecksumAlgorithm, ChecksumExpectation};
use sha1::Sha1;
use sha2::Sha256;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

const READ_BUF: usize = 64 * 1024;

/// Compute the hex digest of a file with the given algorithm.
pub fn compute(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String, PullmanError> {
    debug!("Hashing {:?} with {}", path, algorithm.as_str());
    match algorithm {
        ChecksumAlgorithm::Md5 => hash_file::<Md5>(path),
        ChecksumAlgorithm::Sha1 => hash_file::<Sha1>(path),
        ChecksumAlgorithm::Sha256 => hash_file::<Sha256>(path),
    }
}

fn hash_file<D: Digest>(path: &Path) -> Result<String, PullmanError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = D::new();
    let mut buffer = [0u8; READ_BUF];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Verify a file against an expectation, off the async reactor.
///
/// Returns `ChecksumMismatch` when the digest differs; comparison is
/// case-insensitive on the expected value.
pub async fn verify(path: PathBuf, expected: ChecksumExpectation) -> Result<(), PullmanError> {
    let actual = tokio::task::spawn_blocking(move || compute(&path, expected.algorithm))
        .await
        .map_err(|e| PullmanError::Unknown(format!("checksum task panicked: {}", e)))??;

    let wanted = expected.value.to_ascii_lowercase();
    if actual == wanted {
        Ok(())
    } else {
        Err(PullmanError::ChecksumMismatch {
            expected: wanted,
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fixture(content: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn sha256_of_known_input() {
        let f = fixture(b"hello world");
        let digest = compute(f.path(), ChecksumAlgorithm::Sha256).unwrap();
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn md5_of_known_input() {
        let f = fixture(b"hello world");
        let digest = compute(f.path(), ChecksumAlgorithm::Md5).unwrap();
        assert_eq!(digest, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[tokio::test]
    async fn verify_accepts_uppercase_expectation() {
        let f = fixture(b"hello world");
        let expectation = ChecksumExpectation {
            algorithm: ChecksumAlgorithm::Sha1,
            value: "2AAE6C35C94FCFB415DBE95F408B9CE91EE846ED".into(),
        };
        verify(f.path().to_path_buf(), expectation).await.unwrap();
    }

    #[tokio::test]
    async fn verify_reports_mismatch() {
        let f = fixture(b"hello world");
        let expectation = ChecksumExpectation {
            algorithm: ChecksumAlgorithm::Sha256,
            value: "00".repeat(32),
        };
        let err = verify(f.path().to_path_buf(), expectation)
            .await
            .unwrap_err();
        assert!(matches!(err, PullmanError::ChecksumMismatch { .. }));
    }
}
