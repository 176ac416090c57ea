//! Algorithm-prefixed checksums (`sha256:<hex>`) and streamed file digests

use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::io::AsyncReadExt;

use crate::error::ChecksumError;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha224 => "sha224",
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha384 => "sha384",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    /// Digest length in hex characters
    pub fn hex_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha224 => 56,
            DigestAlgorithm::Sha256 => 64,
            DigestAlgorithm::Sha384 => 96,
            DigestAlgorithm::Sha512 => 128,
        }
    }

    fn hasher(&self) -> Hasher {
        match self {
            DigestAlgorithm::Sha224 => Hasher::Sha224(Sha224::new()),
            DigestAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            DigestAlgorithm::Sha384 => Hasher::Sha384(Sha384::new()),
            DigestAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = ChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha224" => Ok(DigestAlgorithm::Sha224),
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha384" => Ok(DigestAlgorithm::Sha384),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            other => Err(ChecksumError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

enum Hasher {
    Sha224(Sha224),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha224(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha384(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Hasher::Sha224(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha384(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// Expected digest of an artifact. Unprefixed values are taken as sha256.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: DigestAlgorithm,
    /// Lowercase hex digest
    pub hex: String,
}

impl FromStr for Checksum {
    type Err = ChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (algorithm, digest) = match s.split_once(':') {
            Some((algo, digest)) => (algo.parse::<DigestAlgorithm>()?, digest),
            None => (DigestAlgorithm::Sha256, s),
        };

        let digest = digest.trim().to_ascii_lowercase();
        if digest.len() != algorithm.hex_len() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ChecksumError::Invalid(s.to_string()));
        }

        Ok(Checksum { algorithm, hex: digest })
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.name(), self.hex)
    }
}

impl Checksum {
    /// Digest of an in-memory buffer
    pub fn of_bytes(algorithm: DigestAlgorithm, data: &[u8]) -> Self {
        let mut hasher = algorithm.hasher();
        hasher.update(data);
        Checksum { algorithm, hex: hasher.finalize_hex() }
    }

    /// Compares against the digest of `path`, read in chunks
    pub async fn verify_file(&self, path: &Path) -> Result<(), ChecksumError> {
        let actual = digest_file(self.algorithm, path).await?;
        if actual.hex != self.hex {
            return Err(ChecksumError::Mismatch {
                expected: self.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }
}

/// Streams `path` through the given algorithm
pub async fn digest_file(algorithm: DigestAlgorithm, path: &Path) -> Result<Checksum, ChecksumError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = algorithm.hasher();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(Checksum { algorithm, hex: hasher.finalize_hex() })
}

#[cfg(test)]
mod tests {
    use super::*;

    // sha256("hello world")
    const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_parse_prefixed_and_bare() {
        let c: Checksum = format!("sha256:{HELLO_SHA256}").parse().unwrap();
        assert_eq!(c.algorithm, DigestAlgorithm::Sha256);

        let bare: Checksum = HELLO_SHA256.to_uppercase().parse().unwrap();
        assert_eq!(bare, c);
        assert_eq!(bare.to_string(), format!("sha256:{HELLO_SHA256}"));
    }

    #[test]
    fn test_parse_rejects_bad_inputs() {
        assert!(matches!(
            "md5:d41d8cd98f00b204e9800998ecf8427e".parse::<Checksum>(),
            Err(ChecksumError::UnsupportedAlgorithm(_))
        ));
        assert!(matches!("sha256:abcd".parse::<Checksum>(), Err(ChecksumError::Invalid(_))));
        assert!(matches!(
            format!("sha512:{HELLO_SHA256}").parse::<Checksum>(),
            Err(ChecksumError::Invalid(_))
        ));
    }

    #[test]
    fn test_of_bytes() {
        let c = Checksum::of_bytes(DigestAlgorithm::Sha256, b"hello world");
        assert_eq!(c.hex, HELLO_SHA256);
    }

    #[tokio::test]
    async fn test_verify_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let good: Checksum = HELLO_SHA256.parse().unwrap();
        good.verify_file(&path).await.unwrap();

        let bad = Checksum::of_bytes(DigestAlgorithm::Sha256, b"something else");
        let err = bad.verify_file(&path).await.unwrap_err();
        assert!(matches!(err, ChecksumError::Mismatch { .. }));
    }

    #[tokio::test]
    async fn test_digest_spans_multiple_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let data: Vec<u8> = (0..(CHUNK_SIZE * 2 + 17)).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        let streamed = digest_file(DigestAlgorithm::Sha512, &path).await.unwrap();
        assert_eq!(streamed, Checksum::of_bytes(DigestAlgorithm::Sha512, &data));
    }
}
