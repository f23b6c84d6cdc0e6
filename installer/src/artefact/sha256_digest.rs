//! SHA-256 digests of bundle files.
//!
//! Every file in a bundle is listed in the manifest with its digest, and
//! the digest is checked after unpacking before the file is trusted.

use super::error::{ArtefactError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;

/// Expected length of a hex-encoded SHA-256 digest.
const DIGEST_HEX_LEN: usize = 64;

/// A validated lowercase hex-encoded SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Sha256Digest(String);

impl Sha256Digest {
    /// Compute the digest of the file at `path`, reading it in chunks.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from reading the file.
    pub fn of_file(path: &Path) -> std::io::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 8192];
        loop {
            let read = file.read(&mut buffer)?;
            match buffer.get(..read) {
                Some(chunk) if !chunk.is_empty() => hasher.update(chunk),
                _ => break,
            }
        }
        Ok(Self(format!("{:x}", hasher.finalize())))
    }

    /// Compute the digest of `bytes`.
    #[must_use]
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(format!("{:x}", Sha256::digest(bytes)))
    }

    /// Return the digest as a hex string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Sha256Digest {
    type Error = ArtefactError;

    fn try_from(value: String) -> Result<Self> {
        validate_sha256(&value)?;
        Ok(Self(value))
    }
}

impl TryFrom<&str> for Sha256Digest {
    type Error = ArtefactError;

    fn try_from(value: &str) -> Result<Self> {
        Self::try_from(value.to_owned())
    }
}

impl From<Sha256Digest> for String {
    fn from(digest: Sha256Digest) -> Self {
        digest.0
    }
}

impl fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_sha256(value: &str) -> Result<()> {
    if value.len() != DIGEST_HEX_LEN {
        return Err(ArtefactError::InvalidSha256Digest {
            reason: format!(
                "expected {DIGEST_HEX_LEN} hex characters, got {}",
                value.len()
            ),
        });
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !c.is_ascii_hexdigit() || c.is_ascii_uppercase())
    {
        return Err(ArtefactError::InvalidSha256Digest {
            reason: format!("'{bad}' is not a lowercase hex digit"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn file_digest_matches_byte_digest() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join("payload.o");
        std::fs::write(&path, b"interface object").expect("write");
        assert_eq!(
            Sha256Digest::of_file(&path).expect("digest"),
            Sha256Digest::of_bytes(b"interface object")
        );
    }

    #[test]
    fn known_digest_of_empty_input() {
        assert_eq!(
            Sha256Digest::of_bytes(b"").as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[rstest]
    #[case::too_short("abcdef".to_owned())]
    #[case::uppercase("A".repeat(64))]
    #[case::non_hex(format!("{}g", "a".repeat(63)))]
    fn rejects_malformed_digests(#[case] value: String) {
        assert!(Sha256Digest::try_from(value).is_err());
    }

    #[test]
    fn deserialization_validates() {
        let err = serde_json::from_str::<Sha256Digest>("\"xyz\"");
        assert!(err.is_err());
    }
}
