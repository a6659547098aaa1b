use crate::protocol::TargetDescriptor;
use sha2::{Digest, Sha256};

pub const SHA256: &str = "sha256";

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum IntegrityError {
    #[error("sha256 mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
}

/// Result of checking content against its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Verified,
    /// The descriptor carried no sha256 digest, so nothing could be checked.
    Unverified,
}

pub fn verify(content: &[u8], descriptor: &TargetDescriptor) -> Result<Verification, IntegrityError> {
    let Some(expected) = descriptor.hashes.get(SHA256) else {
        return Ok(Verification::Unverified);
    };

    let actual = sha256_hex(content);
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(IntegrityError::HashMismatch {
            expected: expected.to_ascii_lowercase(),
            actual,
        });
    }

    Ok(Verification::Verified)
}

pub fn sha256_hex(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}
