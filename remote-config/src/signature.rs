//! Verification of the ed25519 signature carried next to `targets.signed`.
use crate::protocol::TargetsSignature;
use ed25519_dalek::{Signature, VerifyingKey};
use serde_json::Value as JsonValue;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum SignatureError {
    #[error("invalid targets public key: {0}")]
    InvalidKey(String),
    #[error("no signature for key id {0}")]
    MissingSignature(String),
    #[error("invalid signature encoding: {0}")]
    InvalidSignature(String),
    #[error("signature verification failed for targets.signed. Key id: {0}")]
    VerificationFailed(String),
}

/// A configured targets key.
#[derive(Clone, Debug)]
pub struct TargetsKey {
    key_id: String,
    key: VerifyingKey,
}

impl TargetsKey {
    pub fn from_hex(key_id: &str, public_key: &str) -> Result<Self, SignatureError> {
        let bytes =
            hex::decode(public_key).map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SignatureError::InvalidKey("expected 32 bytes".into()))?;
        let key =
            VerifyingKey::from_bytes(&bytes).map_err(|e| SignatureError::InvalidKey(e.to_string()))?;

        Ok(TargetsKey {
            key_id: key_id.to_string(),
            key,
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Verifies the signature matching this key id over the canonical form of `signed`.
    pub fn verify(
        &self,
        signatures: &[TargetsSignature],
        signed: &JsonValue,
    ) -> Result<(), SignatureError> {
        let entry = signatures
            .iter()
            .find(|s| s.keyid == self.key_id)
            .ok_or_else(|| SignatureError::MissingSignature(self.key_id.clone()))?;

        let sig_bytes =
            hex::decode(&entry.sig).map_err(|e| SignatureError::InvalidSignature(e.to_string()))?;
        let signature = Signature::from_slice(&sig_bytes)
            .map_err(|e| SignatureError::InvalidSignature(e.to_string()))?;

        self.key
            .verify_strict(&canonical_json(signed), &signature)
            .map_err(|_| SignatureError::VerificationFailed(self.key_id.clone()))
    }
}

/// Serializes a JSON value with object keys sorted and no insignificant whitespace.
pub fn canonical_json(value: &JsonValue) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut Vec<u8>) {
    match value {
        JsonValue::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));

            out.push(b'{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(&JsonValue::String(key.clone()), out);
                out.push(b':');
                write_canonical(value, out);
            }
            out.push(b'}');
        }
        JsonValue::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        // Scalars have a single compact form.
        scalar => out.extend_from_slice(scalar.to_string().as_bytes()),
    }
}
