use crate::config_key::ConfigKey;
use crate::protocol::{RawResponse, SignedManifest, TargetDescriptor, Targets};
use crate::signature::{SignatureError, TargetsKey};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use std::collections::HashMap;

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("response of {size} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("invalid response JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid base64 in targets: {0}")]
    TargetsBase64(base64::DecodeError),
    #[error("invalid targets document: {0}")]
    Targets(serde_json::Error),
    #[error("invalid base64 in target file {path}: {source}")]
    TargetFileBase64 {
        path: String,
        source: base64::DecodeError,
    },
    #[error("Path {0} is in target_files, but not in targets.signed")]
    UnknownTargetFile(String),
    #[error("{0}")]
    Signature(#[from] SignatureError),
}

impl DecodeError {
    /// Verification failures are reported back to the server. Malformed payloads carry
    /// no version to report against and are only logged.
    pub fn is_reportable(&self) -> bool {
        matches!(
            self,
            DecodeError::UnknownTargetFile(_) | DecodeError::Signature(_)
        )
    }
}

/// A fully decoded and structurally verified poll response.
#[derive(Debug, Clone)]
pub struct DecodedResponse {
    pub client_configs: Vec<String>,
    pub manifest: SignedManifest,
    target_files: HashMap<String, Vec<u8>>,
}

impl DecodedResponse {
    pub fn new(
        client_configs: Vec<String>,
        manifest: SignedManifest,
        target_files: HashMap<String, Vec<u8>>,
    ) -> Self {
        DecodedResponse {
            client_configs,
            manifest,
            target_files,
        }
    }

    pub fn descriptor(&self, key: &ConfigKey) -> Option<&TargetDescriptor> {
        self.manifest.targets.get(key.as_str())
    }

    pub fn content(&self, key: &ConfigKey) -> Option<&[u8]> {
        self.target_files.get(key.as_str()).map(Vec::as_slice)
    }
}

pub struct ResponseDecoder {
    max_payload_size: usize,
    targets_key: Option<TargetsKey>,
}

impl ResponseDecoder {
    pub fn new(max_payload_size: usize, targets_key: Option<TargetsKey>) -> Self {
        ResponseDecoder {
            max_payload_size,
            targets_key,
        }
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Returns `None` when the server signalled that nothing changed. A manifest that is
    /// present but cannot be decoded rejects the whole response.
    pub fn decode(&self, body: &[u8]) -> Result<Option<DecodedResponse>, DecodeError> {
        if body.len() > self.max_payload_size {
            return Err(DecodeError::PayloadTooLarge {
                size: body.len(),
                max: self.max_payload_size,
            });
        }

        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        let raw: RawResponse = serde_json::from_slice(body)?;
        let Some(encoded_targets) = raw.targets.filter(|t| !t.is_empty()) else {
            return Ok(None);
        };

        let targets_json = STANDARD
            .decode(encoded_targets.as_bytes())
            .map_err(DecodeError::TargetsBase64)?;
        let targets: Targets =
            serde_json::from_slice(&targets_json).map_err(DecodeError::Targets)?;

        if let Some(key) = &self.targets_key {
            key.verify(&targets.signatures, &targets.signed)?;
        }

        let manifest: SignedManifest =
            serde_json::from_value(targets.signed).map_err(DecodeError::Targets)?;

        let mut target_files = HashMap::with_capacity(raw.target_files.len());
        for file in raw.target_files {
            if !manifest.targets.contains_key(&file.path) {
                return Err(DecodeError::UnknownTargetFile(file.path));
            }
            let content = STANDARD.decode(file.raw.as_bytes()).map_err(|source| {
                DecodeError::TargetFileBase64 {
                    path: file.path.clone(),
                    source,
                }
            })?;
            target_files.insert(file.path, content);
        }

        Ok(Some(DecodedResponse {
            client_configs: raw.client_configs,
            manifest,
            target_files,
        }))
    }
}
