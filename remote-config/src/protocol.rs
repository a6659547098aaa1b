//! Wire types for the remote configuration endpoint.
//!
//! # Request
//!
//! ```json
//! {
//!   "client": {
//!     "state": {
//!       "root_version": 1,
//!       "targets_version": 12,
//!       "config_states": [{"id": "cfg1", "version": 3, "product": "APM_TRACING", "apply_state": 2}],
//!       "has_error": false,
//!       "error": "",
//!       "backend_client_state": "opaque"
//!     },
//!     "id": "d8a3...",
//!     "products": ["APM_TRACING"],
//!     "is_tracer": true,
//!     "client_tracer": {...},
//!     "capabilities": "Ag=="
//!   },
//!   "cached_target_files": [{"path": "...", "length": 12, "hashes": [{"algorithm": "sha256", "hash": "..."}]}]
//! }
//! ```
//!
//! # Response
//!
//! ```json
//! {
//!   "client_configs": ["org1/APM_TRACING/cfg1/config"],
//!   "targets": "<base64 of the signed targets document>",
//!   "target_files": [{"path": "org1/APM_TRACING/cfg1/config", "raw": "<base64>"}]
//! }
//! ```
use crate::config_key::Product;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

pub const ROOT_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientGetConfigsRequest {
    pub client: ClientInfo,
    pub cached_target_files: Vec<CachedTargetFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientInfo {
    pub state: ClientState,
    pub id: String,
    pub products: Vec<Product>,
    pub is_tracer: bool,
    pub client_tracer: TracerInfo,
    /// Base64 of the minimal big-endian representation of the capabilities mask.
    pub capabilities: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClientState {
    pub root_version: u64,
    pub targets_version: u64,
    pub config_states: Vec<ConfigState>,
    pub has_error: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_client_state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TracerInfo {
    pub runtime_id: String,
    pub language: String,
    pub tracer_version: String,
    pub service: String,
    pub env: String,
    pub app_version: String,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_services: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "u8")]
pub enum ApplyState {
    Unacknowledged,
    Acknowledged,
    Error,
}

impl From<ApplyState> for u8 {
    fn from(state: ApplyState) -> u8 {
        match state {
            ApplyState::Unacknowledged => 1,
            ApplyState::Acknowledged => 2,
            ApplyState::Error => 3,
        }
    }
}

/// Per-key apply outcome reported back to the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigState {
    pub id: String,
    pub version: u64,
    pub product: Product,
    pub apply_state: ApplyState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apply_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedTargetFile {
    pub path: String,
    pub length: u64,
    pub hashes: Vec<TargetFileHash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetFileHash {
    pub algorithm: String,
    pub hash: String,
}

impl CachedTargetFile {
    pub fn from_descriptor(path: &str, descriptor: &TargetDescriptor) -> Self {
        CachedTargetFile {
            path: path.to_string(),
            length: descriptor.length,
            hashes: descriptor
                .hashes
                .iter()
                .map(|(algorithm, hash)| TargetFileHash {
                    algorithm: algorithm.clone(),
                    hash: hash.to_ascii_lowercase(),
                })
                .collect(),
        }
    }

    /// True when the descriptor advertises the same length and the same digests. Digests
    /// are compared as case-normalized hex strings.
    pub fn matches(&self, descriptor: &TargetDescriptor) -> bool {
        self.length == descriptor.length
            && self.hashes.len() == descriptor.hashes.len()
            && self.hashes.iter().all(|cached| {
                descriptor
                    .hashes
                    .get(&cached.algorithm)
                    .is_some_and(|hash| hash.eq_ignore_ascii_case(&cached.hash))
            })
    }
}

// Agents send `null` for empty lists.
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<Vec<T>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Raw poll response body.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawResponse {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub client_configs: Vec<String>,
    #[serde(default)]
    pub targets: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub target_files: Vec<RawTargetFile>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawTargetFile {
    pub path: String,
    pub raw: String,
}

/// The document carried base64-encoded in `targets`.
#[derive(Debug, Clone, Deserialize)]
pub struct Targets {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub signatures: Vec<TargetsSignature>,
    pub signed: JsonValue,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetsSignature {
    pub keyid: String,
    pub sig: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SignedManifest {
    #[serde(rename = "_type", default)]
    pub kind: String,
    #[serde(default)]
    pub custom: Option<ManifestCustom>,
    #[serde(default)]
    pub expires: String,
    #[serde(default)]
    pub spec_version: String,
    pub version: u64,
    #[serde(default)]
    pub targets: BTreeMap<String, TargetDescriptor>,
}

impl SignedManifest {
    pub fn opaque_backend_state(&self) -> Option<&str> {
        self.custom
            .as_ref()
            .and_then(|c| c.opaque_backend_state.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ManifestCustom {
    #[serde(default)]
    pub opaque_backend_state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TargetDescriptor {
    #[serde(default)]
    pub custom: TargetCustom,
    pub hashes: BTreeMap<String, String>,
    pub length: u64,
}

impl TargetDescriptor {
    pub fn version(&self) -> u64 {
        self.custom.v
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct TargetCustom {
    #[serde(default)]
    pub v: u64,
}
