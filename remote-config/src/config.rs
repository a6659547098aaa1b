use crate::config_key::Product;
use crate::extra_services::DEFAULT_MAX_EXTRA_SERVICES;
use crate::request::ClientIdentity;
use crate::signature::{SignatureError, TargetsKey};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_PAYLOAD_SIZE_BYTES: usize = 5 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("{0} cannot be 0")]
    Zero(&'static str),

    #[error("At least one product must be configured")]
    NoProducts,

    #[error("Unknown product: {0}")]
    UnknownProduct(String),

    #[error("integrity_checks requires a targets_key")]
    MissingTargetsKey,

    #[error("Invalid targets key: {0}")]
    InvalidTargetsKey(#[from] SignatureError),
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_max_payload_size_bytes() -> usize {
    DEFAULT_MAX_PAYLOAD_SIZE_BYTES
}

fn default_max_extra_services() -> usize {
    DEFAULT_MAX_EXTRA_SERVICES
}

fn default_language() -> String {
    "rust".into()
}

fn default_tracer_version() -> String {
    env!("CARGO_PKG_VERSION").into()
}

/// The `remote_config` section.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Base URL of the agent, e.g. `http://localhost:8126`
    pub agent_url: Url,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_payload_size_bytes")]
    pub max_payload_size_bytes: usize,
    #[serde(default = "default_max_extra_services")]
    pub max_extra_services: usize,
    /// Require an ed25519 signature over the targets metadata.
    #[serde(default)]
    pub integrity_checks: bool,
    pub targets_key: Option<TargetsKeyConfig>,
    #[serde(default)]
    pub client: ClientConfig,
    /// Product names to subscribe to. Matched case-insensitively.
    pub products: Vec<String>,
    /// When set, applied configuration is written below this directory.
    pub output_dir: Option<PathBuf>,
    /// Local files re-read on every poll.
    #[serde(default)]
    pub local_files: Vec<PathBuf>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TargetsKeyConfig {
    pub key_id: String,
    /// Hex encoded ed25519 public key.
    pub public_key: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub env: String,
    #[serde(default)]
    pub app_version: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_tracer_version")]
    pub tracer_version: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            service: String::new(),
            env: String::new(),
            app_version: String::new(),
            language: default_language(),
            tracer_version: default_tracer_version(),
            tags: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// A fresh identity. Client and runtime ids are new for every process.
    pub fn identity(&self) -> ClientIdentity {
        ClientIdentity {
            client_id: Uuid::new_v4().to_string(),
            runtime_id: Uuid::new_v4().to_string(),
            language: self.language.clone(),
            tracer_version: self.tracer_version.clone(),
            service: self.service.clone(),
            env: self.env.clone(),
            app_version: self.app_version.clone(),
            tags: self.tags.clone(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.poll_interval_secs == 0 {
            return Err(ValidationError::Zero("poll_interval_secs"));
        }
        if self.request_timeout_secs == 0 {
            return Err(ValidationError::Zero("request_timeout_secs"));
        }
        if self.max_payload_size_bytes == 0 {
            return Err(ValidationError::Zero("max_payload_size_bytes"));
        }
        if self.max_extra_services == 0 {
            return Err(ValidationError::Zero("max_extra_services"));
        }

        self.products()?;
        self.targets_key()?;

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Configured products, deduplicated and in product order.
    pub fn products(&self) -> Result<Vec<Product>, ValidationError> {
        if self.products.is_empty() {
            return Err(ValidationError::NoProducts);
        }

        let mut products = Vec::with_capacity(self.products.len());
        for name in &self.products {
            match Product::from_name(name) {
                Product::Unknown => return Err(ValidationError::UnknownProduct(name.clone())),
                product => products.push(product),
            }
        }
        products.sort();
        products.dedup();

        Ok(products)
    }

    /// The key to verify signatures with, when integrity checks are enabled.
    pub fn targets_key(&self) -> Result<Option<TargetsKey>, ValidationError> {
        match (&self.targets_key, self.integrity_checks) {
            (Some(key), _) => {
                let key = TargetsKey::from_hex(&key.key_id, &key.public_key)?;
                Ok(self.integrity_checks.then_some(key))
            }
            (None, true) => Err(ValidationError::MissingTargetsKey),
            (None, false) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUBLIC_KEY: &str = "d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a";

    fn parse(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_parse_valid_config() {
        let config = parse(&format!(
            r#"
agent_url: "http://localhost:8126"
poll_interval_secs: 2
integrity_checks: true
targets_key:
    key_id: "ed7672c9"
    public_key: "{PUBLIC_KEY}"
client:
    service: web
    env: prod
    tags:
        - "team:core"
products:
    - apm_tracing
    - ASM_DD
    - APM_TRACING
output_dir: /var/lib/rcsync
local_files:
    - /etc/rcsync/rules.json
"#
        ));

        config.validate().unwrap();
        assert_eq!(config.agent_url.as_str(), "http://localhost:8126/");
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.max_payload_size_bytes, 5 * 1024 * 1024);
        assert_eq!(config.max_extra_services, 64);
        assert_eq!(
            config.products().unwrap(),
            vec![Product::ApmTracing, Product::AsmDd]
        );
        assert_eq!(config.targets_key().unwrap().unwrap().key_id(), "ed7672c9");
        assert_eq!(config.client.language, "rust");
        assert_eq!(config.output_dir, Some(PathBuf::from("/var/lib/rcsync")));
        assert_eq!(config.local_files, vec![PathBuf::from("/etc/rcsync/rules.json")]);

        let identity = config.client.identity();
        assert_eq!(identity.service, "web");
        assert_eq!(identity.tags, vec!["team:core"]);
        assert_ne!(identity.client_id, identity.runtime_id);
    }

    #[test]
    fn test_identity_ids_are_v4_uuids() {
        let client = ClientConfig::default();
        let ids: Vec<String> = (0..20)
            .flat_map(|_| {
                let identity = client.identity();
                [identity.client_id, identity.runtime_id]
            })
            .collect();

        for id in &ids {
            let uuid = Uuid::parse_str(id).unwrap();
            assert_eq!(uuid.get_version_num(), 4, "{id}");
            assert_eq!(id.len(), 36);
        }
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn test_defaults() {
        let config = parse(
            r#"
agent_url: "http://localhost:8126"
products: [APM_TRACING]
"#,
        );
        config.validate().unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert!(!config.integrity_checks);
        assert!(config.targets_key().unwrap().is_none());
        assert!(config.output_dir.is_none());
        assert!(config.local_files.is_empty());
    }

    #[test]
    fn test_invalid_url() {
        let result: Result<Config, _> = serde_yaml::from_str(
            r#"
agent_url: "not a url"
products: [APM_TRACING]
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_errors() {
        let base = parse(
            r#"
agent_url: "http://localhost:8126"
products: [APM_TRACING]
"#,
        );

        let mut config = base.clone();
        config.poll_interval_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::Zero("poll_interval_secs"))
        ));

        let mut config = base.clone();
        config.max_extra_services = 0;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::Zero("max_extra_services"))
        ));

        let mut config = base.clone();
        config.products.clear();
        assert!(matches!(config.validate(), Err(ValidationError::NoProducts)));

        let mut config = base.clone();
        config.products.push("NOT_A_PRODUCT".into());
        assert!(matches!(
            config.validate(),
            Err(ValidationError::UnknownProduct(p)) if p == "NOT_A_PRODUCT"
        ));

        let mut config = base.clone();
        config.integrity_checks = true;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::MissingTargetsKey)
        ));

        let mut config = base.clone();
        config.targets_key = Some(TargetsKeyConfig {
            key_id: "k".into(),
            public_key: "zz".into(),
        });
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidTargetsKey(_))
        ));
    }
}
