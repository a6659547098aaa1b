//! Configuration keys as addressed by the remote configuration server.
//!
//! A key has the form `org[/version]/product/config_id/path`. The trailing path segment
//! is only kept as part of the raw string.
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::LazyLock;

static CONFIG_KEY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([^/]+)(/\d+)?/([^/]+)/([^/]+)/[^/]+$").expect("invalid config key pattern")
});

/// Products a client can subscribe to. Names the client does not know about map to
/// `Unknown` so that new server-side products never break parsing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Product {
    ApmTracing,
    AgentConfig,
    AgentTask,
    LiveDebugging,
    LiveDebuggingSymbolDb,
    Asm,
    AsmDd,
    AsmData,
    AsmFeatures,
    Debug,
    FfeFlags,
    Unknown,
}

impl Product {
    pub const KNOWN: &'static [Product] = &[
        Product::ApmTracing,
        Product::AgentConfig,
        Product::AgentTask,
        Product::LiveDebugging,
        Product::LiveDebuggingSymbolDb,
        Product::Asm,
        Product::AsmDd,
        Product::AsmData,
        Product::AsmFeatures,
        Product::Debug,
        Product::FfeFlags,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Product::ApmTracing => "APM_TRACING",
            Product::AgentConfig => "AGENT_CONFIG",
            Product::AgentTask => "AGENT_TASK",
            Product::LiveDebugging => "LIVE_DEBUGGING",
            Product::LiveDebuggingSymbolDb => "LIVE_DEBUGGING_SYMBOL_DB",
            Product::Asm => "ASM",
            Product::AsmDd => "ASM_DD",
            Product::AsmData => "ASM_DATA",
            Product::AsmFeatures => "ASM_FEATURES",
            Product::Debug => "DEBUG",
            Product::FfeFlags => "FFE_FLAGS",
            Product::Unknown => "_UNKNOWN",
        }
    }

    /// Case-insensitive lookup. Never fails.
    pub fn from_name(name: &str) -> Product {
        Product::KNOWN
            .iter()
            .copied()
            .find(|p| p.as_str().eq_ignore_ascii_case(name))
            .unwrap_or(Product::Unknown)
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Product {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ConfigKeyError {
    #[error("not a valid config key: {0}")]
    InvalidKey(String),
}

/// A parsed configuration key. Equality, ordering and hashing only consider the raw
/// string the key was parsed from.
#[derive(Clone, Debug)]
pub struct ConfigKey {
    raw: String,
    org: String,
    version: Option<u64>,
    product: Product,
    product_name: String,
    config_id: String,
}

impl ConfigKey {
    pub fn parse(raw: &str) -> Result<Self, ConfigKeyError> {
        let invalid = || ConfigKeyError::InvalidKey(raw.to_string());
        let captures = CONFIG_KEY_PATTERN.captures(raw).ok_or_else(invalid)?;

        let version = match captures.get(2) {
            Some(m) => Some(m.as_str()[1..].parse::<u64>().map_err(|_| invalid())?),
            None => None,
        };
        let product_name = captures[3].to_string();

        Ok(ConfigKey {
            raw: raw.to_string(),
            org: captures[1].to_string(),
            version,
            product: Product::from_name(&product_name),
            product_name,
            config_id: captures[4].to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn org(&self) -> &str {
        &self.org
    }

    pub fn version(&self) -> Option<u64> {
        self.version
    }

    pub fn product(&self) -> Product {
        self.product
    }

    /// The product segment as sent by the server, even when it is not a known product.
    pub fn product_name(&self) -> &str {
        &self.product_name
    }

    pub fn config_id(&self) -> &str {
        &self.config_id
    }
}

impl PartialEq for ConfigKey {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for ConfigKey {}

impl Hash for ConfigKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl PartialOrd for ConfigKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ConfigKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for ConfigKey {
    type Err = ConfigKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigKey::parse(s)
    }
}

impl Serialize for ConfigKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for ConfigKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ConfigKey::parse(&raw).map_err(serde::de::Error::custom)
    }
}
