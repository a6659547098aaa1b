//! Client side of the remote configuration protocol.
//!
//! A [`ConfigurationPoller`] periodically asks the agent for the signed targets manifest,
//! verifies what it receives and reconciles it against what each registered product has
//! already applied. Changes reach products through their [`ProductListener`] or
//! [`BatchProductListener`] as accept, remove and commit calls.
pub mod config;
pub mod config_key;
pub mod decoder;
pub mod extra_services;
pub mod integrity;
pub mod listener;
pub mod local_file;
pub mod metrics_defs;
pub mod poller;
pub mod protocol;
pub mod rate_limited;
pub mod reconciler;
pub mod request;
pub mod signature;
pub mod sinks;
pub mod transport;

#[cfg(test)]
mod testutils;

pub use config::{Config, ValidationError};
pub use config_key::{ConfigKey, ConfigKeyError, Product};
pub use decoder::{DecodeError, ResponseDecoder};
pub use extra_services::ExtraServices;
pub use listener::{
    BatchProductListener, ConfigurationEndListener, FileListener, Listener, ListenerError,
    NoopHinter, PollingRateHinter, ProductListener,
};
pub use poller::{ConfigurationPoller, EndListenerId, PollError, PollOutcome, PollerHandle};
pub use transport::{HttpTransport, Transport, TransportError};
