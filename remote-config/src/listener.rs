//! Product listener interfaces.
//!
//! Listeners run synchronously on the poll task. A listener that blocks delays every other
//! product for that cycle, so implementations should hand long work off elsewhere.
use crate::config_key::ConfigKey;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum ListenerError {
    /// Surfaced to the server in the next request.
    #[error("{0}")]
    Reportable(String),
    /// Only logged locally.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl ListenerError {
    pub fn reportable(message: impl Into<String>) -> Self {
        ListenerError::Reportable(message.into())
    }

    pub fn other(message: impl Into<String>) -> Self {
        let message: String = message.into();
        ListenerError::Other(message.into())
    }
}

/// Lets a listener ask the poller to change its cadence.
pub trait PollingRateHinter {
    fn suggest_polling_rate(&mut self, interval: Duration);
}

/// Keeps the shortest interval suggested during a cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct PollingHint {
    interval: Option<Duration>,
}

impl PollingHint {
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn reset(&mut self) {
        self.interval = None;
    }
}

impl PollingRateHinter for PollingHint {
    fn suggest_polling_rate(&mut self, interval: Duration) {
        self.interval = Some(match self.interval {
            Some(current) => current.min(interval),
            None => interval,
        });
    }
}

/// Ignores all hints. Local files are not polled from the agent, so their listeners get
/// this one.
pub struct NoopHinter;

impl PollingRateHinter for NoopHinter {
    fn suggest_polling_rate(&mut self, _interval: Duration) {}
}

/// Receives configuration changes one key at a time.
pub trait ProductListener: Send {
    fn accept(
        &mut self,
        key: &ConfigKey,
        content: &[u8],
        hinter: &mut dyn PollingRateHinter,
    ) -> Result<(), ListenerError>;

    fn remove(
        &mut self,
        key: &ConfigKey,
        hinter: &mut dyn PollingRateHinter,
    ) -> Result<(), ListenerError>;

    fn commit(&mut self, hinter: &mut dyn PollingRateHinter) -> Result<(), ListenerError>;
}

/// Receives every changed key of a pass at once, for products that must apply a set of
/// keys atomically.
pub trait BatchProductListener: Send {
    /// Returns the outcome per key. Keys absent from the map are treated as applied.
    fn accept(
        &mut self,
        changes: &[(ConfigKey, Vec<u8>)],
        hinter: &mut dyn PollingRateHinter,
    ) -> HashMap<ConfigKey, Result<(), ListenerError>>;

    fn remove(
        &mut self,
        key: &ConfigKey,
        hinter: &mut dyn PollingRateHinter,
    ) -> Result<(), ListenerError>;

    fn commit(&mut self, hinter: &mut dyn PollingRateHinter) -> Result<(), ListenerError>;
}

/// The listener shape is fixed when a product is registered.
pub enum Listener {
    Single(Box<dyn ProductListener>),
    Batch(Box<dyn BatchProductListener>),
}

impl Listener {
    pub fn single(listener: impl ProductListener + 'static) -> Self {
        Listener::Single(Box::new(listener))
    }

    pub fn batch(listener: impl BatchProductListener + 'static) -> Self {
        Listener::Batch(Box::new(listener))
    }

    pub(crate) fn remove(
        &mut self,
        key: &ConfigKey,
        hinter: &mut dyn PollingRateHinter,
    ) -> Result<(), ListenerError> {
        match self {
            Listener::Single(l) => l.remove(key, hinter),
            Listener::Batch(l) => l.remove(key, hinter),
        }
    }

    pub(crate) fn commit(&mut self, hinter: &mut dyn PollingRateHinter) -> Result<(), ListenerError> {
        match self {
            Listener::Single(l) => l.commit(hinter),
            Listener::Batch(l) => l.commit(hinter),
        }
    }
}

/// Receives the content of a local file, re-read at the start of every poll.
pub trait FileListener: Send {
    fn accept(
        &mut self,
        path: &Path,
        content: &[u8],
        hinter: &mut dyn PollingRateHinter,
    ) -> Result<(), ListenerError>;
}

/// Called once per poll after every product has been reconciled, when anything changed.
pub trait ConfigurationEndListener: Send {
    fn on_configuration_end(&mut self) -> Result<(), ListenerError>;
}
