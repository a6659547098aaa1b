//! Per-product reconciliation.
//!
//! Each poll, a product's previously applied state is diffed against the new manifest.
//! [`plan`] is pure: it decides which keys to apply, which to remove and whether the pass
//! ends with a commit. [`ProductState::reconcile`] then executes the plan against the
//! product's listener and folds the outcomes back into the state.
//!
//! Cache updates follow two rules:
//! - a key whose content was verified is cached even if the listener rejected it, so a
//!   consumer failure is not retried forever;
//! - protocol failures (missing descriptor, missing content, digest mismatch) leave the
//!   cache untouched so the key is retried on the next poll.
use crate::config_key::{ConfigKey, Product};
use crate::decoder::DecodedResponse;
use crate::integrity::{self, IntegrityError, Verification};
use crate::listener::{Listener, ListenerError, PollingRateHinter, ProductListener};
use crate::metrics_defs::{CONFIGS_APPLIED, CONFIGS_REJECTED, CONFIGS_REMOVED, INTEGRITY_FAILED};
use crate::protocol::{ApplyState, CachedTargetFile, ConfigState, TargetDescriptor};
use crate::rate_limited::RateLimitedLog;
use shared::counter;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Errors reported back to the server for a single key or pass.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ReconcileError {
    #[error("Told to apply config {0} but no target descriptor is present in targets.signed")]
    MissingTarget(ConfigKey),
    #[error(
        "Told to apply config {0} but content not present even though hash differs from that of 'cached file'"
    )]
    MissingContent(ConfigKey),
    #[error("No content for {0}")]
    NoContent(ConfigKey),
    #[error("Integrity check failed for {key}: {source}")]
    Integrity { key: ConfigKey, source: IntegrityError },
    #[error("{0}")]
    Listener(String),
    #[error("Told to handle config key {key}, but the product {product} is not being handled")]
    UnhandledProduct { key: String, product: String },
    #[error("{0}")]
    InvalidKey(String),
}

impl ReconcileError {
    /// Content that was never cached and is not sent is usually a transient server state.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReconcileError::NoContent(_))
    }
}

/// Last apply outcome for a key.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigOutcome {
    pub key: ConfigKey,
    pub version: u64,
    pub error: Option<String>,
}

impl ConfigOutcome {
    pub fn to_config_state(&self) -> ConfigState {
        ConfigState {
            id: self.key.config_id().to_string(),
            version: self.version,
            product: self.key.product(),
            apply_state: match self.error {
                Some(_) => ApplyState::Error,
                None => ApplyState::Acknowledged,
            },
            apply_error: self.error.clone(),
        }
    }
}

/// Applied state of one product.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductSnapshot {
    pub cached: BTreeMap<ConfigKey, CachedTargetFile>,
    pub outcomes: BTreeMap<ConfigKey, ConfigOutcome>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Apply {
        key: ConfigKey,
        content: Vec<u8>,
        descriptor: TargetDescriptor,
        verification: Verification,
    },
    Remove {
        key: ConfigKey,
    },
    Commit,
}

/// A key that could not be applied because of a protocol or integrity failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub key: ConfigKey,
    /// Known when the manifest carried a descriptor for the key.
    pub version: Option<u64>,
    pub error: ReconcileError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub effects: Vec<Effect>,
    pub rejections: Vec<Rejection>,
    /// Keys with an outcome but no cache entry that are no longer relevant. They were
    /// never applied, so they are forgotten without notifying the listener.
    pub forgotten: Vec<ConfigKey>,
}

impl Plan {
    pub fn is_dirty(&self) -> bool {
        self.effects.contains(&Effect::Commit)
    }
}

/// Computes the effects needed to move `state` to what `response` describes for the
/// given relevant keys.
pub fn plan(state: &ProductSnapshot, response: &DecodedResponse, relevant: &[ConfigKey]) -> Plan {
    let mut plan = Plan::default();
    let mut seen = BTreeSet::new();

    for key in relevant {
        if !seen.insert(key) {
            continue;
        }

        let Some(descriptor) = response.descriptor(key) else {
            plan.rejections.push(Rejection {
                key: key.clone(),
                version: None,
                error: ReconcileError::MissingTarget(key.clone()),
            });
            continue;
        };

        let cached = state.cached.get(key);
        if cached.is_some_and(|c| c.matches(descriptor)) {
            continue;
        }

        let reject = |error| Rejection {
            key: key.clone(),
            version: Some(descriptor.version()),
            error,
        };

        let Some(content) = response.content(key) else {
            let error = match cached {
                Some(_) => ReconcileError::MissingContent(key.clone()),
                None => ReconcileError::NoContent(key.clone()),
            };
            plan.rejections.push(reject(error));
            continue;
        };

        match integrity::verify(content, descriptor) {
            Ok(verification) => plan.effects.push(Effect::Apply {
                key: key.clone(),
                content: content.to_vec(),
                descriptor: descriptor.clone(),
                verification,
            }),
            Err(source) => plan.rejections.push(reject(ReconcileError::Integrity {
                key: key.clone(),
                source,
            })),
        }
    }

    for key in state.cached.keys() {
        if !seen.contains(key) {
            plan.effects.push(Effect::Remove { key: key.clone() });
        }
    }

    plan.forgotten = state
        .outcomes
        .keys()
        .filter(|k| !seen.contains(k) && !state.cached.contains_key(*k))
        .cloned()
        .collect();

    if !plan.effects.is_empty() {
        plan.effects.push(Effect::Commit);
    }

    plan
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    pub applied: usize,
    pub removed: usize,
    pub rejected: usize,
    pub committed: bool,
    /// Keys applied without a sha256 digest to check against.
    pub unverified: Vec<ConfigKey>,
}

impl PassReport {
    pub fn is_dirty(&self) -> bool {
        self.committed
    }
}

/// Outcome of a pass, threaded through execution. The first reportable error wins.
#[derive(Default)]
struct PassAccumulator {
    first_error: Option<ReconcileError>,
    report: PassReport,
}

impl PassAccumulator {
    fn record_error(&mut self, error: ReconcileError) {
        if self.first_error.is_none() {
            self.first_error = Some(error);
        }
    }
}

/// Reconciler state for one registered product.
///
/// A product has at most one product-wide listener plus any number of listeners bound to a
/// single config id. Config listeners see accept and remove calls for keys with their
/// config id only, and are committed with every dirty pass.
pub struct ProductState {
    product: Product,
    listener: Option<Listener>,
    config_listeners: BTreeMap<String, Box<dyn ProductListener>>,
    snapshot: ProductSnapshot,
    error: Option<ReconcileError>,
    log: Arc<RateLimitedLog>,
}

impl ProductState {
    pub fn new(product: Product, listener: Listener, log: Arc<RateLimitedLog>) -> Self {
        let mut state = ProductState::without_listener(product, log);
        state.listener = Some(listener);
        state
    }

    pub fn without_listener(product: Product, log: Arc<RateLimitedLog>) -> Self {
        ProductState {
            product,
            listener: None,
            config_listeners: BTreeMap::new(),
            snapshot: ProductSnapshot::default(),
            error: None,
            log,
        }
    }

    pub fn product(&self) -> Product {
        self.product
    }

    pub fn snapshot(&self) -> &ProductSnapshot {
        &self.snapshot
    }

    /// The reportable error of the most recent pass.
    pub fn error(&self) -> Option<&ReconcileError> {
        self.error.as_ref()
    }

    pub fn set_listener(&mut self, listener: Listener) {
        self.listener = Some(listener);
    }

    /// Binds `listener` to keys whose config id is `config_id`, replacing any previous one.
    pub fn set_config_listener(&mut self, config_id: &str, listener: Box<dyn ProductListener>) {
        self.config_listeners.insert(config_id.to_string(), listener);
    }

    pub fn cached_target_files(&self) -> impl Iterator<Item = &CachedTargetFile> {
        self.snapshot.cached.values()
    }

    pub fn config_states(&self) -> impl Iterator<Item = ConfigState> + '_ {
        self.snapshot.outcomes.values().map(ConfigOutcome::to_config_state)
    }

    pub fn reconcile(
        &mut self,
        response: &DecodedResponse,
        relevant: &[ConfigKey],
        hinter: &mut dyn PollingRateHinter,
    ) -> PassReport {
        self.error = None;

        let plan = plan(&self.snapshot, response, relevant);
        let mut pass = PassAccumulator::default();

        for key in &plan.forgotten {
            self.snapshot.outcomes.remove(key);
        }

        for rejection in plan.rejections {
            self.reject(rejection, &mut pass);
        }

        let mut applies = Vec::new();
        let mut removals = Vec::new();
        let mut commit = false;
        for effect in plan.effects {
            match effect {
                Effect::Apply {
                    key,
                    content,
                    descriptor,
                    verification,
                } => {
                    if verification == Verification::Unverified {
                        tracing::warn!(product = %self.product, key = %key, "No sha256 digest advertised, applying unverified content");
                        pass.report.unverified.push(key.clone());
                    }
                    applies.push((key, content, descriptor));
                }
                Effect::Remove { key } => removals.push(key),
                Effect::Commit => commit = true,
            }
        }

        self.apply(applies, hinter, &mut pass);

        for key in removals {
            self.remove(&key, hinter, &mut pass);
        }

        if commit {
            self.commit(hinter, &mut pass);
        }

        self.error = pass.first_error;
        pass.report
    }

    fn commit(&mut self, hinter: &mut dyn PollingRateHinter, pass: &mut PassAccumulator) {
        tracing::debug!(product = %self.product, "Committing configuration changes");
        let mut results = Vec::with_capacity(self.config_listeners.len() + 1);
        if let Some(listener) = self.listener.as_mut() {
            results.push(listener.commit(hinter));
        }
        for listener in self.config_listeners.values_mut() {
            results.push(listener.commit(hinter));
        }

        for result in results {
            match result {
                Ok(()) => {}
                Err(ListenerError::Reportable(message)) => {
                    pass.record_error(ReconcileError::Listener(message))
                }
                Err(ListenerError::Other(e)) => self.log.warn(
                    "listener.commit",
                    format!("Error committing configuration for {}: {e}", self.product),
                ),
            }
        }
        pass.report.committed = true;
    }

    fn reject(&mut self, rejection: Rejection, pass: &mut PassAccumulator) {
        let Rejection {
            key,
            version,
            error,
        } = rejection;

        if error.is_transient() {
            tracing::debug!(product = %self.product, key = %key, "{error}");
        } else {
            tracing::warn!(product = %self.product, key = %key, "{error}");
        }

        if matches!(error, ReconcileError::Integrity { .. }) {
            counter!(INTEGRITY_FAILED).increment(1);
        }
        counter!(CONFIGS_REJECTED).increment(1);
        pass.report.rejected += 1;

        if let Some(version) = version {
            self.snapshot.outcomes.insert(
                key.clone(),
                ConfigOutcome {
                    key,
                    version,
                    error: Some(error.to_string()),
                },
            );
        }
        pass.record_error(error);
    }

    fn apply(
        &mut self,
        applies: Vec<(ConfigKey, Vec<u8>, TargetDescriptor)>,
        hinter: &mut dyn PollingRateHinter,
        pass: &mut PassAccumulator,
    ) {
        if applies.is_empty() {
            return;
        }

        type Applied = (ConfigKey, Vec<u8>, TargetDescriptor, Result<(), ListenerError>);
        let results: Vec<Applied> = match &mut self.listener {
            Some(Listener::Single(listener)) => applies
                .into_iter()
                .map(|(key, content, descriptor)| {
                    tracing::debug!(product = %self.product, key = %key, "Applying configuration");
                    let result = listener.accept(&key, &content, hinter);
                    (key, content, descriptor, result)
                })
                .collect(),
            Some(Listener::Batch(listener)) => {
                let (changes, descriptors): (Vec<_>, Vec<_>) = applies
                    .into_iter()
                    .map(|(key, content, descriptor)| ((key, content), descriptor))
                    .unzip();
                tracing::debug!(product = %self.product, count = changes.len(), "Applying configuration batch");
                let mut outcomes = listener.accept(&changes, hinter);
                changes
                    .into_iter()
                    .zip(descriptors)
                    .map(|((key, content), descriptor)| {
                        let result = outcomes.remove(&key).unwrap_or(Ok(()));
                        (key, content, descriptor, result)
                    })
                    .collect()
            }
            None => applies
                .into_iter()
                .map(|(key, content, descriptor)| (key, content, descriptor, Ok(())))
                .collect(),
        };

        for (key, content, descriptor, result) in results {
            // The product-wide outcome takes precedence over the config listener's.
            let result = match self.config_listeners.get_mut(key.config_id()) {
                Some(listener) => result.and(listener.accept(&key, &content, hinter)),
                None => result,
            };

            let error = match result {
                Ok(()) => {
                    counter!(CONFIGS_APPLIED).increment(1);
                    None
                }
                Err(ListenerError::Reportable(message)) => {
                    tracing::warn!(product = %self.product, key = %key, "Listener rejected configuration: {message}");
                    pass.record_error(ReconcileError::Listener(message.clone()));
                    Some(message)
                }
                Err(ListenerError::Other(e)) => {
                    self.log.warn(
                        "listener.accept",
                        format!("Error handling configuration for {key}: {e}"),
                    );
                    Some(e.to_string())
                }
            };

            self.snapshot.outcomes.insert(
                key.clone(),
                ConfigOutcome {
                    key: key.clone(),
                    version: descriptor.version(),
                    error,
                },
            );
            self.snapshot.cached.insert(
                key.clone(),
                CachedTargetFile::from_descriptor(key.as_str(), &descriptor),
            );
            pass.report.applied += 1;
        }
    }

    fn remove(
        &mut self,
        key: &ConfigKey,
        hinter: &mut dyn PollingRateHinter,
        pass: &mut PassAccumulator,
    ) {
        tracing::debug!(product = %self.product, key = %key, "Removing configuration");
        let mut results = Vec::with_capacity(2);
        if let Some(listener) = self.listener.as_mut() {
            results.push(listener.remove(key, hinter));
        }
        if let Some(listener) = self.config_listeners.get_mut(key.config_id()) {
            results.push(listener.remove(key, hinter));
        }
        for e in results.into_iter().filter_map(Result::err) {
            self.log.warn(
                "listener.remove",
                format!("Error removing configuration for {key}: {e}"),
            );
        }

        self.snapshot.cached.remove(key);
        self.snapshot.outcomes.remove(key);
        counter!(CONFIGS_REMOVED).increment(1);
        pass.report.removed += 1;
    }
}
