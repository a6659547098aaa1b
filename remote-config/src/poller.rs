use crate::config_key::{ConfigKey, Product};
use crate::decoder::{DecodeError, DecodedResponse, ResponseDecoder};
use crate::extra_services::ExtraServices;
use crate::listener::{
    ConfigurationEndListener, FileListener, Listener, ListenerError, NoopHinter, PollingHint,
    ProductListener,
};
use crate::local_file;
use crate::metrics_defs::{POLL_DURATION, POLL_FAILED, POLL_NO_CHANGE};
use crate::protocol::{ClientState, ROOT_VERSION};
use crate::rate_limited::RateLimitedLog;
use crate::reconciler::{ProductState, ReconcileError};
use crate::request::{ClientIdentity, build_request};
use crate::transport::{Exchange, Transport, TransportError};
use shared::{counter, histogram};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(thiserror::Error, Debug)]
pub enum PollError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("could not decode response: {0}")]
    Decode(#[from] DecodeError),
    #[error("the poller has shut down")]
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The agent had nothing new.
    NoChange,
    /// A manifest was reconciled. `dirty` is true when any product committed.
    Reconciled { dirty: bool },
}

#[derive(Debug)]
pub enum Command {
    // Poll immediately. The worker replies once the cycle finishes.
    Refresh(oneshot::Sender<Result<PollOutcome, PollError>>),
    // Stop after the current cycle.
    Shutdown,
}

/// Formats the errors of a cycle into the single message reported to the server.
pub fn build_error_message(errors: &[String]) -> String {
    match errors {
        [] => String::new(),
        [single] => single.clone(),
        many => {
            let mut message = format!(
                "Failed to apply configuration due to {} errors:\n",
                many.len()
            );
            for (i, error) in many.iter().enumerate() {
                let _ = writeln!(message, " ({}) {}", i + 1, error);
            }
            message
        }
    }
}

/// Identifies a registered configuration end listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndListenerId(u64);

/// Polls the agent for configuration and dispatches changes to registered products.
///
/// All reconciliation happens on the task that calls [`ConfigurationPoller::poll`], one
/// cycle at a time. Only the extra service registry is shared with other threads.
pub struct ConfigurationPoller {
    transport: Arc<dyn Transport>,
    decoder: ResponseDecoder,
    identity: ClientIdentity,
    poll_interval: Duration,
    products: BTreeMap<Product, ProductState>,
    end_listeners: Vec<(EndListenerId, Box<dyn ConfigurationEndListener>)>,
    next_end_listener_id: u64,
    file_listeners: BTreeMap<PathBuf, Box<dyn FileListener>>,
    client_state: ClientState,
    capabilities: u64,
    extra_services: Arc<ExtraServices>,
    log: Arc<RateLimitedLog>,
    hint: PollingHint,
}

impl ConfigurationPoller {
    pub fn new(
        transport: Arc<dyn Transport>,
        decoder: ResponseDecoder,
        identity: ClientIdentity,
        poll_interval: Duration,
        extra_services: Arc<ExtraServices>,
    ) -> Self {
        ConfigurationPoller {
            transport,
            decoder,
            identity,
            poll_interval,
            products: BTreeMap::new(),
            end_listeners: Vec::new(),
            next_end_listener_id: 0,
            file_listeners: BTreeMap::new(),
            client_state: ClientState {
                root_version: ROOT_VERSION,
                ..Default::default()
            },
            capabilities: 0,
            extra_services,
            log: Arc::new(RateLimitedLog::default()),
            hint: PollingHint::default(),
        }
    }

    /// Registering a product again replaces its listener and keeps what was applied.
    pub fn register(&mut self, product: Product, listener: Listener) {
        match self.products.get_mut(&product) {
            Some(state) => state.set_listener(listener),
            None => {
                let state = ProductState::new(product, listener, self.log.clone());
                self.products.insert(product, state);
            }
        }
    }

    /// Binds a listener to the keys of `product` whose config id is `config_id`. The
    /// product is subscribed even if it has no product-wide listener.
    pub fn register_config_listener(
        &mut self,
        product: Product,
        config_id: &str,
        listener: impl ProductListener + 'static,
    ) {
        self.products
            .entry(product)
            .or_insert_with(|| ProductState::without_listener(product, self.log.clone()))
            .set_config_listener(config_id, Box::new(listener));
    }

    /// Drops a product with all its listeners and applied state. Its listeners are not
    /// told about the removal, and keys for it are reported as unhandled from then on.
    pub fn unregister(&mut self, product: Product) -> bool {
        self.products.remove(&product).is_some()
    }

    /// Feeds the content of a local file to `listener` at the start of every poll.
    /// Registering the same path again replaces its listener.
    pub fn add_file_listener(
        &mut self,
        path: impl Into<PathBuf>,
        listener: impl FileListener + 'static,
    ) {
        self.file_listeners.insert(path.into(), Box::new(listener));
    }

    pub fn add_configuration_end_listener(
        &mut self,
        listener: impl ConfigurationEndListener + 'static,
    ) -> EndListenerId {
        let id = EndListenerId(self.next_end_listener_id);
        self.next_end_listener_id += 1;
        self.end_listeners.push((id, Box::new(listener)));
        id
    }

    pub fn remove_configuration_end_listener(&mut self, id: EndListenerId) -> bool {
        let before = self.end_listeners.len();
        self.end_listeners.retain(|(listener_id, _)| *listener_id != id);
        self.end_listeners.len() != before
    }

    pub fn add_capabilities(&mut self, flags: u64) {
        self.capabilities |= flags;
    }

    pub fn remove_capabilities(&mut self, flags: u64) {
        self.capabilities &= !flags;
    }

    pub fn capabilities(&self) -> u64 {
        self.capabilities
    }

    pub fn client_state(&self) -> &ClientState {
        &self.client_state
    }

    pub fn extra_services(&self) -> Arc<ExtraServices> {
        self.extra_services.clone()
    }

    /// The delay before the next cycle: the shortest interval a listener suggested
    /// during the last cycle, or the configured interval.
    pub fn next_delay(&self) -> Duration {
        self.hint.interval().unwrap_or(self.poll_interval)
    }

    /// Runs one poll cycle. On failure nothing but the reported error changes.
    pub async fn poll(&mut self) -> Result<PollOutcome, PollError> {
        let start = Instant::now();
        self.hint.reset();

        let result = self.cycle().await;
        histogram!(POLL_DURATION).record(start.elapsed().as_secs_f64());

        match &result {
            Ok(PollOutcome::NoChange) => {
                tracing::debug!("No configuration change");
                counter!(POLL_NO_CHANGE).increment(1);
            }
            Ok(PollOutcome::Reconciled { dirty }) => {
                tracing::debug!(
                    dirty,
                    targets_version = self.client_state.targets_version,
                    "Configuration reconciled"
                );
            }
            Err(e) => {
                counter!(POLL_FAILED).increment(1);
                self.log
                    .warn("poll", format!("Remote configuration poll failed: {e}"));
            }
        }

        result
    }

    async fn cycle(&mut self) -> Result<PollOutcome, PollError> {
        self.load_files().await;
        if self.products.is_empty() {
            return Ok(PollOutcome::NoChange);
        }

        let request = build_request(
            &self.identity,
            &self.client_state,
            &self.products,
            self.capabilities,
            self.extra_services.snapshot(),
        );

        let body = match self.transport.exchange(&request).await? {
            Exchange::NoChange => return Ok(PollOutcome::NoChange),
            Exchange::Body(body) => body,
        };

        let response = match self.decoder.decode(&body) {
            Ok(Some(response)) => response,
            Ok(None) => return Ok(PollOutcome::NoChange),
            Err(e) => {
                if e.is_reportable() {
                    self.set_errors(&[e.to_string()]);
                }
                return Err(e.into());
            }
        };

        Ok(self.apply(&response))
    }

    async fn load_files(&mut self) {
        let max_size = self.decoder.max_payload_size();
        for (path, listener) in self.file_listeners.iter_mut() {
            tracing::debug!(path = %path.display(), "Loading configuration from file");
            let content = match local_file::load(path, max_size).await {
                Ok(content) => content,
                Err(e) => {
                    self.log.warn(
                        "file.load",
                        format!("Unable to load config file {}: {e}", path.display()),
                    );
                    continue;
                }
            };

            if let Err(e) = listener.accept(path, &content, &mut NoopHinter) {
                self.log.warn(
                    "file.apply",
                    format!("Failed applying configuration from {}: {e}", path.display()),
                );
            }
        }
    }

    fn apply(&mut self, response: &DecodedResponse) -> PollOutcome {
        let mut errors = Vec::new();

        let mut relevant: BTreeMap<Product, Vec<ConfigKey>> =
            self.products.keys().map(|p| (*p, Vec::new())).collect();
        for raw in &response.client_configs {
            let key = match ConfigKey::parse(raw) {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!("{e}");
                    errors.push(ReconcileError::InvalidKey(e.to_string()).to_string());
                    continue;
                }
            };

            match relevant.get_mut(&key.product()) {
                Some(keys) if key.product() != Product::Unknown => keys.push(key),
                _ => {
                    let error = ReconcileError::UnhandledProduct {
                        key: raw.clone(),
                        product: key.product_name().to_string(),
                    };
                    tracing::warn!("{error}");
                    errors.push(error.to_string());
                }
            }
        }

        let mut dirty = false;
        for (product, state) in self.products.iter_mut() {
            let keys = relevant.remove(product).unwrap_or_default();
            let report = state.reconcile(response, &keys, &mut self.hint);
            dirty |= report.is_dirty();
            if let Some(error) = state.error() {
                errors.push(error.to_string());
            }
        }

        if dirty {
            for (_, listener) in self.end_listeners.iter_mut() {
                match listener.on_configuration_end() {
                    Ok(()) => {}
                    Err(ListenerError::Reportable(message)) => errors.push(message),
                    Err(ListenerError::Other(e)) => self.log.warn(
                        "configuration_end",
                        format!("Error running configuration end listener: {e}"),
                    ),
                }
            }
        }

        if errors.is_empty() {
            self.client_state.targets_version = response.manifest.version;
        }
        self.client_state.backend_client_state = response
            .manifest
            .opaque_backend_state()
            .map(str::to_string);
        self.set_errors(&errors);

        PollOutcome::Reconciled { dirty }
    }

    fn set_errors(&mut self, errors: &[String]) {
        self.client_state.has_error = !errors.is_empty();
        self.client_state.error = build_error_message(errors);
    }

    /// Moves the poller onto its own task.
    pub fn spawn(self) -> PollerHandle {
        let (tx, rx) = mpsc::channel::<Command>(16);
        let handle = tokio::spawn(self.run(rx));
        PollerHandle { tx, handle }
    }

    /// Polls once, then after every delay until `Shutdown` is received or every sender
    /// is dropped. `Refresh` polls immediately and restarts the delay.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let _ = self.poll().await;

        loop {
            let delay = self.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = self.poll().await;
                }
                cmd = rx.recv() => match cmd {
                    Some(Command::Refresh(reply)) => {
                        let result = self.poll().await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Shutdown) | None => break,
                },
            }
        }

        tracing::info!("Remote configuration poller stopped");
    }
}

/// Controls a spawned poller.
pub struct PollerHandle {
    tx: mpsc::Sender<Command>,
    handle: JoinHandle<()>,
}

impl PollerHandle {
    /// Polls now and waits for the result.
    pub async fn refresh(&self) -> Result<PollOutcome, PollError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Refresh(reply))
            .await
            .map_err(|_| PollError::Shutdown)?;
        rx.await.map_err(|_| PollError::Shutdown)?
    }

    /// Stops the poller between cycles and waits for it to finish.
    pub async fn shutdown(self) {
        let _ = self.tx.send(Command::Shutdown).await;
        if let Err(e) = self.handle.await {
            tracing::error!("Remote configuration poller task failed: {e}");
        }
    }
}
