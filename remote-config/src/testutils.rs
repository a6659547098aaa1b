use crate::config_key::ConfigKey;
use crate::integrity::sha256_hex;
use crate::listener::{
    BatchProductListener, ConfigurationEndListener, FileListener, ListenerError,
    PollingRateHinter, ProductListener,
};
use crate::protocol::{ClientGetConfigsRequest, RawResponse, RawTargetFile};
use crate::transport::{Exchange, Transport, TransportError};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use parking_lot::Mutex;
use serde_json::{Value as JsonValue, json};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Builds poll response bodies.
#[derive(Clone, Default)]
pub struct ResponseBuilder {
    version: u64,
    backend_state: Option<String>,
    client_configs: Vec<String>,
    targets: serde_json::Map<String, JsonValue>,
    files: Vec<(String, Vec<u8>)>,
    signatures: Vec<JsonValue>,
}

impl ResponseBuilder {
    pub fn new(version: u64) -> Self {
        ResponseBuilder {
            version,
            ..Default::default()
        }
    }

    pub fn backend_state(mut self, state: &str) -> Self {
        self.backend_state = Some(state.to_string());
        self
    }

    /// Relevant key with a descriptor and its content.
    pub fn config(self, key: &str, content: &[u8], v: u64) -> Self {
        self.cached(key, content, v).orphan_file(key, content)
    }

    /// Relevant key with a descriptor for `content`, without sending the content.
    pub fn cached(self, key: &str, content: &[u8], v: u64) -> Self {
        let hashes = json!({"sha256": sha256_hex(content)});
        self.client_config(key).descriptor(key, hashes, content.len(), v)
    }

    /// Relevant key without any descriptor.
    pub fn client_config(mut self, key: &str) -> Self {
        self.client_configs.push(key.to_string());
        self
    }

    /// Sends `content` under a descriptor advertising the digest of `advertised`.
    pub fn tampered(self, key: &str, content: &[u8], advertised: &[u8], v: u64) -> Self {
        self.cached(key, advertised, v).orphan_file(key, content)
    }

    /// Relevant key whose descriptor carries no sha256 digest.
    pub fn unhashed(self, key: &str, content: &[u8], v: u64) -> Self {
        self.client_config(key)
            .descriptor(key, json!({}), content.len(), v)
            .orphan_file(key, content)
    }

    /// A target file with no relevance of its own.
    pub fn orphan_file(mut self, path: &str, content: &[u8]) -> Self {
        self.files.push((path.to_string(), content.to_vec()));
        self
    }

    pub fn signature(mut self, keyid: &str, sig: &str) -> Self {
        self.signatures.push(json!({"keyid": keyid, "sig": sig}));
        self
    }

    fn descriptor(mut self, key: &str, hashes: JsonValue, length: usize, v: u64) -> Self {
        self.targets.insert(
            key.to_string(),
            json!({"custom": {"v": v}, "hashes": hashes, "length": length}),
        );
        self
    }

    pub fn signed_json(&self) -> JsonValue {
        let mut signed = json!({
            "_type": "targets",
            "expires": "2030-01-01T00:00:00Z",
            "spec_version": "1.0.0",
            "version": self.version,
            "targets": self.targets,
        });
        if let Some(state) = &self.backend_state {
            signed["custom"] = json!({"opaque_backend_state": state});
        }
        signed
    }

    pub fn raw(&self) -> RawResponse {
        let targets = json!({"signatures": self.signatures, "signed": self.signed_json()});
        RawResponse {
            client_configs: self.client_configs.clone(),
            targets: Some(STANDARD.encode(targets.to_string())),
            target_files: self
                .files
                .iter()
                .map(|(path, content)| RawTargetFile {
                    path: path.clone(),
                    raw: STANDARD.encode(content),
                })
                .collect(),
        }
    }

    pub fn build(&self) -> Vec<u8> {
        serde_json::to_vec(&self.raw()).unwrap()
    }
}

/// Listener calls as observed by the recording listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Accept(String, Vec<u8>),
    AcceptBatch(Vec<String>),
    Remove(String),
    Commit,
    ConfigurationEnd,
    File(String, Vec<u8>),
}

fn copy_error(error: &ListenerError) -> ListenerError {
    match error {
        ListenerError::Reportable(m) => ListenerError::reportable(m.clone()),
        ListenerError::Other(e) => ListenerError::other(e.to_string()),
    }
}

#[derive(Default)]
struct Recording {
    calls: Vec<Call>,
    accept_failures: HashMap<String, ListenerError>,
    remove_failures: HashMap<String, ListenerError>,
    commit_failure: Option<ListenerError>,
    hint: Option<Duration>,
    batch_outcomes: HashMap<ConfigKey, Result<(), ListenerError>>,
}

/// Records every call and fails the ones it is told to. Clones share the recording.
#[derive(Clone, Default)]
pub struct RecordingListener {
    inner: Arc<Mutex<Recording>>,
}

impl RecordingListener {
    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut self.inner.lock().calls)
    }

    pub fn fail_accept(&self, key: &str, error: ListenerError) {
        self.inner.lock().accept_failures.insert(key.to_string(), error);
    }

    pub fn fail_remove(&self, key: &str, error: ListenerError) {
        self.inner.lock().remove_failures.insert(key.to_string(), error);
    }

    pub fn fail_commit(&self, error: ListenerError) {
        self.inner.lock().commit_failure = Some(error);
    }

    pub fn clear_failures(&self) {
        let mut inner = self.inner.lock();
        inner.accept_failures.clear();
        inner.remove_failures.clear();
        inner.commit_failure = None;
    }

    pub fn hint_on_accept(&self, interval: Duration) {
        self.inner.lock().hint = Some(interval);
    }
}

impl ProductListener for RecordingListener {
    fn accept(
        &mut self,
        key: &ConfigKey,
        content: &[u8],
        hinter: &mut dyn PollingRateHinter,
    ) -> Result<(), ListenerError> {
        let mut inner = self.inner.lock();
        inner
            .calls
            .push(Call::Accept(key.to_string(), content.to_vec()));
        if let Some(hint) = inner.hint {
            hinter.suggest_polling_rate(hint);
        }
        match inner.accept_failures.get(key.as_str()) {
            Some(error) => Err(copy_error(error)),
            None => Ok(()),
        }
    }

    fn remove(
        &mut self,
        key: &ConfigKey,
        _hinter: &mut dyn PollingRateHinter,
    ) -> Result<(), ListenerError> {
        let mut inner = self.inner.lock();
        inner.calls.push(Call::Remove(key.to_string()));
        match inner.remove_failures.get(key.as_str()) {
            Some(error) => Err(copy_error(error)),
            None => Ok(()),
        }
    }

    fn commit(&mut self, _hinter: &mut dyn PollingRateHinter) -> Result<(), ListenerError> {
        let mut inner = self.inner.lock();
        inner.calls.push(Call::Commit);
        match &inner.commit_failure {
            Some(error) => Err(copy_error(error)),
            None => Ok(()),
        }
    }
}

/// Batch counterpart of [`RecordingListener`].
#[derive(Clone, Default)]
pub struct RecordingBatchListener {
    inner: Arc<Mutex<Recording>>,
}

impl RecordingBatchListener {
    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut self.inner.lock().calls)
    }

    /// Outcomes returned by the next batch accept.
    pub fn set_outcomes(&self, outcomes: HashMap<ConfigKey, Result<(), ListenerError>>) {
        self.inner.lock().batch_outcomes = outcomes;
    }
}

impl BatchProductListener for RecordingBatchListener {
    fn accept(
        &mut self,
        changes: &[(ConfigKey, Vec<u8>)],
        _hinter: &mut dyn PollingRateHinter,
    ) -> HashMap<ConfigKey, Result<(), ListenerError>> {
        let mut inner = self.inner.lock();
        inner.calls.push(Call::AcceptBatch(
            changes.iter().map(|(key, _)| key.to_string()).collect(),
        ));
        std::mem::take(&mut inner.batch_outcomes)
    }

    fn remove(
        &mut self,
        key: &ConfigKey,
        _hinter: &mut dyn PollingRateHinter,
    ) -> Result<(), ListenerError> {
        self.inner.lock().calls.push(Call::Remove(key.to_string()));
        Ok(())
    }

    fn commit(&mut self, _hinter: &mut dyn PollingRateHinter) -> Result<(), ListenerError> {
        self.inner.lock().calls.push(Call::Commit);
        Ok(())
    }
}

/// Counts configuration-end notifications, optionally failing them.
#[derive(Clone, Default)]
pub struct RecordingEndListener {
    calls: Arc<Mutex<Vec<Call>>>,
    failure: Arc<Mutex<Option<ListenerError>>>,
}

impl RecordingEndListener {
    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock())
    }

    pub fn fail(&self, error: ListenerError) {
        *self.failure.lock() = Some(error);
    }
}

impl ConfigurationEndListener for RecordingEndListener {
    fn on_configuration_end(&mut self) -> Result<(), ListenerError> {
        self.calls.lock().push(Call::ConfigurationEnd);
        match &*self.failure.lock() {
            Some(error) => Err(copy_error(error)),
            None => Ok(()),
        }
    }
}

/// Records local file loads, optionally failing them.
#[derive(Clone, Default)]
pub struct RecordingFileListener {
    calls: Arc<Mutex<Vec<Call>>>,
    failure: Arc<Mutex<Option<ListenerError>>>,
}

impl RecordingFileListener {
    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock())
    }

    pub fn fail(&self, error: ListenerError) {
        *self.failure.lock() = Some(error);
    }
}

impl FileListener for RecordingFileListener {
    fn accept(
        &mut self,
        path: &Path,
        content: &[u8],
        _hinter: &mut dyn PollingRateHinter,
    ) -> Result<(), ListenerError> {
        self.calls
            .lock()
            .push(Call::File(path.display().to_string(), content.to_vec()));
        match &*self.failure.lock() {
            Some(error) => Err(copy_error(error)),
            None => Ok(()),
        }
    }
}

/// A transport that replays scripted exchanges and records every request. Once the
/// script runs out it answers with no change.
#[derive(Clone, Default)]
pub struct MockTransport {
    script: Arc<Mutex<VecDeque<Result<Exchange, TransportError>>>>,
    requests: Arc<Mutex<Vec<ClientGetConfigsRequest>>>,
}

impl MockTransport {
    pub fn respond(&self, body: Vec<u8>) {
        self.script.lock().push_back(Ok(Exchange::Body(body)));
    }

    pub fn no_change(&self) {
        self.script.lock().push_back(Ok(Exchange::NoChange));
    }

    pub fn fail(&self, message: &str) {
        self.script
            .lock()
            .push_back(Err(TransportError::Other(message.to_string())));
    }

    pub fn requests(&self) -> Vec<ClientGetConfigsRequest> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<ClientGetConfigsRequest> {
        self.requests.lock().last().cloned()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn exchange(&self, request: &ClientGetConfigsRequest) -> Result<Exchange, TransportError> {
        self.requests.lock().push(request.clone());
        self.script.lock().pop_front().unwrap_or(Ok(Exchange::NoChange))
    }
}
