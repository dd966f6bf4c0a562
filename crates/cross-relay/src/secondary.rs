//! Secondary relay.
//!
//! One per isolated context. Talks only to the primary: every outbound
//! event is tagged with the local domain and passes through the send
//! pipeline; every inbound message is re-emitted locally.

use std::sync::Arc;

use cross_relay_core::{
    ContextHandle, DefaultPreprocessor, Emitter, Envelope, InboundSink, ListenerId,
    OutboundPayload, Port, Preprocessor, RelayConfig, SnapshotProvider, Subject, TransportError,
    preprocess::{preprocess_config, preprocess_env},
    traits::post_message,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{error::RelayError, pipeline};

/// Options for [`SecondaryRelay::send_to_primary`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Push a configuration snapshot ahead of the event.
    pub sync_globals: bool,
}

impl SendOptions {
    /// Options that sync globals before sending.
    #[must_use]
    pub const fn sync_globals() -> Self {
        Self { sync_globals: true }
    }
}

/// Secondary side of the boundary.
pub struct SecondaryRelay {
    domain: String,
    config: RelayConfig,
    parent: Arc<dyn Port>,
    preprocessor: Arc<dyn Preprocessor>,
    snapshot: Option<Arc<dyn SnapshotProvider>>,
    emitter: Emitter<Value>,
}

impl SecondaryRelay {
    /// Create a secondary relay for `domain` that sends through `parent`.
    ///
    /// # Errors
    /// Returns error if the config is invalid.
    pub fn new(
        domain: impl Into<String>,
        parent: Arc<dyn Port>,
        config: RelayConfig,
    ) -> Result<Self, RelayError> {
        config.validate()?;
        Ok(Self {
            domain: domain.into(),
            preprocessor: Arc::new(DefaultPreprocessor::from(&config)),
            config,
            parent,
            snapshot: None,
            emitter: Emitter::new(),
        })
    }

    /// Replace the serialization preprocessor.
    #[must_use]
    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn Preprocessor>) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    /// Set the provider used when globals are synced.
    #[must_use]
    pub fn with_snapshot_provider(mut self, provider: Arc<dyn SnapshotProvider>) -> Self {
        self.snapshot = Some(provider);
        self
    }

    /// Logical domain of this context.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    #[must_use]
    pub fn preprocessor(&self) -> &dyn Preprocessor {
        self.preprocessor.as_ref()
    }

    /// The local emitter, e.g. for [`Emitter::stream`].
    #[must_use]
    pub const fn emitter(&self) -> &Emitter<Value> {
        &self.emitter
    }

    /// Register a listener.
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.emitter.on(event, listener)
    }

    /// Register a one-shot listener.
    pub fn once<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.emitter.once(event, listener)
    }

    /// Remove a listener.
    pub fn off(&self, id: ListenerId) -> bool {
        self.emitter.off(id)
    }

    /// Emit a local event without crossing the boundary.
    pub fn emit(&self, event: &str, data: &Value) -> bool {
        self.emitter.emit(event, data)
    }

    /// Handle one message from the primary.
    ///
    /// The channel on this side only carries relay traffic, so the prefix
    /// is stripped when present but not required.
    pub fn receive(&self, message: Value) {
        if message.is_null() {
            return;
        }

        let Envelope { event, data, .. } = match serde_json::from_value::<Envelope>(message) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "Dropping unreadable message from primary");
                return;
            }
        };

        let event = event.strip_prefix(&self.config.prefix).unwrap_or(&event);
        self.emitter.emit(event, &data.unwrap_or(Value::Null));
    }

    /// Announce to the primary that this context is ready to receive.
    ///
    /// # Errors
    /// Returns error if the transport fails unrecoverably.
    pub fn ready(&self) -> Result<(), RelayError> {
        debug!(domain = %self.domain, "<= handshake");
        self.send(&self.config.handshake_event, OutboundPayload::new())
    }

    /// Send an event to the primary.
    ///
    /// Unserializable subjects and failing sends degrade into a delivered
    /// error or type name rather than being lost.
    ///
    /// # Errors
    /// Returns error only if the transport fails unrecoverably.
    pub fn send_to_primary(
        &self,
        event: &str,
        payload: impl Into<OutboundPayload>,
        options: SendOptions,
    ) -> Result<(), RelayError> {
        debug!(event, domain = %self.domain, "<= to primary");
        if self.config.is_reserved(event) {
            warn!(event, "Application event uses a reserved relay name");
        }
        if options.sync_globals {
            self.sync_globals_to_primary()?;
        }
        self.send(event, payload.into())
    }

    /// Push the current configuration and environment to the primary.
    ///
    /// A snapshot that cannot be sanitized is sent as the event's `err`
    /// instead, so the primary still hears about the sync.
    ///
    /// # Errors
    /// Returns error only if the transport fails unrecoverably.
    pub fn sync_globals_to_primary(&self) -> Result<(), RelayError> {
        let Some(provider) = &self.snapshot else {
            debug!("No snapshot provider, skipping globals sync");
            return Ok(());
        };

        let snapshot = preprocess_config(self.preprocessor(), &provider.config()).and_then(
            |config| Ok((config, preprocess_env(self.preprocessor(), &provider.env())?)),
        );
        let payload = match snapshot {
            Ok((config, env)) => OutboundPayload::new()
                .field("config", config)
                .field("env", env),
            Err(e) => {
                warn!(error = %e, "Globals snapshot could not be sanitized, sending the failure");
                OutboundPayload::new().error(e)
            }
        };
        self.send(&self.config.sync_globals_event, payload)
    }

    fn send(&self, event: &str, payload: OutboundPayload) -> Result<(), RelayError> {
        let wire_event = self.config.wire_event(event);
        pipeline::attempt_send(payload, self.preprocessor(), |data| {
            if let Some(subject) = data.subject {
                check_subject(self.preprocessor(), subject)?;
            }
            let envelope = Envelope {
                event: wire_event.clone(),
                data: Some(data),
                domain: Some(self.domain.clone()),
            };
            post_message(self.parent.as_ref(), &envelope)
        })?;
        Ok(())
    }
}

/// Structured-clone check for a subject.
///
/// A subject nested deeper than the preprocessor allows cannot be decoded
/// on the other side, so it fails like an unclonable one.
fn check_subject(preprocessor: &dyn Preprocessor, subject: &Subject) -> Result<(), TransportError> {
    let value = subject.to_value()?;
    preprocessor
        .preprocess(&value)
        .map_err(|e| TransportError::DataClone(e.to_string()))?;
    Ok(())
}

impl InboundSink for SecondaryRelay {
    fn receive(&self, message: Value, _sender: Option<ContextHandle>) {
        Self::receive(self, message);
    }
}

impl std::fmt::Debug for SecondaryRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecondaryRelay")
            .field("domain", &self.domain)
            .field("emitter", &self.emitter)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use parking_lot::Mutex;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    #[derive(Default)]
    struct RecordingPort {
        posted: Mutex<Vec<Value>>,
        closed: bool,
    }

    impl Port for RecordingPort {
        fn post(&self, message: Value) -> Result<(), TransportError> {
            if self.closed {
                return Err(TransportError::Disconnected);
            }
            self.posted.lock().push(message);
            Ok(())
        }
    }

    struct FixedSnapshot;

    impl SnapshotProvider for FixedSnapshot {
        fn config(&self) -> Value {
            json!({"baseUrl": "http://a.com", "retries": 2})
        }

        fn env(&self) -> Value {
            json!({"TOKEN": "abc"})
        }
    }

    struct DeepGlobals;

    impl SnapshotProvider for DeepGlobals {
        fn config(&self) -> Value {
            nested(100)
        }

        fn env(&self) -> Value {
            json!({})
        }
    }

    fn nested(depth: usize) -> Value {
        (0..depth).fold(json!(1), |acc, _| json!({ "n": acc }))
    }

    fn relay() -> (SecondaryRelay, Arc<RecordingPort>) {
        let port = Arc::new(RecordingPort::default());
        let relay = SecondaryRelay::new("a.com", port.clone(), RelayConfig::default()).unwrap();
        (relay, port)
    }

    #[test]
    fn test_ready_sends_handshake() {
        let (relay, port) = relay();
        assert_ok!(relay.ready());
        assert_eq!(
            port.posted.lock().as_slice(),
            &[json!({"event": "cross:domain:bridge:ready", "data": {}, "domain": "a.com"})]
        );
    }

    #[test]
    fn test_receive_emits_locally() {
        let (relay, _) = relay();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        relay.on("ping", move |data| sink.lock().push(data.clone()));

        relay.receive(json!({"event": "cross:domain:ping", "data": {"x": 1}}));
        relay.receive(json!({"event": "ping"}));
        relay.receive(Value::Null);
        relay.receive(json!("garbage"));

        assert_eq!(*seen.lock(), vec![json!({"x": 1}), Value::Null]);
    }

    #[test]
    fn test_send_tags_domain_and_prefix() {
        let (relay, port) = relay();
        assert_ok!(relay.send_to_primary("log:added", json!({"id": 1}), SendOptions::default()));
        assert_eq!(
            port.posted.lock()[0],
            json!({"event": "cross:domain:log:added", "data": {"id": 1}, "domain": "a.com"})
        );
    }

    #[test]
    fn test_unclonable_subject_arrives_as_type_name() {
        let (relay, port) = relay();
        let subject: HashMap<(u8, u8), u8> = HashMap::from([((0, 0), 0)]);

        assert_ok!(relay.send_to_primary(
            "pong",
            OutboundPayload::new().subject(subject),
            SendOptions::default(),
        ));

        let posted = port.posted.lock();
        assert_eq!(posted.len(), 1);
        assert_eq!(
            posted[0]["data"],
            json!({"unserializableSubjectType": "HashMap<(u8, u8), u8>"})
        );
    }

    #[test]
    fn test_sync_globals_goes_first() {
        let (relay, port) = relay();
        let relay = relay.with_snapshot_provider(Arc::new(FixedSnapshot));

        assert_ok!(relay.send_to_primary("sync", json!({}), SendOptions::sync_globals()));

        let posted = port.posted.lock();
        assert_eq!(posted.len(), 2);
        assert_eq!(posted[0]["event"], json!("cross:domain:sync:globals"));
        assert_eq!(
            posted[0]["data"],
            json!({
                "config": {"baseUrl": "http://a.com", "retries": 2},
                "env": {"TOKEN": "abc"},
            })
        );
        assert_eq!(posted[1]["event"], json!("cross:domain:sync"));
    }

    #[test]
    fn test_too_deep_subject_arrives_as_type_name() {
        let (relay, port) = relay();

        assert_ok!(relay.send_to_primary(
            "pong",
            OutboundPayload::new().field("id", json!(1)).subject(nested(200)),
            SendOptions::default(),
        ));

        let posted = port.posted.lock();
        assert_eq!(posted.len(), 1);
        assert_eq!(
            posted[0]["data"],
            json!({"id": 1, "unserializableSubjectType": "Value"})
        );
    }

    #[test]
    fn test_unsanitizable_globals_are_sent_as_error() {
        let (relay, port) = relay();
        let relay = relay.with_snapshot_provider(Arc::new(DeepGlobals));

        assert_ok!(relay.send_to_primary("sync", json!({"n": 1}), SendOptions::sync_globals()));

        let posted = port.posted.lock();
        assert_eq!(posted.len(), 2);
        assert_eq!(posted[0]["event"], json!("cross:domain:sync:globals"));
        assert_eq!(posted[0]["data"]["err"]["name"], json!("PreprocessError"));
        assert!(posted[0]["data"].get("config").is_none());
        assert_eq!(posted[1]["event"], json!("cross:domain:sync"));
        assert_eq!(posted[1]["data"], json!({"n": 1}));
    }

    #[test]
    fn test_sync_globals_without_provider_sends_event_only() {
        let (relay, port) = relay();
        assert_ok!(relay.send_to_primary("sync", json!({}), SendOptions::sync_globals()));
        assert_eq!(port.posted.lock().len(), 1);
    }

    #[test]
    fn test_closed_parent_is_reported() {
        let port = Arc::new(RecordingPort {
            closed: true,
            ..RecordingPort::default()
        });
        let relay = SecondaryRelay::new("a.com", port, RelayConfig::default()).unwrap();

        let err = assert_err!(relay.send_to_primary(
            "result",
            OutboundPayload::new().err_value(json!(false)),
            SendOptions::default(),
        ));
        assert!(matches!(err, RelayError::Transport(TransportError::Disconnected)));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let port = Arc::new(RecordingPort::default());
        assert_err!(SecondaryRelay::new("a.com", port, RelayConfig::default().prefix("")));
    }
}
