//! Primary relay.
//!
//! Single point of ingress and egress for boundary traffic on the primary
//! side. Inbound relay messages either update the routing table (the
//! handshake) or are re-emitted locally, tagged with the sending domain.

use std::sync::Arc;

use cross_relay_core::{
    ContextHandle, DefaultPreprocessor, Emitter, Envelope, Inbound, InboundPayload, InboundSink,
    ListenerId, PreprocessError, Preprocessor, RelayConfig, SerializedError,
    payload::{ERR_KEY, is_falsy},
};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{error::RelayError, routing::RoutingTable};

/// Key of the caller-supplied field that is passed through unsanitized.
const USER_DATA_KEY: &str = "data";

/// Event as seen by primary-side listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryEvent {
    pub data: InboundPayload,
    /// Domain of the secondary that sent the event.
    pub domain: Option<String>,
}

/// Primary side of the boundary.
pub struct PrimaryRelay {
    config: RelayConfig,
    preprocessor: Arc<dyn Preprocessor>,
    routes: RoutingTable,
    emitter: Emitter<PrimaryEvent>,
    user_invocation_stack: RwLock<Option<String>>,
}

impl Default for PrimaryRelay {
    fn default() -> Self {
        let config = RelayConfig::default();
        Self {
            preprocessor: Arc::new(DefaultPreprocessor::from(&config)),
            config,
            routes: RoutingTable::new(),
            emitter: Emitter::new(),
            user_invocation_stack: RwLock::new(None),
        }
    }
}

impl PrimaryRelay {
    /// Create a primary relay.
    ///
    /// # Errors
    /// Returns error if the config is invalid.
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        config.validate()?;
        Ok(Self {
            preprocessor: Arc::new(DefaultPreprocessor::from(&config)),
            config,
            ..Self::default()
        })
    }

    /// Replace the serialization preprocessor.
    #[must_use]
    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn Preprocessor>) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// The routing table.
    #[must_use]
    pub const fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    /// The local emitter, e.g. for [`Emitter::stream`].
    #[must_use]
    pub const fn emitter(&self) -> &Emitter<PrimaryEvent> {
        &self.emitter
    }

    /// Record the stack of the code driving cross-boundary calls.
    ///
    /// Errors received afterwards are rooted at this stack.
    pub fn set_user_invocation_stack(&self, stack: Option<String>) {
        *self.user_invocation_stack.write() = stack;
    }

    /// Register a listener.
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&PrimaryEvent) + Send + Sync + 'static,
    {
        self.emitter.on(event, listener)
    }

    /// Register a one-shot listener.
    pub fn once<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&PrimaryEvent) + Send + Sync + 'static,
    {
        self.emitter.once(event, listener)
    }

    /// Remove a listener.
    pub fn off(&self, id: ListenerId) -> bool {
        self.emitter.off(id)
    }

    /// Emit a local event without crossing the boundary.
    pub fn emit(&self, event: &str, args: &PrimaryEvent) -> bool {
        self.emitter.emit(event, args)
    }

    /// Handle one raw boundary message.
    ///
    /// Foreign and malformed traffic is logged and dropped. Never fails.
    pub fn receive(&self, message: Value, sender: Option<ContextHandle>) {
        let envelope = match Inbound::classify(message, &self.config.prefix) {
            Inbound::Relay(envelope) => envelope,
            Inbound::Foreign(raw) => {
                debug!(message = %raw, "Unexpected boundary message");
                return;
            }
            Inbound::Malformed { event, reason } => {
                warn!(%event, %reason, "Dropping malformed relay message");
                return;
            }
        };

        let Envelope {
            event,
            data,
            domain,
        } = envelope;

        if event == self.config.handshake_event {
            self.register(domain.as_deref(), sender);
        }

        let data = self.reify(data);
        self.emitter.emit(&event, &PrimaryEvent { data, domain });
    }

    fn register(&self, domain: Option<&str>, sender: Option<ContextHandle>) {
        match (domain, sender) {
            (Some(domain), Some(handle)) => {
                let id = handle.id();
                match self.routes.upsert(domain, handle) {
                    Some(previous) => {
                        debug!(domain, context = %id, previous = %previous.id(), "Secondary re-registered");
                    }
                    None => debug!(domain, context = %id, "Secondary registered"),
                }
            }
            (domain, _) => {
                debug!(?domain, "Handshake without domain or sender handle, routing unchanged");
            }
        }
    }

    /// Turn the wire `err` into a live error rooted at the invocation stack.
    fn reify(&self, data: Option<Value>) -> InboundPayload {
        let mut data = data.unwrap_or(Value::Null);
        let raw_err = match data.as_object_mut() {
            Some(map) if map.get(ERR_KEY).is_some_and(|err| !is_falsy(err)) => map.remove(ERR_KEY),
            _ => None,
        };

        let err = raw_err.map(|raw| {
            let stack = self.user_invocation_stack.read().clone();
            self.preprocessor
                .reify_error(SerializedError::from_value(&raw), stack.as_deref())
        });

        InboundPayload { data, err }
    }

    /// Sanitize outbound data, passing a caller-supplied `data` field through.
    fn sanitize(&self, data: Value) -> Result<Option<Value>, PreprocessError> {
        if data.is_null() {
            return Ok(None);
        }

        let mut data = data;
        let user_data = data
            .as_object_mut()
            .and_then(|map| map.remove(USER_DATA_KEY))
            .filter(|d| !is_falsy(d));

        let mut processed = self.preprocessor.preprocess(&data)?;
        if let (Some(user_data), Some(map)) = (user_data, processed.as_object_mut()) {
            map.insert(USER_DATA_KEY.to_string(), user_data);
        }
        Ok(Some(processed))
    }

    fn wrap(&self, event: &str, data: Value) -> Result<Envelope, RelayError> {
        let data = self.sanitize(data)?;
        Ok(Envelope::outbound(&self.config.prefix, event, data, None))
    }

    /// Send an event to every registered secondary.
    ///
    /// Each recipient is sent to independently; a failed send is logged
    /// and does not affect the others. Returns the number of successful
    /// deliveries, zero when no secondary has handshaken.
    ///
    /// # Errors
    /// Returns error if `data` cannot be sanitized.
    pub fn send_to_all(&self, event: &str, data: Value) -> Result<usize, RelayError> {
        debug!(event, "=> to all secondaries");
        let envelope = self.wrap(event, data)?;

        let mut delivered = 0;
        for (domain, handle) in self.routes.entries() {
            match handle.post(&envelope) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(%domain, error = %e, "Failed to send to secondary"),
            }
        }
        Ok(delivered)
    }

    /// Send an event to the secondary registered for `domain`.
    ///
    /// Unknown domains are a silent no-op, as is a failed send to a
    /// context that has gone away. Returns whether the message was posted.
    ///
    /// # Errors
    /// Returns error if `data` cannot be sanitized for a registered domain.
    pub fn send_to_domain(&self, domain: &str, event: &str, data: Value) -> Result<bool, RelayError> {
        debug!(domain, event, "=> to secondary");
        let Some(handle) = self.routes.get(domain) else {
            debug!(domain, "No secondary registered, dropping");
            return Ok(false);
        };
        let envelope = self.wrap(event, data)?;

        match handle.post(&envelope) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(domain, error = %e, "Failed to send to secondary");
                Ok(false)
            }
        }
    }

    /// Forget the secondary for `domain`, e.g. after it was torn down.
    pub fn forget(&self, domain: &str) -> bool {
        let forgotten = self.routes.forget(domain).is_some();
        if forgotten {
            debug!(domain, "Secondary forgotten");
        }
        forgotten
    }
}

impl InboundSink for PrimaryRelay {
    fn receive(&self, message: Value, sender: Option<ContextHandle>) {
        Self::receive(self, message, sender);
    }
}

#[cfg(test)]
mod tests {
    use cross_relay_core::{Port, TransportError};
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    #[derive(Default)]
    struct RecordingPort {
        posted: Mutex<Vec<Value>>,
        fail: bool,
    }

    impl Port for RecordingPort {
        fn post(&self, message: Value) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::Disconnected);
            }
            self.posted.lock().push(message);
            Ok(())
        }
    }

    fn port() -> Arc<RecordingPort> {
        Arc::new(RecordingPort::default())
    }

    fn handshake(relay: &PrimaryRelay, domain: &str, port: &Arc<RecordingPort>) -> ContextHandle {
        let handle = ContextHandle::new(port.clone());
        relay.receive(
            json!({"event": "cross:domain:bridge:ready", "domain": domain}),
            Some(handle.clone()),
        );
        handle
    }

    fn collect(relay: &PrimaryRelay, event: &str) -> Arc<Mutex<Vec<PrimaryEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        relay.on(event, move |e| sink.lock().push(e.clone()));
        seen
    }

    #[test]
    fn test_handshake_registers_sender() {
        let relay = PrimaryRelay::default();
        let ready = collect(&relay, "bridge:ready");
        let a = port();

        handshake(&relay, "a.com", &a);

        assert_eq!(relay.routes().domains(), vec!["a.com"]);
        assert_eq!(ready.lock()[0].domain.as_deref(), Some("a.com"));

        assert!(relay.send_to_domain("a.com", "ping", json!({"x": 1})).unwrap());
        assert_eq!(
            a.posted.lock().as_slice(),
            &[json!({"event": "cross:domain:ping", "data": {"x": 1}})]
        );
    }

    #[test]
    fn test_handshake_without_sender_is_ignored() {
        let relay = PrimaryRelay::default();
        let ready = collect(&relay, "bridge:ready");

        relay.receive(json!({"event": "cross:domain:bridge:ready", "domain": "a.com"}), None);

        assert!(relay.routes().is_empty());
        assert_eq!(ready.lock().len(), 1);
    }

    #[test]
    fn test_second_handshake_replaces_route() {
        let relay = PrimaryRelay::default();
        let old = port();
        let new = port();

        handshake(&relay, "a.com", &old);
        handshake(&relay, "a.com", &new);

        assert_ok!(relay.send_to_domain("a.com", "ping", Value::Null));
        assert!(old.posted.lock().is_empty());
        assert_eq!(new.posted.lock().len(), 1);
    }

    #[test]
    fn test_unknown_domain_is_a_silent_noop() {
        let relay = PrimaryRelay::default();
        let sent = relay.send_to_domain("nowhere.com", "ping", json!({})).unwrap();
        assert!(!sent);
    }

    #[test]
    fn test_unknown_domain_skips_sanitizing() {
        let relay = PrimaryRelay::new(RelayConfig::default().max_depth(2)).unwrap();
        let deep = json!({"a": {"b": {"c": 1}}});
        assert!(!assert_ok!(relay.send_to_domain("nowhere.com", "run", deep)));
    }

    #[test]
    fn test_send_to_all_with_empty_table() {
        let relay = PrimaryRelay::default();
        assert_eq!(relay.send_to_all("ping", json!({"x": 1})).unwrap(), 0);
    }

    #[test]
    fn test_send_to_all_isolates_failures() {
        let relay = PrimaryRelay::default();
        let broken = Arc::new(RecordingPort {
            fail: true,
            ..RecordingPort::default()
        });
        let a = port();
        let b = port();

        handshake(&relay, "a.com", &a);
        handshake(&relay, "broken.com", &broken);
        handshake(&relay, "b.com", &b);

        assert_eq!(relay.send_to_all("ping", json!({"n": 1})).unwrap(), 2);
        assert_eq!(a.posted.lock().len(), 1);
        assert_eq!(b.posted.lock().len(), 1);
    }

    #[test]
    fn test_foreign_messages_are_never_emitted() {
        let relay = PrimaryRelay::default();
        let seen = collect(&relay, "ping");

        relay.receive(json!({"event": "ping"}), None);
        relay.receive(json!({"type": "webpackOk"}), None);
        relay.receive(json!({"event": "cross:domain:ping", "domain": 5}), None);

        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_inbound_error_is_reified_with_invocation_stack() {
        let relay = PrimaryRelay::default();
        relay.set_user_invocation_stack(Some("at spec.js:4:7".into()));
        let seen = collect(&relay, "command:end");

        relay.receive(
            json!({
                "event": "cross:domain:command:end",
                "domain": "a.com",
                "data": {"id": 3, "err": {"name": "Error", "message": "false"}},
            }),
            None,
        );

        let events = seen.lock();
        let event = &events[0];
        let err = event.data.err.as_ref().expect("live error");
        assert_eq!(err.message, "false");
        assert_eq!(err.stack, "Error: false\nat spec.js:4:7");
        assert_eq!(event.data.data, json!({"id": 3}));
        assert_eq!(event.domain.as_deref(), Some("a.com"));
    }

    #[test]
    fn test_listeners_for_same_event_all_fire_regardless_of_domain() {
        let relay = PrimaryRelay::default();
        let first = collect(&relay, "log:added");
        let second = collect(&relay, "log:added");

        for domain in ["a.com", "b.com"] {
            relay.receive(
                json!({"event": "cross:domain:log:added", "domain": domain, "data": {}}),
                None,
            );
        }

        assert_eq!(first.lock().len(), 2);
        assert_eq!(second.lock().len(), 2);
    }

    #[test]
    fn test_user_data_is_not_sanitized() {
        let relay = PrimaryRelay::new(RelayConfig::default().max_depth(2)).unwrap();
        let a = port();
        handshake(&relay, "a.com", &a);

        let deep = json!({"a": {"b": {"c": 1}}});
        assert!(relay.send_to_domain("a.com", "run", json!({"id": 1, "data": deep})).unwrap());
        assert_eq!(a.posted.lock()[0]["data"]["data"], deep);

        assert_err!(relay.send_to_domain("a.com", "run", json!({"other": deep})));
    }

    #[test]
    fn test_forget_drops_route() {
        let relay = PrimaryRelay::default();
        let a = port();
        handshake(&relay, "a.com", &a);

        assert!(relay.forget("a.com"));
        assert!(!relay.send_to_domain("a.com", "ping", json!({})).unwrap());
        assert!(a.posted.lock().is_empty());
    }
}
