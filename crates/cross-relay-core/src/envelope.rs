//! Wire envelope and prefix multiplexing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The only structure that crosses the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<D = Value> {
    /// Event name (prefixed on the wire).
    pub event: String,
    /// Sanitized payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<D>,
    /// Sending domain, only set on secondary-to-primary traffic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

impl<D> Envelope<D> {
    /// Build a wire envelope, prefixing the event name.
    #[must_use]
    pub fn outbound(prefix: &str, event: &str, data: Option<D>, domain: Option<String>) -> Self {
        Self {
            event: format!("{prefix}{event}"),
            data,
            domain,
        }
    }
}

/// Classification of a raw boundary message.
#[derive(Debug)]
pub enum Inbound {
    /// Relay traffic, event name already stripped of its prefix.
    Relay(Envelope),
    /// Traffic addressed to the same channel by someone else.
    Foreign(Value),
    /// Prefixed traffic whose body does not parse.
    Malformed {
        event: String,
        reason: serde_json::Error,
    },
}

impl Inbound {
    /// Sort a raw message into relay, foreign or malformed traffic.
    #[must_use]
    pub fn classify(raw: Value, prefix: &str) -> Self {
        let event = match raw.get("event").and_then(Value::as_str) {
            Some(event) if event.starts_with(prefix) => event.to_string(),
            _ => return Self::Foreign(raw),
        };

        match serde_json::from_value::<Envelope>(raw) {
            Ok(mut envelope) => {
                envelope.event = event[prefix.len()..].to_string();
                Self::Relay(envelope)
            }
            Err(reason) => Self::Malformed { event, reason },
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const PREFIX: &str = "cross:domain:";

    #[test]
    fn test_outbound_prefixes_and_omits_empty_fields() {
        let env: Envelope = Envelope::outbound(PREFIX, "ping", None, None);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json, json!({"event": "cross:domain:ping"}));
    }

    #[test]
    fn test_classify_strips_prefix() {
        let raw = json!({
            "event": "cross:domain:log:added",
            "data": {"id": 1},
            "domain": "a.com",
        });

        match Inbound::classify(raw, PREFIX) {
            Inbound::Relay(env) => {
                assert_eq!(env.event, "log:added");
                assert_eq!(env.data, Some(json!({"id": 1})));
                assert_eq!(env.domain.as_deref(), Some("a.com"));
            }
            other => panic!("Wrong classification: {other:?}"),
        }
    }

    #[test]
    fn test_classify_foreign_traffic() {
        for raw in [
            json!({"event": "ping"}),
            json!({"event": 5}),
            json!({"type": "other"}),
            json!("cross:domain:ping"),
            Value::Null,
        ] {
            assert!(matches!(Inbound::classify(raw, PREFIX), Inbound::Foreign(_)));
        }
    }

    #[test]
    fn test_prefix_only_counts_at_start() {
        let raw = json!({"event": "x:cross:domain:ping"});
        assert!(matches!(Inbound::classify(raw, PREFIX), Inbound::Foreign(_)));
    }

    #[test]
    fn test_classify_malformed_domain() {
        let raw = json!({"event": "cross:domain:ping", "domain": 42});
        match Inbound::classify(raw, PREFIX) {
            Inbound::Malformed { event, .. } => assert_eq!(event, "cross:domain:ping"),
            other => panic!("Wrong classification: {other:?}"),
        }
    }
}
