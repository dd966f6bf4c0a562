//! Forwarding of command log events from a secondary to the primary.

use std::sync::Arc;

use cross_relay_core::ListenerId;
use tracing::warn;

use crate::secondary::{SecondaryRelay, SendOptions};

/// A log entry was created.
pub const LOG_ADDED: &str = "log:added";

/// An existing log entry changed.
pub const LOG_CHANGED: &str = "log:changed";

/// Forward local `log:added` and `log:changed` events to the primary.
///
/// Log attributes are sanitized before they are sent. The listeners hold
/// the relay weakly, so they do not keep it alive.
pub fn forward_logs(relay: &Arc<SecondaryRelay>) -> [ListenerId; 2] {
    [LOG_ADDED, LOG_CHANGED].map(|event| {
        let weak = Arc::downgrade(relay);
        relay.on(event, move |attrs| {
            let Some(relay) = weak.upgrade() else {
                return;
            };
            let attrs = match relay.preprocessor().preprocess(attrs) {
                Ok(attrs) => attrs,
                Err(e) => {
                    warn!(event, error = %e, "Log attributes could not be sanitized");
                    return;
                }
            };
            if let Err(e) = relay.send_to_primary(event, attrs, SendOptions::default()) {
                warn!(event, error = %e, "Failed to forward log to primary");
            }
        })
    })
}
