//! Relay configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix carried by every relay event name on the wire.
pub const DEFAULT_PREFIX: &str = "cross:domain:";

/// Reserved event a secondary sends to announce it can receive.
pub const HANDSHAKE_EVENT: &str = "bridge:ready";

/// Reserved event carrying the secondary's configuration snapshot.
pub const SYNC_GLOBALS_EVENT: &str = "sync:globals";

/// Default nesting limit for values crossing the boundary.
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Relay prefix must not be empty")]
    EmptyPrefix,
    #[error("Reserved event name is empty: {0}")]
    EmptyEventName(&'static str),
    #[error("Handshake and globals events share the name {0:?}")]
    ReservedCollision(String),
    #[error("Maximum depth must be at least 1")]
    ZeroDepth,
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Wire-level settings shared by the primary and secondary relays.
///
/// Both sides of a boundary must agree on these values; a mismatch in
/// `prefix` makes the primary treat every message as foreign traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RelayConfig {
    /// Prefix distinguishing relay traffic on a shared channel.
    pub prefix: String,
    /// Event name of the handshake that populates the routing table.
    pub handshake_event: String,
    /// Event name used to push configuration snapshots to the primary.
    pub sync_globals_event: String,
    /// Maximum nesting depth accepted by the default preprocessor.
    pub max_depth: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            handshake_event: HANDSHAKE_EVENT.to_string(),
            sync_globals_event: SYNC_GLOBALS_EVENT.to_string(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl RelayConfig {
    /// Parse a config from JSON, filling omitted fields with defaults.
    ///
    /// # Errors
    /// Returns error if the JSON is invalid or the result fails validation.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Override the wire prefix.
    #[must_use]
    pub fn prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Override the handshake event name.
    #[must_use]
    pub fn handshake_event<S: Into<String>>(mut self, event: S) -> Self {
        self.handshake_event = event.into();
        self
    }

    /// Override the globals-sync event name.
    #[must_use]
    pub fn sync_globals_event<S: Into<String>>(mut self, event: S) -> Self {
        self.sync_globals_event = event.into();
        self
    }

    /// Override the maximum nesting depth.
    #[must_use]
    pub const fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Check the invariants the relays rely on.
    ///
    /// # Errors
    /// Returns error on an empty prefix, empty or colliding reserved names,
    /// or a zero depth limit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefix.is_empty() {
            return Err(ConfigError::EmptyPrefix);
        }
        if self.handshake_event.is_empty() {
            return Err(ConfigError::EmptyEventName("handshake_event"));
        }
        if self.sync_globals_event.is_empty() {
            return Err(ConfigError::EmptyEventName("sync_globals_event"));
        }
        if self.handshake_event == self.sync_globals_event {
            return Err(ConfigError::ReservedCollision(self.handshake_event.clone()));
        }
        if self.max_depth == 0 {
            return Err(ConfigError::ZeroDepth);
        }
        Ok(())
    }

    /// Event name as it travels on the wire.
    #[must_use]
    pub fn wire_event(&self, event: &str) -> String {
        format!("{}{event}", self.prefix)
    }

    /// Whether `event` is one of the reserved relay events.
    #[must_use]
    pub fn is_reserved(&self, event: &str) -> bool {
        event == self.handshake_event || event == self.sync_globals_event
    }
}
