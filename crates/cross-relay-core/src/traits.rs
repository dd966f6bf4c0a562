//! Core traits for boundary transports and their collaborators.

use std::{fmt, sync::Arc};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Context identifier.
pub type ContextId = Uuid;

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The message could not be copied across the boundary.
    #[error("Data clone failed: {0}")]
    DataClone(String),
    /// The target context is gone.
    #[error("Context disconnected")]
    Disconnected,
    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether this failure was caused by an unserializable payload.
    #[must_use]
    pub const fn is_data_clone(&self) -> bool {
        matches!(self, Self::DataClone(_))
    }

    /// Error name as reported across the boundary.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::DataClone(_) => "DataCloneError",
            Self::Disconnected => "DisconnectedError",
            Self::Other(_) => "TransportError",
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::DataClone(e.to_string())
    }
}

/// One-way, best-effort send primitive into another context.
///
/// Implementations must not block. A returned error means this particular
/// post failed; it says nothing about earlier or later posts.
pub trait Port: Send + Sync {
    /// Post an already-serialized message.
    ///
    /// # Errors
    /// Returns error if the target is unreachable or rejects the message.
    fn post(&self, message: Value) -> Result<(), TransportError>;
}

/// Serialize `message` and post it through `port`.
///
/// Serialization is the structured-clone step of the boundary: any
/// failure here surfaces as [`TransportError::DataClone`].
///
/// # Errors
/// Returns error if serialization or the post fails.
pub fn post_message<T>(port: &dyn Port, message: &T) -> Result<(), TransportError>
where
    T: Serialize + ?Sized,
{
    let value = serde_json::to_value(message)?;
    port.post(value)
}

/// Non-owning address of a context.
///
/// Holding a handle never keeps the context alive; posting to a context
/// that has gone away fails with [`TransportError::Disconnected`].
#[derive(Clone)]
pub struct ContextHandle {
    id: ContextId,
    port: Arc<dyn Port>,
}

impl ContextHandle {
    /// Create a handle with a fresh identifier.
    #[must_use]
    pub fn new(port: Arc<dyn Port>) -> Self {
        Self::with_id(Uuid::new_v4(), port)
    }

    /// Create a handle with an explicit identifier.
    #[must_use]
    pub fn with_id(id: ContextId, port: Arc<dyn Port>) -> Self {
        Self { id, port }
    }

    /// Identifier of the addressed context.
    #[must_use]
    pub const fn id(&self) -> ContextId {
        self.id
    }

    /// Serialize and post a message to this context.
    ///
    /// # Errors
    /// Returns error if serialization or the post fails.
    pub fn post<T>(&self, message: &T) -> Result<(), TransportError>
    where
        T: Serialize + ?Sized,
    {
        post_message(self.port.as_ref(), message)
    }
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle").field("id", &self.id).finish()
    }
}

/// Receiving end of a boundary.
///
/// Transports call this once per inbound message, passing the sender's
/// handle when the transport can provide one.
pub trait InboundSink: Send + Sync {
    /// Handle one raw inbound message.
    fn receive(&self, message: Value, sender: Option<ContextHandle>);
}

/// Producer of configuration and environment snapshots.
pub trait SnapshotProvider: Send + Sync {
    /// Current configuration.
    fn config(&self) -> Value;

    /// Current environment.
    fn env(&self) -> Value;
}
