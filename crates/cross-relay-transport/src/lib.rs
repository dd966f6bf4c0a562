//! Boundaries for cross-relay.
//!
//! Provides:
//! - In-process boundary over tokio channels
//! - WebSocket ingress for the primary (feature: websocket)

pub mod channel;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use channel::{PrimaryEndpoint, SecondaryEndpoint, WeakPort};
