//! Core abstractions for cross-boundary event relays.
//!
//! This crate provides the fundamental building blocks:
//! - `Envelope` / `Inbound` - Wire message and prefix multiplexing
//! - `OutboundPayload` / `InboundPayload` - Payload shapes on either side
//! - `Preprocessor` - Serialization sanitizing and error reification
//! - `Emitter` - Name-addressed local listener registry
//! - `Port`, `ContextHandle`, `InboundSink` - Transport seams

pub mod config;
pub mod emitter;
pub mod envelope;
pub mod payload;
pub mod preprocess;
pub mod traits;

pub use config::{ConfigError, RelayConfig};
pub use emitter::{Emitter, ListenerId};
pub use envelope::{Envelope, Inbound};
pub use payload::{ErrField, InboundPayload, OutboundPayload, Subject};
pub use preprocess::{DefaultPreprocessor, PreprocessError, Preprocessor, RelayedError, SerializedError};
pub use traits::{ContextHandle, InboundSink, Port, SnapshotProvider, TransportError};
