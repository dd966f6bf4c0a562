//! Relay error.

use cross_relay_core::{ConfigError, PreprocessError, TransportError};
use thiserror::Error;

/// Relay error.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Preprocess error: {0}")]
    Preprocess(#[from] PreprocessError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}
