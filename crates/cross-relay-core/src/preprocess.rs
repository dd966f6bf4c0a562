//! Serialization preprocessing and error reification.
//!
//! Values bound for the boundary are passed through a [`Preprocessor`]
//! first. Errors travel as [`SerializedError`] and are turned back into a
//! live [`RelayedError`] exactly once, on the primary side.

use std::{error::Error, fmt};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{config::RelayConfig, traits::TransportError};

/// Preprocessing error.
#[derive(Debug, Clone, Error)]
pub enum PreprocessError {
    #[error("Value nested deeper than {limit} levels")]
    TooDeep { limit: usize },
    #[error("Error cause chain longer than {limit} links")]
    CauseChainTooLong { limit: usize },
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Error in its transport-safe form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedError {
    #[serde(default = "default_error_name")]
    pub name: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<SerializedError>>,
    /// Any other properties carried by the error.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_error_name() -> String {
    "Error".to_string()
}

impl SerializedError {
    /// Create a plain error with a message.
    #[must_use]
    pub fn new<N: Into<String>, M: Into<String>>(name: N, message: M) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            cause: None,
            extra: Map::new(),
        }
    }

    /// Capture an error without following its cause chain.
    ///
    /// Never fails, which makes it the fallback when full preprocessing
    /// of an error does.
    #[must_use]
    pub fn capture(err: &(dyn Error + 'static)) -> Self {
        if let Some(relayed) = err.downcast_ref::<RelayedError>() {
            return relayed.to_serialized();
        }
        Self::new(error_name(err), err.to_string())
    }

    /// Interpret an arbitrary value as an error.
    ///
    /// Objects shaped like a serialized error are taken as-is; anything
    /// else becomes the message of a generic error.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        if value.get("message").is_some() {
            if let Ok(err) = serde_json::from_value::<Self>(value.clone()) {
                return err;
            }
        }
        Self::new(default_error_name(), display_value(value))
    }
}

/// Render a value the way it reads when interpolated into a message.
#[must_use]
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Name reported for an error crossing the boundary.
#[must_use]
pub fn error_name(err: &(dyn Error + 'static)) -> String {
    if let Some(e) = err.downcast_ref::<TransportError>() {
        e.name().to_string()
    } else if let Some(e) = err.downcast_ref::<RelayedError>() {
        e.name.clone()
    } else if err.is::<PreprocessError>() {
        "PreprocessError".to_string()
    } else {
        default_error_name()
    }
}

/// Live error reconstructed on the primary side.
///
/// `stack` is rooted at the primary's invocation stack so the failure is
/// attributed to the code that triggered the cross-boundary call;
/// `remote_stack` keeps whatever stack the secondary reported.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayedError {
    pub name: String,
    pub message: String,
    pub stack: String,
    pub remote_stack: Option<String>,
    pub cause: Option<Box<RelayedError>>,
    pub extra: Map<String, Value>,
}

impl RelayedError {
    /// Rebuild a live error from its serialized form.
    #[must_use]
    pub fn reify(serialized: SerializedError, context_stack: Option<&str>) -> Self {
        let SerializedError {
            name,
            message,
            stack: remote_stack,
            cause,
            extra,
        } = serialized;

        let header = format!("{name}: {message}");
        let stack = match context_stack {
            Some(ctx) if !ctx.is_empty() => format!("{header}\n{ctx}"),
            _ => header,
        };

        Self {
            name,
            message,
            stack,
            remote_stack,
            cause: cause.map(|c| Box::new(Self::reify(*c, None))),
            extra,
        }
    }

    /// Serialized form, e.g. for relaying the error onward.
    #[must_use]
    pub fn to_serialized(&self) -> SerializedError {
        SerializedError {
            name: self.name.clone(),
            message: self.message.clone(),
            stack: self.remote_stack.clone(),
            cause: self.cause.as_ref().map(|c| Box::new(c.to_serialized())),
            extra: self.extra.clone(),
        }
    }
}

impl fmt::Display for RelayedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl Error for RelayedError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn Error + 'static))
    }
}

/// Converts values into a form that is safe to cross the boundary.
pub trait Preprocessor: Send + Sync {
    /// Sanitize a value for transport.
    ///
    /// # Errors
    /// Returns error if the value cannot be made transport-safe.
    fn preprocess(&self, value: &Value) -> Result<Value, PreprocessError>;

    /// Convert a live error into its serialized form.
    ///
    /// # Errors
    /// Returns error if the error cannot be made transport-safe.
    fn preprocess_error(
        &self,
        err: &(dyn Error + 'static),
    ) -> Result<SerializedError, PreprocessError>;

    /// Interpret an arbitrary error value and sanitize it.
    ///
    /// # Errors
    /// Returns error if the value cannot be made transport-safe.
    fn preprocess_error_value(&self, value: &Value) -> Result<SerializedError, PreprocessError> {
        let value = self.preprocess(value)?;
        Ok(SerializedError::from_value(&value))
    }

    /// Reconstruct a live error rooted at `context_stack`.
    fn reify_error(&self, serialized: SerializedError, context_stack: Option<&str>) -> RelayedError {
        RelayedError::reify(serialized, context_stack)
    }
}

/// Depth-limited preprocessor.
///
/// JSON values are already transport-safe, so sanitizing amounts to
/// bounding nesting: a value deeper than `max_depth` is rejected the way a
/// self-referencing structure would be.
#[derive(Debug, Clone, Copy)]
pub struct DefaultPreprocessor {
    max_depth: usize,
}

impl DefaultPreprocessor {
    /// Create a preprocessor with the given nesting limit.
    #[must_use]
    pub const fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Nesting limit.
    #[must_use]
    pub const fn max_depth(&self) -> usize {
        self.max_depth
    }

    fn check_depth(&self, value: &Value, depth: usize) -> Result<(), PreprocessError> {
        if depth > self.max_depth {
            return Err(PreprocessError::TooDeep {
                limit: self.max_depth,
            });
        }
        match value {
            Value::Array(items) => items
                .iter()
                .try_for_each(|v| self.check_depth(v, depth + 1)),
            Value::Object(map) => map
                .values()
                .try_for_each(|v| self.check_depth(v, depth + 1)),
            _ => Ok(()),
        }
    }
}

impl Default for DefaultPreprocessor {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for DefaultPreprocessor {
    fn from(config: &RelayConfig) -> Self {
        Self::new(config.max_depth)
    }
}

impl Preprocessor for DefaultPreprocessor {
    fn preprocess(&self, value: &Value) -> Result<Value, PreprocessError> {
        self.check_depth(value, 1)?;
        Ok(value.clone())
    }

    fn preprocess_error(
        &self,
        err: &(dyn Error + 'static),
    ) -> Result<SerializedError, PreprocessError> {
        let mut chain = vec![err];
        let mut next = err.source();
        while let Some(source) = next {
            if chain.len() >= self.max_depth {
                return Err(PreprocessError::CauseChainTooLong {
                    limit: self.max_depth,
                });
            }
            chain.push(source);
            next = source.source();
        }

        let mut serialized: Option<SerializedError> = None;
        for link in chain.into_iter().rev() {
            let mut current = SerializedError::capture(link);
            current.extra = Map::from_iter(
                current
                    .extra
                    .into_iter()
                    .map(|(k, v)| self.preprocess(&v).map(|v| (k, v)))
                    .collect::<Result<Vec<_>, _>>()?,
            );
            // The cause chain is rebuilt from `source()`, not copied.
            current.cause = serialized.take().map(Box::new);
            serialized = Some(current);
        }

        serialized.ok_or_else(|| PreprocessError::Serialization("empty error chain".to_string()))
    }
}

/// Snapshot of configuration made safe for the boundary.
///
/// # Errors
/// Returns error if the snapshot cannot be sanitized.
pub fn preprocess_config(
    preprocessor: &dyn Preprocessor,
    config: &Value,
) -> Result<Value, PreprocessError> {
    preprocessor.preprocess(config)
}

/// Snapshot of environment variables made safe for the boundary.
///
/// Environment snapshots are always objects; anything else becomes `{}`.
///
/// # Errors
/// Returns error if the snapshot cannot be sanitized.
pub fn preprocess_env(
    preprocessor: &dyn Preprocessor,
    env: &Value,
) -> Result<Value, PreprocessError> {
    match env {
        Value::Object(_) => preprocessor.preprocess(env),
        _ => Ok(Value::Object(Map::new())),
    }
}
