//! Subject/error send pipeline.
//!
//! Makes sure an outbound event always arrives, even when its subject
//! cannot be serialized or the send itself fails. Errors take priority
//! over subjects: a subject that cannot be cloned is dropped and replaced
//! by its type name, while a failed send is retried once with the failure
//! as the error to deliver.

use cross_relay_core::{
    ErrField, OutboundPayload, Preprocessor, SerializedError, TransportError,
    payload::{UNSERIALIZABLE_SUBJECT_TYPE_KEY, WirePayload, is_falsy},
    preprocess::display_value,
};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Error standing in for a falsy `err` value.
#[derive(Debug, Error)]
#[error("{0}")]
struct CoercedError(String);

/// Put the payload's error into wire form.
///
/// A falsy error value is coerced into a real error whose message is the
/// value's string form. If preprocessing fails, the preprocessing failure
/// is sent instead.
fn prepare_err(err: ErrField, preprocessor: &dyn Preprocessor) -> Option<SerializedError> {
    let prepared = match err {
        ErrField::Absent => return None,
        ErrField::Serialized(serialized) => return Some(serialized),
        ErrField::Value(value) if is_falsy(&value) => {
            preprocessor.preprocess_error(&CoercedError(display_value(&value)))
        }
        ErrField::Value(value) => preprocessor.preprocess_error_value(&value),
        ErrField::Error(e) => preprocessor.preprocess_error(e.as_ref()),
    };
    Some(prepared.unwrap_or_else(|e| SerializedError::capture(&e)))
}

/// Send `payload` through `sender`, degrading instead of failing.
///
/// At most three attempts are made: the subject is dropped at most once
/// (on a clone failure) and the error is replaced at most once (on any
/// other failure). A failure after both is returned to the caller.
///
/// # Errors
/// Returns the transport error once no further degradation is possible.
pub fn attempt_send<F>(
    payload: OutboundPayload,
    preprocessor: &dyn Preprocessor,
    mut sender: F,
) -> Result<(), TransportError>
where
    F: FnMut(&WirePayload<'_>) -> Result<(), TransportError>,
{
    let OutboundPayload {
        mut rest,
        mut subject,
        err,
    } = payload;

    if subject.is_none() && !err.is_present() {
        return sender(&WirePayload {
            rest: &rest,
            subject: None,
            err: None,
        });
    }

    let mut err = prepare_err(err, preprocessor);
    let mut coerced = false;

    loop {
        let wire = WirePayload {
            rest: &rest,
            subject: subject.as_ref(),
            err: err.as_ref(),
        };
        let failure = match sender(&wire) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        match subject.take() {
            Some(dropped) if failure.is_data_clone() => {
                let type_name = dropped.type_name();
                debug!(%type_name, "Subject could not be cloned, sending its type instead");
                rest.insert(
                    UNSERIALIZABLE_SUBJECT_TYPE_KEY.to_string(),
                    Value::String(type_name),
                );
            }
            kept => {
                if coerced {
                    return Err(failure);
                }
                subject = kept;
                coerced = true;
                debug!(error = %failure, "Send failed, retrying with the failure as the error");
                err = prepare_err(ErrField::Error(Box::new(failure)), preprocessor);
            }
        }
    }
}
