//! Payload shapes on either side of the boundary.

use std::{any, error::Error, fmt, num::FpCategory, sync::Arc};

use serde::{Serialize, Serializer, ser::Error as _};
use serde_json::{Map, Value};

use crate::preprocess::{RelayedError, SerializedError};

/// Wire key carrying the subject.
pub const SUBJECT_KEY: &str = "subject";

/// Wire key carrying the error.
pub const ERR_KEY: &str = "err";

/// Wire key naming the type of a subject that could not be sent.
///
/// The value is the subject's Rust type name with module paths stripped
/// (`HashMap<(u8, u8), u8>`, `Value`), not a JSON kind such as `object`.
/// Primary-side code should treat it as an opaque description.
pub const UNSERIALIZABLE_SUBJECT_TYPE_KEY: &str = "unserializableSubjectType";

/// Whether a value reads as false in a boolean context.
///
/// `null`, `false`, `0` and the empty string are falsy.
#[must_use]
pub fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n
            .as_f64()
            .is_some_and(|f| f.classify() == FpCategory::Zero),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

/// A value that may or may not survive serialization.
pub trait SubjectValue: Send + Sync + fmt::Debug {
    /// Serialize into a transport-safe value.
    ///
    /// # Errors
    /// Returns error if the value cannot be represented as JSON.
    fn to_value(&self) -> Result<Value, serde_json::Error>;

    /// Runtime type name, without module paths.
    fn type_name(&self) -> String;
}

impl<T> SubjectValue for T
where
    T: Serialize + fmt::Debug + Send + Sync + 'static,
{
    fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn type_name(&self) -> String {
        short_type_name(any::type_name::<T>())
    }
}

/// Strip module paths from every segment of a type name.
///
/// `std::collections::HashMap<alloc::string::String, u8>` becomes
/// `HashMap<String, u8>`.
#[must_use]
pub fn short_type_name(full: &str) -> String {
    let mut out = String::with_capacity(full.len());
    let mut segment = String::new();
    let mut chars = full.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ':' if chars.peek() == Some(&':') => {
                chars.next();
                segment.clear();
            }
            c if c.is_alphanumeric() || c == '_' => segment.push(c),
            c => {
                out.push_str(&segment);
                segment.clear();
                out.push(c);
            }
        }
    }
    out.push_str(&segment);
    out
}

/// Arbitrary result value attached to an outbound event.
#[derive(Clone)]
pub struct Subject(Arc<dyn SubjectValue>);

impl Subject {
    /// Wrap any value as a subject.
    #[must_use]
    pub fn new<T: SubjectValue + 'static>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Runtime type name of the wrapped value.
    #[must_use]
    pub fn type_name(&self) -> String {
        self.0.type_name()
    }

    /// Serialize the wrapped value.
    ///
    /// # Errors
    /// Returns error if the value cannot be represented as JSON.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        self.0.to_value()
    }
}

impl fmt::Debug for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Subject").field(&self.0).finish()
    }
}

impl Serialize for Subject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value()
            .map_err(S::Error::custom)?
            .serialize(serializer)
    }
}

/// The `err` field of an outbound payload.
///
/// `Absent` and `Value(Value::Null)` are different things: a present but
/// falsy error is still an error.
#[derive(Debug, Default)]
pub enum ErrField {
    #[default]
    Absent,
    /// Raw value supplied by the caller.
    Value(Value),
    /// A live error.
    Error(Box<dyn Error + Send + Sync>),
    /// An error already in wire form.
    Serialized(SerializedError),
}

impl ErrField {
    /// Whether the payload defines an error at all.
    #[must_use]
    pub const fn is_present(&self) -> bool {
        !matches!(self, Self::Absent)
    }
}

/// Payload handed to a secondary relay for sending.
#[derive(Debug, Default)]
pub struct OutboundPayload {
    /// Application fields.
    pub rest: Map<String, Value>,
    pub subject: Option<Subject>,
    pub err: ErrField,
}

impl OutboundPayload {
    /// Empty payload.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an application field.
    #[must_use]
    pub fn field<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.rest.insert(key.into(), value);
        self
    }

    /// Attach a subject.
    #[must_use]
    pub fn subject<T: SubjectValue + 'static>(mut self, subject: T) -> Self {
        self.subject = Some(Subject::new(subject));
        self
    }

    /// Attach a live error.
    #[must_use]
    pub fn error<E: Error + Send + Sync + 'static>(mut self, err: E) -> Self {
        self.err = ErrField::Error(Box::new(err));
        self
    }

    /// Attach a raw error value, which may be falsy.
    #[must_use]
    pub fn err_value(mut self, value: Value) -> Self {
        self.err = ErrField::Value(value);
        self
    }
}

impl From<Map<String, Value>> for OutboundPayload {
    fn from(mut rest: Map<String, Value>) -> Self {
        let subject = rest
            .remove(SUBJECT_KEY)
            .filter(|v| !v.is_null())
            .map(Subject::new);
        let err = rest.remove(ERR_KEY).map_or(ErrField::Absent, ErrField::Value);
        Self { rest, subject, err }
    }
}

impl From<Value> for OutboundPayload {
    /// Objects are split into fields; `null` is an empty payload and any
    /// other value is carried under `value`.
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => map.into(),
            Value::Null => Self::default(),
            other => Self::default().field("value", other),
        }
    }
}

/// Borrowed view of a payload as it is put on the wire.
#[derive(Debug, Serialize)]
pub struct WirePayload<'a> {
    #[serde(flatten)]
    pub rest: &'a Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<&'a Subject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<&'a SerializedError>,
}

/// Payload as seen by primary-side listeners.
///
/// The wire `err` has already been reconstructed into a live error.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InboundPayload {
    /// Remaining wire fields, or a non-object payload as-is.
    pub data: Value,
    pub err: Option<RelayedError>,
}

impl InboundPayload {
    /// Field of an object payload.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// The subject, if it made it across.
    #[must_use]
    pub fn subject(&self) -> Option<&Value> {
        self.get(SUBJECT_KEY)
    }

    /// Type name of a subject that was dropped because it could not be sent.
    #[must_use]
    pub fn unserializable_subject_type(&self) -> Option<&str> {
        self.get(UNSERIALIZABLE_SUBJECT_TYPE_KEY)
            .and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;
    use tokio_test::assert_err;

    use super::*;

    #[test]
    fn test_falsy_values() {
        for v in [json!(null), json!(false), json!(0), json!(0.0), json!("")] {
            assert!(is_falsy(&v), "{v} should be falsy");
        }
        assert!(is_falsy(&json!(-0.0)));
        for v in [json!(true), json!(1), json!(-1), json!(1e-20), json!("0"), json!([]), json!({})] {
            assert!(!is_falsy(&v), "{v} should be truthy");
        }
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name("alloc::string::String"), "String");
        assert_eq!(
            short_type_name(
                "std::collections::hash::map::HashMap<(u8, u8), alloc::vec::Vec<u8>>"
            ),
            "HashMap<(u8, u8), Vec<u8>>"
        );
        assert_eq!(short_type_name("i32"), "i32");
    }

    #[test]
    fn test_json_subject_reports_value_type() {
        assert_eq!(Subject::new(json!({"x": 1})).type_name(), "Value");
    }

    #[test]
    fn test_subject_reports_type_and_failure() {
        let mut map = HashMap::new();
        map.insert((1u8, 1u8), 1u8);
        let subject = Subject::new(map);

        assert_eq!(subject.type_name(), "HashMap<(u8, u8), u8>");
        assert_err!(subject.to_value());
        assert_err!(serde_json::to_value(&subject));
    }

    #[test]
    fn test_from_value_splits_subject_and_err() {
        let payload = OutboundPayload::from(json!({
            "id": 1,
            "subject": {"x": 1},
            "err": false,
        }));

        assert_eq!(payload.rest, *json!({"id": 1}).as_object().unwrap());
        assert_eq!(payload.subject.unwrap().to_value().unwrap(), json!({"x": 1}));
        assert!(matches!(payload.err, ErrField::Value(Value::Bool(false))));
    }

    #[test]
    fn test_missing_err_is_absent() {
        let payload = OutboundPayload::from(json!({"id": 1}));
        assert!(!payload.err.is_present());
        assert!(payload.subject.is_none());

        let payload = OutboundPayload::from(json!({"err": null}));
        assert!(payload.err.is_present());
    }

    #[test]
    fn test_wire_payload_shape() {
        let rest = json!({"id": 2}).as_object().cloned().unwrap();
        let subject = Subject::new(vec![1, 2]);
        let err = SerializedError::new("Error", "x");
        let wire = WirePayload {
            rest: &rest,
            subject: Some(&subject),
            err: Some(&err),
        };

        assert_eq!(
            serde_json::to_value(&wire).unwrap(),
            json!({"id": 2, "subject": [1, 2], "err": {"name": "Error", "message": "x"}})
        );
    }

    #[test]
    fn test_inbound_accessors() {
        let payload = InboundPayload {
            data: json!({"unserializableSubjectType": "HashMap<(u8, u8), u8>"}),
            err: None,
        };
        assert_eq!(
            payload.unserializable_subject_type(),
            Some("HashMap<(u8, u8), u8>")
        );
        assert!(payload.subject().is_none());
    }
}
