//! Transport envelope.
//!
//! An envelope is what a transport actually carries: string-keyed properties
//! and an optional opaque body. On MQTT the whole envelope travels as CBOR.

use crate::message::MessageError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Properties plus body, as delivered by a transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Named properties
    pub properties: BTreeMap<String, Value>,
    /// Encoded payload bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

impl Envelope {
    /// Create an empty envelope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property, returning the envelope.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Set the body, returning the envelope.
    #[must_use]
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// A property if it is a string.
    #[must_use]
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| MessageError::Serialize(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_cbor_roundtrip() {
        let envelope = Envelope::new()
            .with_property("resource-type", "DOCUMENT")
            .with_property("content-length", 42)
            .with_property("custom", serde_json::json!({"nested": [1, 2]}))
            .with_body(vec![0x28, 0xB5, 0x2F, 0xFD, 0, 1]);

        let bytes = envelope.to_cbor().unwrap();
        assert_eq!(Envelope::from_cbor(&bytes).unwrap(), envelope);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            Envelope::from_cbor(&[0xff, 0x00]),
            Err(MessageError::Deserialize(_))
        ));
    }

    #[test]
    fn property_str_ignores_non_strings() {
        let envelope = Envelope::new().with_property("mode", 420);
        assert_eq!(envelope.property_str("mode"), None);
    }
}
