//! The change message: one store mutation, independent of any transport.

use crate::envelope::Envelope;
use crate::keys;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Free-form message metadata.
pub type Metadata = BTreeMap<String, Value>;

/// Kind of resource a message describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    /// A stored document (XML or binary)
    Document,
    /// A collection of documents and sub-collections
    Collection,
}

impl ResourceType {
    /// All resource types.
    pub const ALL: [Self; 2] = [Self::Document, Self::Collection];

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Document => "DOCUMENT",
            Self::Collection => "COLLECTION",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DOCUMENT" => Ok(Self::Document),
            "COLLECTION" => Ok(Self::Collection),
            other => Err(MessageError::UnknownResourceType(other.to_string())),
        }
    }
}

/// Mutation a message describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    /// New resource
    Create,
    /// Replaced content
    Update,
    /// Removed resource
    Delete,
    /// Relocated resource
    Move,
    /// Duplicated resource
    Copy,
    /// Owner, group, mode or mime type change only
    Metadata,
}

impl Operation {
    /// All operations.
    pub const ALL: [Self; 6] = [
        Self::Create,
        Self::Update,
        Self::Delete,
        Self::Move,
        Self::Copy,
        Self::Metadata,
    ];

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Move => "MOVE",
            Self::Copy => "COPY",
            Self::Metadata => "METADATA",
        }
    }

    /// Whether the operation names a destination path.
    #[must_use]
    pub const fn has_destination(self) -> bool {
        matches!(self, Self::Move | Self::Copy)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            "MOVE" => Ok(Self::Move),
            "COPY" => Ok(Self::Copy),
            "METADATA" => Ok(Self::Metadata),
            other => Err(MessageError::UnknownOperation(other.to_string())),
        }
    }
}

/// Whether a message of this kind may carry a payload.
#[must_use]
pub const fn carries_payload(resource_type: ResourceType, operation: Operation) -> bool {
    matches!(
        (resource_type, operation),
        (ResourceType::Document, Operation::Create | Operation::Update)
    )
}

/// One replicated store mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeMessage {
    /// Kind of resource
    pub resource_type: ResourceType,
    /// Kind of mutation
    pub operation: Operation,
    /// Absolute path of the affected resource
    pub source_path: String,
    /// New or duplicate path, MOVE and COPY only
    pub destination_path: Option<String>,
    /// Owner, group, mode, mime type and any extra envelope properties
    pub metadata: Metadata,
    /// Encoded content, document CREATE and UPDATE only
    pub payload: Option<Vec<u8>>,
}

impl ChangeMessage {
    /// Create a message with no destination, metadata or payload.
    #[must_use]
    pub fn new(
        resource_type: ResourceType,
        operation: Operation,
        source_path: impl Into<String>,
    ) -> Self {
        Self {
            resource_type,
            operation,
            source_path: source_path.into(),
            destination_path: None,
            metadata: Metadata::new(),
            payload: None,
        }
    }

    /// Set the destination path.
    #[must_use]
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination_path = Some(destination.into());
        self
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// A metadata entry if it is a string.
    #[must_use]
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// The publishing instance, if recorded.
    #[must_use]
    pub fn sender(&self) -> Option<&str> {
        self.metadata_str(keys::SENDER_INSTANCE_ID)
    }

    /// Declared body encoding, if any.
    #[must_use]
    pub fn content_encoding(&self) -> Option<&str> {
        self.metadata_str(keys::CONTENT_ENCODING)
    }

    /// Check the structural invariants.
    ///
    /// A document CREATE or UPDATE without payload passes: capture emits one
    /// when content serialization fails, and the applier rejects it.
    ///
    /// # Errors
    ///
    /// Returns error if the source path is empty, the destination does not
    /// match the operation, or a payload is attached to a kind that cannot
    /// carry one.
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.source_path.is_empty() {
            return Err(MessageError::EmptySourcePath);
        }
        match (self.operation.has_destination(), &self.destination_path) {
            (true, None) => return Err(MessageError::MissingDestination(self.operation)),
            (false, Some(_)) => return Err(MessageError::UnexpectedDestination(self.operation)),
            (true, Some(dest)) if dest.is_empty() => {
                return Err(MessageError::MissingDestination(self.operation))
            }
            _ => {}
        }
        if self.payload.is_some() && !carries_payload(self.resource_type, self.operation) {
            return Err(MessageError::UnexpectedPayload {
                resource_type: self.resource_type,
                operation: self.operation,
            });
        }
        Ok(())
    }

    /// Build the transport envelope.
    ///
    /// Metadata entries become properties; routing properties are written last.
    #[must_use]
    pub fn to_envelope(&self) -> Envelope {
        let mut properties = self.metadata.clone();
        properties.insert(
            keys::RESOURCE_TYPE.to_string(),
            Value::from(self.resource_type.as_str()),
        );
        properties.insert(
            keys::RESOURCE_OPERATION.to_string(),
            Value::from(self.operation.as_str()),
        );
        properties.insert(
            keys::SOURCE_PATH.to_string(),
            Value::from(self.source_path.as_str()),
        );
        if let Some(dest) = &self.destination_path {
            properties.insert(keys::DESTINATION_PATH.to_string(), Value::from(dest.as_str()));
        }

        Envelope {
            properties,
            body: self.payload.clone(),
        }
    }

    /// Rebuild a message from a transport envelope.
    ///
    /// Every non-routing property is copied verbatim into metadata.
    ///
    /// # Errors
    ///
    /// Returns error if a routing property is missing, not a string, names an
    /// unknown type or operation, or the result violates [`Self::validate`].
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, MessageError> {
        let resource_type: ResourceType = required_str(envelope, keys::RESOURCE_TYPE)?.parse()?;
        let operation: Operation = required_str(envelope, keys::RESOURCE_OPERATION)?.parse()?;
        let source_path = required_str(envelope, keys::SOURCE_PATH)?.to_string();
        let destination_path = match envelope.properties.get(keys::DESTINATION_PATH) {
            None => None,
            Some(Value::String(dest)) => Some(dest.clone()),
            Some(_) => return Err(MessageError::InvalidProperty(keys::DESTINATION_PATH)),
        };

        let metadata = envelope
            .properties
            .iter()
            .filter(|(key, _)| !keys::is_routing_key(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let message = Self {
            resource_type,
            operation,
            source_path,
            destination_path,
            metadata,
            payload: envelope.body.clone(),
        };
        message.validate()?;
        Ok(message)
    }
}

fn required_str<'a>(envelope: &'a Envelope, key: &'static str) -> Result<&'a str, MessageError> {
    match envelope.properties.get(key) {
        None => Err(MessageError::MissingProperty(key)),
        Some(Value::String(value)) => Ok(value),
        Some(_) => Err(MessageError::InvalidProperty(key)),
    }
}

/// Errors for message conversion and validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
    /// Required routing property absent
    #[error("missing property: {0}")]
    MissingProperty(&'static str),
    /// Routing property present but not a string
    #[error("property {0} is not a string")]
    InvalidProperty(&'static str),
    /// Resource type name not recognized
    #[error("unknown resource type: {0}")]
    UnknownResourceType(String),
    /// Operation name not recognized
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    /// Source path empty
    #[error("source path is empty")]
    EmptySourcePath,
    /// MOVE or COPY without destination
    #[error("{0} requires a destination path")]
    MissingDestination(Operation),
    /// Destination given for an operation that takes none
    #[error("{0} does not take a destination path")]
    UnexpectedDestination(Operation),
    /// Payload attached to a kind that carries none
    #[error("{resource_type} {operation} cannot carry a payload")]
    UnexpectedPayload {
        /// Resource type of the message
        resource_type: ResourceType,
        /// Operation of the message
        operation: Operation,
    },
}
