//! # docsync Protocol
//!
//! Wire model for replicating store mutations between instances.
//!
//! ## Messages
//!
//! - `ChangeMessage`: one store mutation, transport-agnostic
//! - `Envelope`: the transport view of a message (string-keyed properties plus an opaque body)
//!
//! ## MQTT Topics
//!
//! Topic scheme: `docsync/v1/{tenant}/changes`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod envelope;
pub mod keys;
pub mod message;
pub mod topics;
pub mod transport;

pub use codec::CodecError;
pub use envelope::Envelope;
pub use message::{ChangeMessage, MessageError, Metadata, Operation, ResourceType};
pub use topics::TopicScheme;
pub use transport::{ChannelPublisher, Publisher, TransportError};
