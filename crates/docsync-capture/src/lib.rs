//! # docsync Capture
//!
//! Producer side of replication: observes committed store events and
//! publishes one change message per event.
//!
//! Events committed by a transaction tagged with a replication origin are
//! suppressed, so a change replayed from a peer is never sent back out.
//! Capture is best-effort. Failures are returned from [`ChangeCapture::capture`]
//! and only logged by the observer hook, never surfaced to the store.

#![warn(missing_docs)]
#![warn(clippy::all)]

use docsync_core::origin::is_replicated_origin;
use docsync_core::{
    CollectionMeta, DocumentMeta, DocumentSnapshot, EventContext, InstanceId, StoreEvent,
    StoreObserver,
};
use docsync_proto::codec::{self, ZSTD_ENCODING};
use docsync_proto::keys;
use docsync_proto::{ChangeMessage, MessageError, Operation, Publisher, ResourceType, TransportError};

/// Result of capturing one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// A message was handed to the publisher
    Published,
    /// The event came from a replicated transaction
    Suppressed,
}

/// Observer that publishes store events as change messages.
pub struct ChangeCapture<P> {
    instance: InstanceId,
    publisher: P,
}

impl<P: Publisher> ChangeCapture<P> {
    /// Create a capture for the given local instance.
    #[must_use]
    pub fn new(instance: InstanceId, publisher: P) -> Self {
        Self {
            instance,
            publisher,
        }
    }

    /// The local instance id stamped on every message.
    #[must_use]
    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    /// Capture one committed event.
    ///
    /// # Errors
    ///
    /// Returns error if the message is malformed or the publisher refuses it.
    pub fn capture(
        &self,
        context: &EventContext<'_>,
        event: &StoreEvent,
    ) -> Result<CaptureOutcome, CaptureError> {
        if is_replicated_origin(context.origin) {
            tracing::debug!(
                txn_id = context.transaction_id,
                origin = ?context.origin,
                path = %event.path(),
                "Suppressing capture of replicated change"
            );
            return Ok(CaptureOutcome::Suppressed);
        }

        let message = self.build(event);
        message.validate()?;

        tracing::debug!(
            txn_id = context.transaction_id,
            resource_type = %message.resource_type,
            operation = %message.operation,
            path = %message.source_path,
            "Publishing change"
        );
        self.publisher.publish(message.to_envelope())?;

        Ok(CaptureOutcome::Published)
    }

    /// Build the change message describing `event`.
    #[must_use]
    pub fn build(&self, event: &StoreEvent) -> ChangeMessage {
        let message = match event {
            StoreEvent::DocumentCreated(doc) => document_content(Operation::Create, doc),
            StoreEvent::DocumentUpdated(doc) => document_content(Operation::Update, doc),
            StoreEvent::DocumentMetadataUpdated(meta) => with_document_meta(
                ChangeMessage::new(ResourceType::Document, Operation::Metadata, meta.path.as_str()),
                meta,
            ),
            StoreEvent::DocumentDeleted { path } => {
                ChangeMessage::new(ResourceType::Document, Operation::Delete, path.as_str())
            }
            StoreEvent::DocumentMoved { from, to } => {
                ChangeMessage::new(ResourceType::Document, Operation::Move, from.as_str())
                    .with_destination(to.as_str())
            }
            StoreEvent::DocumentCopied { from, to } => {
                ChangeMessage::new(ResourceType::Document, Operation::Copy, from.as_str())
                    .with_destination(to.as_str())
            }
            StoreEvent::CollectionCreated(meta) => collection_meta(Operation::Create, meta),
            StoreEvent::CollectionMetadataUpdated(meta) => collection_meta(Operation::Metadata, meta),
            StoreEvent::CollectionDeleted { path } => {
                ChangeMessage::new(ResourceType::Collection, Operation::Delete, path.as_str())
            }
            StoreEvent::CollectionMoved { from, to } => {
                ChangeMessage::new(ResourceType::Collection, Operation::Move, from.as_str())
                    .with_destination(to.as_str())
            }
            StoreEvent::CollectionCopied { from, to } => {
                ChangeMessage::new(ResourceType::Collection, Operation::Copy, from.as_str())
                    .with_destination(to.as_str())
            }
        };

        message.with_metadata(keys::SENDER_INSTANCE_ID, self.instance.as_str())
    }
}

impl<P: Publisher> StoreObserver for ChangeCapture<P> {
    fn on_event(&self, context: &EventContext<'_>, event: &StoreEvent) {
        match self.capture(context, event) {
            Ok(CaptureOutcome::Published) => {
                tracing::trace!(path = %event.path(), "Change captured");
            }
            Ok(CaptureOutcome::Suppressed) => {}
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    txn_id = context.transaction_id,
                    path = %event.path(),
                    "Failed to publish change, local commit unaffected"
                );
            }
        }
    }
}

fn document_content(operation: Operation, doc: &DocumentSnapshot) -> ChangeMessage {
    let message = with_document_meta(
        ChangeMessage::new(ResourceType::Document, operation, doc.meta.path.as_str()),
        &doc.meta,
    )
    .with_metadata(keys::CONTENT_LENGTH, doc.content.len() as u64);

    match codec::compress(&doc.content) {
        Ok(payload) => message
            .with_metadata(keys::CONTENT_ENCODING, ZSTD_ENCODING)
            .with_payload(payload),
        Err(err) => {
            tracing::warn!(
                error = %err,
                path = %doc.meta.path,
                "Failed to encode document content, sending change without payload"
            );
            message
        }
    }
}

fn with_document_meta(message: ChangeMessage, meta: &DocumentMeta) -> ChangeMessage {
    message
        .with_metadata(keys::OWNER, meta.permission.owner.as_str())
        .with_metadata(keys::GROUP, meta.permission.group.as_str())
        .with_metadata(keys::MODE, meta.permission.mode)
        .with_metadata(keys::MIME_TYPE, meta.mime_type.as_str())
}

fn collection_meta(operation: Operation, meta: &CollectionMeta) -> ChangeMessage {
    ChangeMessage::new(ResourceType::Collection, operation, meta.path.as_str())
        .with_metadata(keys::OWNER, meta.permission.owner.as_str())
        .with_metadata(keys::GROUP, meta.permission.group.as_str())
        .with_metadata(keys::MODE, meta.permission.mode)
}

/// Errors from capturing an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    /// The built message is malformed
    #[error("invalid change message: {0}")]
    Message(#[from] MessageError),
    /// The publisher refused the message
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::origin::APPLIER_ORIGIN;
    use docsync_core::{DocumentKind, Permission, ResourcePath};
    use docsync_proto::{ChannelPublisher, Envelope};

    fn path(p: &str) -> ResourcePath {
        ResourcePath::parse(p).unwrap()
    }

    fn context(origin: Option<&str>) -> EventContext<'_> {
        EventContext {
            transaction_id: 7,
            origin,
            origin_tracking: true,
        }
    }

    fn snapshot() -> DocumentSnapshot {
        let content = b"<root>hello</root>".to_vec();
        DocumentSnapshot {
            meta: DocumentMeta {
                path: path("/db/a/doc.xml"),
                kind: DocumentKind::Xml,
                mime_type: "application/xml".to_string(),
                permission: Permission::new("alice", "staff", 0o640),
                content_length: content.len() as u64,
            },
            content,
        }
    }

    fn decode(envelope: &Envelope) -> ChangeMessage {
        ChangeMessage::from_envelope(envelope).unwrap()
    }

    #[test]
    fn document_create_carries_compressed_content() {
        let (publisher, mut rx) = ChannelPublisher::new();
        let capture = ChangeCapture::new(InstanceId::new("node-a"), publisher);

        let outcome = capture
            .capture(&context(None), &StoreEvent::DocumentCreated(snapshot()))
            .unwrap();
        assert_eq!(outcome, CaptureOutcome::Published);

        let message = decode(&rx.try_recv().unwrap());
        assert_eq!(message.resource_type, ResourceType::Document);
        assert_eq!(message.operation, Operation::Create);
        assert_eq!(message.source_path, "/db/a/doc.xml");
        assert_eq!(message.sender(), Some("node-a"));
        assert_eq!(message.content_encoding(), Some(ZSTD_ENCODING));
        assert_eq!(message.metadata_str(keys::OWNER), Some("alice"));
        assert_eq!(message.metadata.get(keys::MODE), Some(&serde_json::Value::from(0o640)));

        let content = codec::decompress(message.payload.as_deref().unwrap()).unwrap();
        assert_eq!(content, b"<root>hello</root>");
    }

    #[test]
    fn replicated_origin_is_suppressed() {
        let (publisher, mut rx) = ChannelPublisher::new();
        let capture = ChangeCapture::new(InstanceId::new("node-a"), publisher);

        let outcome = capture
            .capture(
                &context(Some(APPLIER_ORIGIN)),
                &StoreEvent::DocumentDeleted {
                    path: path("/db/a/doc.xml"),
                },
            )
            .unwrap();
        assert_eq!(outcome, CaptureOutcome::Suppressed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn local_origin_tag_is_not_suppressed() {
        let (publisher, mut rx) = ChannelPublisher::new();
        let capture = ChangeCapture::new(InstanceId::new("node-a"), publisher);

        let outcome = capture
            .capture(
                &context(Some("user-session")),
                &StoreEvent::DocumentDeleted {
                    path: path("/db/a/doc.xml"),
                },
            )
            .unwrap();
        assert_eq!(outcome, CaptureOutcome::Published);
        assert_eq!(decode(&rx.try_recv().unwrap()).operation, Operation::Delete);
    }

    #[test]
    fn move_carries_only_paths() {
        let (publisher, mut rx) = ChannelPublisher::new();
        let capture = ChangeCapture::new(InstanceId::new("node-a"), publisher);

        capture
            .capture(
                &context(Some("user-session")),
                &StoreEvent::CollectionMoved {
                    from: path("/db/a"),
                    to: path("/db/b/a"),
                },
            )
            .unwrap();

        let message = decode(&rx.try_recv().unwrap());
        assert_eq!(message.resource_type, ResourceType::Collection);
        assert_eq!(message.operation, Operation::Move);
        assert_eq!(message.destination_path.as_deref(), Some("/db/b/a"));
        assert!(message.payload.is_none());
        assert_eq!(message.metadata.len(), 1);
    }

    #[test]
    fn metadata_change_resends_permissions_without_content() {
        let capture = ChangeCapture::new(InstanceId::new("node-a"), ChannelPublisher::new().0);
        let message = capture.build(&StoreEvent::DocumentMetadataUpdated(snapshot().meta));
        assert_eq!(message.operation, Operation::Metadata);
        assert!(message.payload.is_none());
        assert_eq!(message.metadata_str(keys::GROUP), Some("staff"));
        assert_eq!(message.metadata_str(keys::MIME_TYPE), Some("application/xml"));
    }

    #[test]
    fn publish_failure_is_returned_not_panicked() {
        let (publisher, rx) = ChannelPublisher::new();
        drop(rx);
        let capture = ChangeCapture::new(InstanceId::new("node-a"), publisher);
        let event = StoreEvent::CollectionDeleted { path: path("/db/a") };

        assert_eq!(
            capture.capture(&context(None), &event),
            Err(CaptureError::Transport(TransportError::Closed))
        );
        capture.on_event(&context(None), &event);
    }
}
