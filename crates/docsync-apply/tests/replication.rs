//! End-to-end replication scenarios between in-memory stores.

use docsync_apply::{ApplyError, ApplyOutcome, ChangeApplier, SkipReason};
use docsync_capture::ChangeCapture;
use docsync_core::identity::{SYSTEM_ACCOUNT, SYSTEM_GROUP};
use docsync_core::memory::MemoryStoreOptions;
use docsync_core::{
    DocumentKind, InstanceId, LocalDirectory, LockMode, MemoryStore, PermissionUpdate,
    ResourcePath, Store, StoreError,
};
use docsync_proto::codec::{self, ZSTD_ENCODING};
use docsync_proto::{keys, ChangeMessage, ChannelPublisher, Envelope, Operation, ResourceType};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

const XML: &[u8] = b"<?xml version=\"1.0\"?>\n<root><item id=\"1\">hello</item></root>";

struct Node {
    store: Arc<MemoryStore>,
    applier: ChangeApplier<MemoryStore, LocalDirectory>,
    outbox: UnboundedReceiver<Envelope>,
}

impl Node {
    fn new(id: &str) -> Self {
        Self::with_store(id, MemoryStore::with_options(short_timeout(true)))
    }

    fn with_store(id: &str, store: MemoryStore) -> Self {
        let directory = LocalDirectory::default()
            .with_account("alice", "staff")
            .with_account("bob", "staff");
        let store = Arc::new(store);
        let (publisher, outbox) = ChannelPublisher::new();
        store.register_observer(Arc::new(ChangeCapture::new(
            InstanceId::new(id),
            publisher,
        )));
        let applier = ChangeApplier::new(store.clone(), Arc::new(directory), InstanceId::new(id));
        Self {
            store,
            applier,
            outbox,
        }
    }

    fn drain(&mut self) -> Vec<Envelope> {
        let mut envelopes = Vec::new();
        while let Ok(envelope) = self.outbox.try_recv() {
            envelopes.push(envelope);
        }
        envelopes
    }
}

fn short_timeout(origin_tracking: bool) -> MemoryStoreOptions {
    MemoryStoreOptions {
        lock_timeout: Duration::from_millis(200),
        origin_tracking,
    }
}

fn path(p: &str) -> ResourcePath {
    ResourcePath::parse(p).unwrap()
}

fn document_create(target: &str, content: &[u8]) -> ChangeMessage {
    ChangeMessage::new(ResourceType::Document, Operation::Create, target)
        .with_metadata(keys::SENDER_INSTANCE_ID, "node-a")
        .with_metadata(keys::CONTENT_ENCODING, ZSTD_ENCODING)
        .with_metadata(keys::CONTENT_LENGTH, content.len() as u64)
        .with_payload(codec::compress(content).unwrap())
}

fn remote(resource_type: ResourceType, operation: Operation, source: &str) -> ChangeMessage {
    ChangeMessage::new(resource_type, operation, source).with_metadata(keys::SENDER_INSTANCE_ID, "node-a")
}

fn seed_document(node: &Node, target: &str) {
    let message = document_create(target, XML)
        .with_metadata(keys::OWNER, "alice")
        .with_metadata(keys::GROUP, "staff")
        .with_metadata(keys::MODE, "0640")
        .with_metadata(keys::MIME_TYPE, "application/xml");
    assert_eq!(node.applier.apply(&message), Ok(ApplyOutcome::Applied));
}

#[test]
fn document_create_stores_content_and_permissions() {
    let node = Node::new("node-b");
    seed_document(&node, "/db/a/doc.xml");

    let doc = node.store.document_at(&path("/db/a/doc.xml")).unwrap();
    assert_eq!(doc.content, XML);
    assert_eq!(doc.meta.kind, DocumentKind::Xml);
    assert_eq!(doc.meta.mime_type, "application/xml");
    assert_eq!(doc.meta.permission.owner, "alice");
    assert_eq!(doc.meta.permission.group, "staff");
    assert_eq!(doc.meta.permission.mode, 0o640);

    let parent = node.store.collection_at(&path("/db/a")).unwrap();
    assert_eq!(parent.permission.owner, "alice");
    assert_eq!(parent.permission.mode, 0o755);
}

#[test]
fn unknown_owner_falls_back_to_system_account() {
    let node = Node::new("node-b");
    let message = document_create("/db/a/doc.xml", XML)
        .with_metadata(keys::OWNER, "mallory")
        .with_metadata(keys::GROUP, "outsiders")
        .with_metadata(keys::MODE, 0o640);
    assert_eq!(node.applier.apply(&message), Ok(ApplyOutcome::Applied));

    let doc = node.store.document_at(&path("/db/a/doc.xml")).unwrap();
    assert_eq!(doc.meta.permission.owner, SYSTEM_ACCOUNT);
    assert_eq!(doc.meta.permission.group, SYSTEM_GROUP);
    assert_eq!(doc.meta.permission.mode, 0o640);
}

#[test]
fn delete_of_missing_document_is_a_clean_skip() {
    let mut node = Node::new("node-b");
    let before = node.store.paths();

    let missing_doc = remote(ResourceType::Document, Operation::Delete, "/db/missing.xml");
    assert_eq!(
        node.applier.apply(&missing_doc),
        Ok(ApplyOutcome::Skipped(SkipReason::MissingDocument))
    );
    let missing_parent = remote(ResourceType::Document, Operation::Delete, "/db/none/doc.xml");
    assert_eq!(
        node.applier.apply(&missing_parent),
        Ok(ApplyOutcome::Skipped(SkipReason::MissingCollection))
    );

    assert_eq!(node.store.paths(), before);
    assert!(node.drain().is_empty());
    assert_eq!(node.applier.report().snapshot().skipped, 2);
}

#[test]
fn collection_create_twice_keeps_first_permissions() {
    let node = Node::new("node-b");
    let first = remote(ResourceType::Collection, Operation::Create, "/db/shared")
        .with_metadata(keys::OWNER, "alice")
        .with_metadata(keys::MODE, 0o700);
    let second = remote(ResourceType::Collection, Operation::Create, "/db/shared")
        .with_metadata(keys::OWNER, "bob")
        .with_metadata(keys::MODE, 0o777);

    assert_eq!(node.applier.apply(&first), Ok(ApplyOutcome::Applied));
    assert_eq!(
        node.applier.apply(&second),
        Ok(ApplyOutcome::Skipped(SkipReason::CollectionExists))
    );

    let meta = node.store.collection_at(&path("/db/shared")).unwrap();
    assert_eq!(meta.permission.owner, "alice");
    assert_eq!(meta.permission.mode, 0o700);
}

#[test]
fn own_messages_are_never_applied() {
    let node = Node::new("node-b");
    let before = node.store.paths();

    for resource_type in ResourceType::ALL {
        for operation in Operation::ALL {
            let mut message = ChangeMessage::new(resource_type, operation, "/db/a/doc.xml")
                .with_metadata(keys::SENDER_INSTANCE_ID, "node-b");
            if operation.has_destination() {
                message = message.with_destination("/db/b/doc.xml");
            }
            if docsync_proto::message::carries_payload(resource_type, operation) {
                message = message.with_payload(codec::compress(XML).unwrap());
            }
            assert_eq!(
                node.applier.apply(&message),
                Ok(ApplyOutcome::SelfOrigin),
                "{resource_type} {operation}"
            );
        }
    }

    assert_eq!(node.store.paths(), before);
    assert_eq!(node.applier.report().snapshot().self_origin, 12);
}

#[test]
fn move_into_missing_collection_changes_nothing() {
    let node = Node::new("node-b");
    seed_document(&node, "/db/a/doc.xml");
    let before = node.store.paths();

    let message = remote(ResourceType::Document, Operation::Move, "/db/a/doc.xml")
        .with_destination("/db/b/doc2.xml");
    assert_eq!(
        node.applier.apply(&message),
        Ok(ApplyOutcome::Skipped(SkipReason::MissingCollection))
    );

    assert_eq!(node.store.paths(), before);
    assert!(node.store.document_at(&path("/db/a/doc.xml")).is_some());
    assert!(node.store.collection_at(&path("/db/b")).is_none());
}

#[test]
fn metadata_update_applies_only_supplied_fields() {
    let node = Node::new("node-b");
    seed_document(&node, "/db/a/doc.xml");

    let message = remote(ResourceType::Document, Operation::Metadata, "/db/a/doc.xml")
        .with_metadata(keys::MODE, "0600");
    assert_eq!(node.applier.apply(&message), Ok(ApplyOutcome::Applied));

    let doc = node.store.document_at(&path("/db/a/doc.xml")).unwrap();
    assert_eq!(doc.meta.permission.mode, 0o600);
    assert_eq!(doc.meta.permission.owner, "alice");
    assert_eq!(doc.meta.permission.group, "staff");
    assert_eq!(doc.meta.mime_type, "application/xml");
    assert_eq!(doc.content, XML);
}

#[test]
fn metadata_update_can_change_mime_type() {
    let node = Node::new("node-b");
    seed_document(&node, "/db/a/doc.xml");

    let message = remote(ResourceType::Document, Operation::Metadata, "/db/a/doc.xml")
        .with_metadata(keys::MIME_TYPE, "text/xml");
    assert_eq!(node.applier.apply(&message), Ok(ApplyOutcome::Applied));

    let doc = node.store.document_at(&path("/db/a/doc.xml")).unwrap();
    assert_eq!(doc.meta.mime_type, "text/xml");
    assert_eq!(doc.meta.permission.mode, 0o640);
}

#[test]
fn paired_instances_do_not_loop() {
    let mut a = Node::new("node-a");
    let mut b = Node::new("node-b");

    let mut txn = a.store.begin();
    let collection = a
        .store
        .get_or_create_collection(&mut txn, &path("/db/reports"), &PermissionUpdate::default())
        .unwrap();
    let staged = a
        .store
        .validate_xml(&mut txn, &collection.path, "q1.xml", XML)
        .unwrap();
    a.store
        .store_xml(&mut txn, staged, "application/xml", &PermissionUpdate::default())
        .unwrap();
    a.store.commit(txn).unwrap();

    let outbound = a.drain();
    assert_eq!(outbound.len(), 2);

    for envelope in &outbound {
        assert_eq!(b.applier.handle_envelope(envelope), Ok(ApplyOutcome::Applied));
    }
    assert!(b.drain().is_empty(), "replayed changes must not be republished");
    assert_eq!(
        b.store.document_at(&path("/db/reports/q1.xml")).unwrap().content,
        XML
    );

    // Shared topic: the sender hears its own messages too.
    for envelope in &outbound {
        assert_eq!(
            a.applier.handle_envelope(envelope),
            Ok(ApplyOutcome::SelfOrigin)
        );
    }
    assert!(a.drain().is_empty());
}

fn commit_local_document(node: &Node, collection: &str, name: &str) {
    let mut txn = node.store.begin();
    let collection = node
        .store
        .get_or_create_collection(&mut txn, &path(collection), &PermissionUpdate::default())
        .unwrap();
    let staged = node
        .store
        .validate_xml(&mut txn, &collection.path, name, XML)
        .unwrap();
    node.store
        .store_xml(&mut txn, staged, "application/xml", &PermissionUpdate::default())
        .unwrap();
    node.store.commit(txn).unwrap();
}

#[test]
fn untracked_store_republishes_one_message_per_applied_change() {
    let mut b = Node::with_store("node-b", MemoryStore::with_options(short_timeout(false)));

    let collection = remote(ResourceType::Collection, Operation::Create, "/db/shared")
        .with_metadata(keys::OWNER, "alice")
        .with_metadata(keys::MODE, 0o700);
    let document = document_create("/db/shared/doc.xml", XML)
        .with_metadata(keys::OWNER, "bob")
        .with_metadata(keys::GROUP, "staff")
        .with_metadata(keys::MODE, "0640")
        .with_metadata(keys::MIME_TYPE, "application/xml");
    let update = document_create("/db/shared/doc.xml", b"<root/>")
        .with_metadata(keys::MODE, "0600");
    let metadata = remote(ResourceType::Document, Operation::Metadata, "/db/shared/doc.xml")
        .with_metadata(keys::OWNER, "alice")
        .with_metadata(keys::MIME_TYPE, "text/xml");

    let expected = [
        (collection, ResourceType::Collection, Operation::Create),
        (document, ResourceType::Document, Operation::Create),
        (update, ResourceType::Document, Operation::Update),
        (metadata, ResourceType::Document, Operation::Metadata),
    ];
    for (message, resource_type, operation) in &expected {
        assert_eq!(b.applier.apply(message), Ok(ApplyOutcome::Applied));

        let republished = b.drain();
        assert_eq!(republished.len(), 1, "{resource_type} {operation}");
        let echo = ChangeMessage::from_envelope(&republished[0]).unwrap();
        assert_eq!(echo.resource_type, *resource_type);
        assert_eq!(echo.operation, *operation);
        assert_eq!(echo.sender(), Some("node-b"));
    }

    let doc = b.store.document_at(&path("/db/shared/doc.xml")).unwrap();
    assert_eq!(doc.meta.permission.owner, "alice");
    assert_eq!(doc.meta.permission.mode, 0o600);
    assert_eq!(doc.meta.mime_type, "text/xml");
}

#[test]
fn untracked_pair_echoes_one_to_one() {
    let mut a = Node::with_store("node-a", MemoryStore::with_options(short_timeout(false)));
    let mut b = Node::with_store("node-b", MemoryStore::with_options(short_timeout(false)));
    commit_local_document(&a, "/db", "doc.xml");

    let mut in_flight = a.drain();
    assert_eq!(in_flight.len(), 1);

    // Without origin tags every applied change is captured again; the
    // number of messages must not grow from one round to the next.
    for round in 0..10 {
        let receiver = if round % 2 == 0 { &mut b } else { &mut a };
        for envelope in &in_flight {
            assert_eq!(
                receiver.applier.handle_envelope(envelope),
                Ok(ApplyOutcome::Applied)
            );
        }
        in_flight = receiver.drain();
        assert_eq!(in_flight.len(), 1, "round {round}");
    }

    assert_eq!(a.store.document_at(&path("/db/doc.xml")).unwrap().content, XML);
    assert_eq!(b.store.document_at(&path("/db/doc.xml")).unwrap().content, XML);
}

#[test]
fn bounce_from_untracked_peer_is_reapplied_once() {
    let mut a = Node::new("node-a");
    let mut b = Node::with_store("node-b", MemoryStore::with_options(short_timeout(false)));
    commit_local_document(&a, "/db/reports", "q1.xml");

    let outbound = a.drain();
    assert_eq!(outbound.len(), 2);
    for envelope in &outbound {
        assert_eq!(b.applier.handle_envelope(envelope), Ok(ApplyOutcome::Applied));
    }

    // b cannot tag its replay, so it republishes each change under its own id
    let bounced = b.drain();
    assert_eq!(bounced.len(), outbound.len());
    for envelope in &bounced {
        let message = ChangeMessage::from_envelope(envelope).unwrap();
        assert_eq!(message.sender(), Some("node-b"));
        assert_eq!(b.applier.handle_envelope(envelope), Ok(ApplyOutcome::SelfOrigin));
    }

    // a applies the echo: the collection already exists, the document is
    // rewritten with identical content, and a's tagged replay stays local.
    let outcomes: Vec<_> = bounced
        .iter()
        .map(|envelope| a.applier.handle_envelope(envelope))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            Ok(ApplyOutcome::Skipped(SkipReason::CollectionExists)),
            Ok(ApplyOutcome::Applied),
        ]
    );
    assert!(a.drain().is_empty());
    assert_eq!(
        a.store.document_at(&path("/db/reports/q1.xml")).unwrap().content,
        XML
    );
}

#[test]
fn failed_apply_leaves_store_unchanged() {
    let mut node = Node::new("node-b");
    let before = node.store.paths();

    let message = document_create("/db/new/doc.xml", b"definitely not xml")
        .with_metadata(keys::MIME_TYPE, "application/xml");
    let result = node.applier.apply(&message);
    assert!(matches!(
        result,
        Err(ApplyError::Store(StoreError::Validation { .. }))
    ));

    assert_eq!(node.store.paths(), before);
    assert!(node.drain().is_empty());
    let snapshot = node.applier.report().snapshot();
    assert_eq!(snapshot.failed, 1);
    assert!(snapshot.last_error.is_some());
}

#[test]
fn binary_document_resolved_by_extension() {
    let node = Node::new("node-b");
    let png = b"\x89PNG\r\n\x1a\nrest";

    assert_eq!(
        node.applier.apply(&document_create("/db/img/logo.png", png)),
        Ok(ApplyOutcome::Applied)
    );
    let doc = node.store.document_at(&path("/db/img/logo.png")).unwrap();
    assert_eq!(doc.meta.kind, DocumentKind::Binary);
    assert_eq!(doc.meta.mime_type, "image/png");
    assert_eq!(doc.content, png);

    let delete = remote(ResourceType::Document, Operation::Delete, "/db/img/logo.png");
    assert_eq!(node.applier.apply(&delete), Ok(ApplyOutcome::Applied));
    assert!(node.store.document_at(&path("/db/img/logo.png")).is_none());
}

#[test]
fn unresolvable_mime_type_is_a_processing_error() {
    let node = Node::new("node-b");
    let result = node.applier.apply(&document_create("/db/a/README", b"plain"));
    assert!(matches!(result, Err(ApplyError::Reconcile(_))));
}

#[test]
fn unencoded_payload_is_taken_as_raw() {
    let node = Node::new("node-b");
    let message = ChangeMessage::new(ResourceType::Document, Operation::Create, "/db/raw.xml")
        .with_metadata(keys::SENDER_INSTANCE_ID, "node-a")
        .with_payload(XML.to_vec());
    assert_eq!(node.applier.apply(&message), Ok(ApplyOutcome::Applied));
    assert_eq!(node.store.document_at(&path("/db/raw.xml")).unwrap().content, XML);
}

#[test]
fn document_update_replaces_content() {
    let node = Node::new("node-b");
    seed_document(&node, "/db/a/doc.xml");

    let mut update = document_create("/db/a/doc.xml", b"<root>v2</root>");
    update.operation = Operation::Update;
    assert_eq!(node.applier.apply(&update), Ok(ApplyOutcome::Applied));

    let doc = node.store.document_at(&path("/db/a/doc.xml")).unwrap();
    assert_eq!(doc.content, b"<root>v2</root>");
    assert_eq!(doc.meta.permission.owner, "alice");
}

#[test]
fn copy_within_one_collection_reuses_the_lock() {
    let node = Node::new("node-b");
    seed_document(&node, "/db/a/doc.xml");

    let message = remote(ResourceType::Document, Operation::Copy, "/db/a/doc.xml")
        .with_destination("/db/a/copy.xml");
    assert_eq!(node.applier.apply(&message), Ok(ApplyOutcome::Applied));
    assert!(node.store.document_at(&path("/db/a/doc.xml")).is_some());
    assert_eq!(
        node.store.document_at(&path("/db/a/copy.xml")).unwrap().content,
        XML
    );
}

#[test]
fn document_move_between_collections() {
    let node = Node::new("node-b");
    seed_document(&node, "/db/a/doc.xml");
    let create_b = remote(ResourceType::Collection, Operation::Create, "/db/b");
    assert_eq!(node.applier.apply(&create_b), Ok(ApplyOutcome::Applied));

    let message = remote(ResourceType::Document, Operation::Move, "/db/a/doc.xml")
        .with_destination("/db/b/doc2.xml");
    assert_eq!(node.applier.apply(&message), Ok(ApplyOutcome::Applied));
    assert!(node.store.document_at(&path("/db/a/doc.xml")).is_none());
    assert!(node.store.document_at(&path("/db/b/doc2.xml")).is_some());
}

#[test]
fn collection_copy_and_move() {
    let node = Node::new("node-b");
    seed_document(&node, "/db/a/x/doc.xml");

    let copy = remote(ResourceType::Collection, Operation::Copy, "/db/a").with_destination("/db/c");
    assert_eq!(node.applier.apply(&copy), Ok(ApplyOutcome::Applied));
    assert!(node.store.document_at(&path("/db/c/x/doc.xml")).is_some());
    assert!(node.store.document_at(&path("/db/a/x/doc.xml")).is_some());

    let moved = remote(ResourceType::Collection, Operation::Move, "/db/a").with_destination("/db/b/a");
    assert_eq!(
        node.applier.apply(&moved),
        Ok(ApplyOutcome::Skipped(SkipReason::MissingCollection))
    );

    let create_b = remote(ResourceType::Collection, Operation::Create, "/db/b");
    assert_eq!(node.applier.apply(&create_b), Ok(ApplyOutcome::Applied));
    assert_eq!(node.applier.apply(&moved), Ok(ApplyOutcome::Applied));
    assert!(node.store.collection_at(&path("/db/a")).is_none());
    assert!(node.store.document_at(&path("/db/b/a/x/doc.xml")).is_some());
}

#[test]
fn collection_metadata_and_delete() {
    let node = Node::new("node-b");
    seed_document(&node, "/db/a/doc.xml");

    let meta = remote(ResourceType::Collection, Operation::Metadata, "/db/a")
        .with_metadata(keys::GROUP, "staff")
        .with_metadata(keys::MODE, 0o750);
    assert_eq!(node.applier.apply(&meta), Ok(ApplyOutcome::Applied));
    let collection = node.store.collection_at(&path("/db/a")).unwrap();
    assert_eq!(collection.permission.group, "staff");
    assert_eq!(collection.permission.mode, 0o750);
    assert_eq!(collection.permission.owner, "alice");

    let delete = remote(ResourceType::Collection, Operation::Delete, "/db/a");
    assert_eq!(node.applier.apply(&delete), Ok(ApplyOutcome::Applied));
    assert!(node.store.collection_at(&path("/db/a")).is_none());
    assert!(node.store.document_at(&path("/db/a/doc.xml")).is_none());

    assert_eq!(
        node.applier.apply(&delete),
        Ok(ApplyOutcome::Skipped(SkipReason::MissingCollection))
    );
    assert_eq!(
        node.applier.apply(&meta),
        Ok(ApplyOutcome::Skipped(SkipReason::MissingCollection))
    );
}

#[test]
fn locks_are_released_after_every_outcome() {
    let node = Node::new("node-b");
    seed_document(&node, "/db/a/doc.xml");

    let skipped = remote(ResourceType::Document, Operation::Move, "/db/a/doc.xml")
        .with_destination("/db/missing/doc.xml");
    node.applier.apply(&skipped).unwrap();
    let failed = document_create("/db/a/bad.xml", b"oops").with_metadata(keys::MIME_TYPE, "application/xml");
    assert!(node.applier.apply(&failed).is_err());

    for collection in ["/db", "/db/a"] {
        let guard = node
            .store
            .open_collection(&path(collection), LockMode::Write)
            .unwrap();
        assert!(guard.is_some(), "{collection} still locked");
    }
}
