//! Store collaborator interface.
//!
//! The replication core never talks to a concrete database. It needs:
//! - transactions that can be tagged with an origin and committed or aborted
//! - collections opened under a read or write lock
//! - create/store/remove/relocate primitives for documents and collections
//! - lifecycle events delivered after commit, for change capture

use crate::lock::{CollectionGuard, LockMode};
use crate::path::{PathError, ResourcePath};
use crate::permission::{Permission, PermissionUpdate};
use serde::{Deserialize, Serialize};

/// How a document is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentKind {
    /// Validated structured content
    Xml,
    /// Opaque byte stream
    Binary,
}

/// Metadata of a stored document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMeta {
    /// Absolute document path
    pub path: ResourcePath,
    /// Storage kind
    pub kind: DocumentKind,
    /// Mime type name
    pub mime_type: String,
    /// Owner, group and mode
    pub permission: Permission,
    /// Content length in bytes
    pub content_length: u64,
}

/// A document together with its serialized content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSnapshot {
    /// Document metadata
    pub meta: DocumentMeta,
    /// Serialized content
    pub content: Vec<u8>,
}

/// Metadata of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMeta {
    /// Absolute collection path
    pub path: ResourcePath,
    /// Owner, group and mode
    pub permission: Permission,
}

/// XML content that passed validation and awaits storage.
///
/// Produced by [`Store::validate_xml`] and consumed by [`Store::store_xml`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedDocument {
    /// Target document path
    pub path: ResourcePath,
    /// Validated content
    pub content: Vec<u8>,
}

/// A committed store mutation, as seen by observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A new document was stored
    DocumentCreated(DocumentSnapshot),
    /// An existing document was replaced
    DocumentUpdated(DocumentSnapshot),
    /// Owner, group, mode or mime type of a document changed
    DocumentMetadataUpdated(DocumentMeta),
    /// A document was removed
    DocumentDeleted {
        /// Removed document path
        path: ResourcePath,
    },
    /// A document was relocated
    DocumentMoved {
        /// Old path
        from: ResourcePath,
        /// New path
        to: ResourcePath,
    },
    /// A document was duplicated
    DocumentCopied {
        /// Original path
        from: ResourcePath,
        /// Path of the copy
        to: ResourcePath,
    },
    /// A collection was created
    CollectionCreated(CollectionMeta),
    /// Owner, group or mode of a collection changed
    CollectionMetadataUpdated(CollectionMeta),
    /// A collection and its subtree were removed
    CollectionDeleted {
        /// Removed collection path
        path: ResourcePath,
    },
    /// A collection subtree was relocated
    CollectionMoved {
        /// Old path
        from: ResourcePath,
        /// New path
        to: ResourcePath,
    },
    /// A collection subtree was duplicated
    CollectionCopied {
        /// Original path
        from: ResourcePath,
        /// Path of the copy
        to: ResourcePath,
    },
}

impl StoreEvent {
    /// The primary path the event is about.
    #[must_use]
    pub fn path(&self) -> &ResourcePath {
        match self {
            Self::DocumentCreated(doc) | Self::DocumentUpdated(doc) => &doc.meta.path,
            Self::DocumentMetadataUpdated(meta) => &meta.path,
            Self::CollectionCreated(meta) | Self::CollectionMetadataUpdated(meta) => &meta.path,
            Self::DocumentDeleted { path } | Self::CollectionDeleted { path } => path,
            Self::DocumentMoved { to, .. }
            | Self::DocumentCopied { to, .. }
            | Self::CollectionMoved { to, .. }
            | Self::CollectionCopied { to, .. } => to,
        }
    }
}

/// Transaction under which an event fired.
#[derive(Debug, Clone, Copy)]
pub struct EventContext<'a> {
    /// Committing transaction id
    pub transaction_id: u64,
    /// Origin tag of the transaction, if any
    pub origin: Option<&'a str>,
    /// Whether the store supports origin tags at all
    pub origin_tracking: bool,
}

/// Receives lifecycle events after each commit.
///
/// Observers cannot fail the commit that produced the event.
pub trait StoreObserver: Send + Sync {
    /// Handle one committed event.
    fn on_event(&self, context: &EventContext<'_>, event: &StoreEvent);
}

/// A store transaction.
pub trait Transaction {
    /// Transaction id, unique per store.
    fn id(&self) -> u64;

    /// Origin tag, if one was set.
    fn origin(&self) -> Option<&str>;

    /// Tag the transaction with its origin.
    ///
    /// Returns `false` when the store does not support origin tags.
    fn set_origin(&mut self, origin: &str) -> bool;
}

/// The hierarchical document store, as seen by the replication core.
///
/// Collection-relative primitives take the path of a collection the caller
/// has opened with [`open_collection`](Store::open_collection) and still holds.
pub trait Store: Send + Sync {
    /// Transaction type.
    type Txn: Transaction;

    /// Begin a transaction.
    fn begin(&self) -> Self::Txn;

    /// Commit a transaction and deliver its events.
    ///
    /// # Errors
    ///
    /// Returns error if the commit fails; the transaction is rolled back.
    fn commit(&self, txn: Self::Txn) -> Result<(), StoreError>;

    /// Abort a transaction, undoing its changes.
    fn abort(&self, txn: Self::Txn);

    /// Open a collection under a lock, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns error if the lock cannot be acquired.
    fn open_collection(
        &self,
        path: &ResourcePath,
        mode: LockMode,
    ) -> Result<Option<CollectionGuard>, StoreError>;

    /// Find a document in an open collection.
    ///
    /// # Errors
    ///
    /// Returns error on store failure.
    fn document(
        &self,
        txn: &Self::Txn,
        collection: &ResourcePath,
        name: &str,
    ) -> Result<Option<DocumentMeta>, StoreError>;

    /// Return the collection at `path`, creating it and any missing ancestors.
    ///
    /// Collections created here get the default permission with `permission`
    /// applied. Existing collections are left untouched.
    ///
    /// # Errors
    ///
    /// Returns error if a document occupies part of the path.
    fn get_or_create_collection(
        &self,
        txn: &mut Self::Txn,
        path: &ResourcePath,
        permission: &PermissionUpdate,
    ) -> Result<CollectionMeta, StoreError>;

    /// First phase of an XML insert: check the content is well formed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] if the content is rejected.
    fn validate_xml(
        &self,
        txn: &mut Self::Txn,
        collection: &ResourcePath,
        name: &str,
        content: &[u8],
    ) -> Result<StagedDocument, StoreError>;

    /// Second phase of an XML insert: materialize validated content.
    ///
    /// `permission` is applied over the replaced document's permission, or
    /// over the default for a new one, as part of the same change.
    ///
    /// # Errors
    ///
    /// Returns error on store failure.
    fn store_xml(
        &self,
        txn: &mut Self::Txn,
        staged: StagedDocument,
        mime_type: &str,
        permission: &PermissionUpdate,
    ) -> Result<DocumentMeta, StoreError>;

    /// Store an opaque binary document, with `permission` applied as for
    /// [`store_xml`](Store::store_xml).
    ///
    /// # Errors
    ///
    /// Returns error on store failure.
    fn store_binary(
        &self,
        txn: &mut Self::Txn,
        collection: &ResourcePath,
        name: &str,
        content: &[u8],
        mime_type: &str,
        permission: &PermissionUpdate,
    ) -> Result<DocumentMeta, StoreError>;

    /// Remove an XML document.
    ///
    /// # Errors
    ///
    /// Returns error if the document is missing or is not XML.
    fn remove_xml(&self, txn: &mut Self::Txn, document: &ResourcePath) -> Result<(), StoreError>;

    /// Remove a binary document.
    ///
    /// # Errors
    ///
    /// Returns error if the document is missing or is not binary.
    fn remove_binary(&self, txn: &mut Self::Txn, document: &ResourcePath)
        -> Result<(), StoreError>;

    /// Move a document into `destination` under `new_name`.
    ///
    /// # Errors
    ///
    /// Returns error on store failure.
    fn move_document(
        &self,
        txn: &mut Self::Txn,
        document: &ResourcePath,
        destination: &ResourcePath,
        new_name: &str,
    ) -> Result<DocumentMeta, StoreError>;

    /// Copy a document into `destination` under `new_name`.
    ///
    /// # Errors
    ///
    /// Returns error on store failure.
    fn copy_document(
        &self,
        txn: &mut Self::Txn,
        document: &ResourcePath,
        destination: &ResourcePath,
        new_name: &str,
    ) -> Result<DocumentMeta, StoreError>;

    /// Remove a collection and everything below it.
    ///
    /// # Errors
    ///
    /// Returns error on store failure.
    fn remove_collection(
        &self,
        txn: &mut Self::Txn,
        collection: &ResourcePath,
    ) -> Result<(), StoreError>;

    /// Move a collection subtree below `destination` as `new_name`.
    ///
    /// # Errors
    ///
    /// Returns error if the target exists or lies inside the source.
    fn move_collection(
        &self,
        txn: &mut Self::Txn,
        collection: &ResourcePath,
        destination: &ResourcePath,
        new_name: &str,
    ) -> Result<CollectionMeta, StoreError>;

    /// Copy a collection subtree below `destination` as `new_name`.
    ///
    /// # Errors
    ///
    /// Returns error if the target exists or lies inside the source.
    fn copy_collection(
        &self,
        txn: &mut Self::Txn,
        collection: &ResourcePath,
        destination: &ResourcePath,
        new_name: &str,
    ) -> Result<CollectionMeta, StoreError>;

    /// Apply a partial permission change and, if given, a new mime type to a
    /// document in one metadata change.
    ///
    /// # Errors
    ///
    /// Returns error if the document is missing.
    fn update_document_metadata(
        &self,
        txn: &mut Self::Txn,
        document: &ResourcePath,
        update: &PermissionUpdate,
        mime_type: Option<&str>,
    ) -> Result<DocumentMeta, StoreError>;

    /// Apply a partial permission change to a collection.
    ///
    /// # Errors
    ///
    /// Returns error if the collection is missing.
    fn update_collection_permission(
        &self,
        txn: &mut Self::Txn,
        collection: &ResourcePath,
        update: &PermissionUpdate,
    ) -> Result<CollectionMeta, StoreError>;
}

/// Errors raised by store primitives.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Target collection does not exist
    #[error("collection not found: {0}")]
    CollectionNotFound(String),
    /// Target document does not exist
    #[error("document not found: {0}")]
    DocumentNotFound(String),
    /// Something already occupies the target path
    #[error("resource already exists: {0}")]
    AlreadyExists(String),
    /// Document has a different storage kind than the primitive expects
    #[error("wrong document kind for {path}: expected {expected:?}")]
    WrongKind {
        /// Document path
        path: String,
        /// Kind the primitive handles
        expected: DocumentKind,
    },
    /// XML validation rejected the content
    #[error("validation failed for {path}: {reason}")]
    Validation {
        /// Target path
        path: String,
        /// Why validation failed
        reason: String,
    },
    /// Relocation target lies inside the source subtree
    #[error("cannot relocate {from} into its own subtree {to}")]
    IntoOwnSubtree {
        /// Source path
        from: String,
        /// Target path
        to: String,
    },
    /// Lock acquisition timed out
    #[error("timed out waiting for lock on {0}")]
    LockTimeout(String),
    /// Invalid path
    #[error(transparent)]
    Path(#[from] PathError),
}
