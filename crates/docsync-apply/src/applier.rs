//! Change applier.
//!
//! Each message is replayed inside one store transaction tagged with
//! [`APPLIER_ORIGIN`], so capture on this instance does not republish it.
//! Collections are locked source first, destination second, and released in
//! the reverse order once the transaction has committed or aborted.
//!
//! A missing target is not an error: the transaction aborts and the message
//! reports [`ApplyOutcome::Skipped`] so it can be acknowledged and counted
//! apart from real failures.

use crate::reconcile::{ReconcileError, Reconciler};
use crate::report::ApplyReport;
use docsync_core::origin::APPLIER_ORIGIN;
use docsync_core::{
    CollectionGuard, CollectionMeta, Directory, DocumentKind, InstanceId, LockMode, MimeTable,
    PathError, PermissionUpdate, ResourcePath, Store, StoreError, Transaction,
};
use docsync_proto::codec::{self, CodecError};
use docsync_proto::{ChangeMessage, Envelope, MessageError, Operation, ResourceType};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Result of handling one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The change was committed
    Applied,
    /// Nothing to do; the transaction was aborted
    Skipped(SkipReason),
    /// The message was published by this instance and discarded
    SelfOrigin,
}

impl ApplyOutcome {
    /// Short label for logs and the journal.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Skipped(_) => "skipped",
            Self::SelfOrigin => "self_origin",
        }
    }
}

/// Why a message was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A collection the change needs does not exist
    MissingCollection,
    /// The document the change targets does not exist
    MissingDocument,
    /// The collection to create already exists
    CollectionExists,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MissingCollection => "missing collection",
            Self::MissingDocument => "missing document",
            Self::CollectionExists => "collection exists",
        })
    }
}

type Handler<S, D> = fn(&ChangeApplier<S, D>, &ChangeMessage) -> Result<ApplyOutcome, ApplyError>;

/// Replays change messages against a store.
pub struct ChangeApplier<S, D> {
    store: Arc<S>,
    reconciler: Reconciler<D>,
    instance: InstanceId,
    report: ApplyReport,
}

impl<S: Store, D: Directory> ChangeApplier<S, D> {
    /// Create an applier using the default mime table.
    #[must_use]
    pub fn new(store: Arc<S>, directory: Arc<D>, instance: InstanceId) -> Self {
        Self::with_mime_table(store, directory, instance, MimeTable::default())
    }

    /// Create an applier with an explicit mime table.
    #[must_use]
    pub fn with_mime_table(
        store: Arc<S>,
        directory: Arc<D>,
        instance: InstanceId,
        mimes: MimeTable,
    ) -> Self {
        Self {
            store,
            reconciler: Reconciler::new(directory, mimes),
            instance,
            report: ApplyReport::default(),
        }
    }

    /// The local store.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The local instance id.
    #[must_use]
    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    /// Counters for messages handled so far.
    #[must_use]
    pub fn report(&self) -> &ApplyReport {
        &self.report
    }

    /// Convert and apply a transport envelope.
    ///
    /// # Errors
    ///
    /// Returns error if the envelope is not a valid change message or the
    /// change cannot be applied.
    pub fn handle_envelope(&self, envelope: &Envelope) -> Result<ApplyOutcome, ApplyError> {
        let started = Instant::now();
        let result = ChangeMessage::from_envelope(envelope)
            .map_err(ApplyError::from)
            .and_then(|message| self.dispatch(&message));
        self.finish(&result, started);
        result
    }

    /// Apply a change message.
    ///
    /// # Errors
    ///
    /// Returns error if the change cannot be applied. Absent targets are not
    /// errors.
    pub fn apply(&self, message: &ChangeMessage) -> Result<ApplyOutcome, ApplyError> {
        let started = Instant::now();
        let result = self.dispatch(message);
        self.finish(&result, started);
        result
    }

    fn finish(&self, result: &Result<ApplyOutcome, ApplyError>, started: Instant) {
        if let Err(err) = result {
            tracing::warn!(error = %err, "Failed to apply change");
        }
        self.report.record(result, started.elapsed());
    }

    fn dispatch(&self, message: &ChangeMessage) -> Result<ApplyOutcome, ApplyError> {
        if message.sender() == Some(self.instance.as_str()) {
            tracing::debug!(
                resource_type = %message.resource_type,
                operation = %message.operation,
                path = %message.source_path,
                "Discarding change published by this instance"
            );
            return Ok(ApplyOutcome::SelfOrigin);
        }

        message.validate()?;
        let handler = Self::handler(message.resource_type, message.operation);
        let outcome = handler(self, message)?;

        tracing::debug!(
            resource_type = %message.resource_type,
            operation = %message.operation,
            path = %message.source_path,
            sender = ?message.sender(),
            outcome = outcome.as_str(),
            "Handled change"
        );
        Ok(outcome)
    }

    fn handler(resource_type: ResourceType, operation: Operation) -> Handler<S, D> {
        match (resource_type, operation) {
            (ResourceType::Document, Operation::Create | Operation::Update) => Self::store_document,
            (ResourceType::Document, Operation::Metadata) => Self::update_document_metadata,
            (ResourceType::Document, Operation::Delete) => Self::delete_document,
            (ResourceType::Document, Operation::Move) => Self::move_document,
            (ResourceType::Document, Operation::Copy) => Self::copy_document,
            (ResourceType::Collection, Operation::Create | Operation::Update) => {
                Self::create_collection
            }
            (ResourceType::Collection, Operation::Metadata) => Self::update_collection_metadata,
            (ResourceType::Collection, Operation::Delete) => Self::delete_collection,
            (ResourceType::Collection, Operation::Move) => Self::move_collection,
            (ResourceType::Collection, Operation::Copy) => Self::copy_collection,
        }
    }

    /// Run `body` in a tagged transaction. `Applied` commits; anything else aborts.
    fn transact<F>(&self, body: F) -> Result<ApplyOutcome, ApplyError>
    where
        F: FnOnce(&mut S::Txn, &mut LockSet) -> Result<ApplyOutcome, ApplyError>,
    {
        let mut locks = LockSet::default();
        let mut txn = self.store.begin();
        let txn_id = txn.id();
        if !txn.set_origin(APPLIER_ORIGIN) {
            tracing::debug!(txn_id, "Store does not track origins, capture will not be suppressed");
        }

        let result = match body(&mut txn, &mut locks) {
            Ok(ApplyOutcome::Applied) => self
                .store
                .commit(txn)
                .map(|()| ApplyOutcome::Applied)
                .map_err(ApplyError::from),
            Ok(outcome) => {
                self.store.abort(txn);
                Ok(outcome)
            }
            Err(err) => {
                tracing::debug!(txn_id, error = %err, "Aborting transaction");
                self.store.abort(txn);
                Err(err)
            }
        };

        let released = locks.release();
        tracing::trace!(txn_id, ?released, "Released collection locks");
        result
    }

    fn store_document(&self, message: &ChangeMessage) -> Result<ApplyOutcome, ApplyError> {
        let path = parse_path(&message.source_path)?;
        let (collection, name) = path.split_last()?;
        let payload = message
            .payload
            .as_deref()
            .ok_or_else(|| ApplyError::MissingPayload {
                path: path.to_string(),
            })?;
        let content = codec::decode_body(message.content_encoding(), payload)?;
        let mime = self.reconciler.mime_type(&message.metadata, &path)?;
        let update = self.reconciler.permission_update(&message.metadata);
        let store = &*self.store;

        self.transact(|txn, locks| {
            if locks.open(store, &collection, LockMode::Write)?.is_none() {
                let inherited = PermissionUpdate {
                    owner: update.owner.clone(),
                    group: update.group.clone(),
                    mode: None,
                };
                store.get_or_create_collection(txn, &collection, &inherited)?;
                tracing::info!(collection = %collection, "Created missing parent collection");

                if locks.open(store, &collection, LockMode::Write)?.is_none() {
                    return Err(StoreError::CollectionNotFound(collection.to_string()).into());
                }
            }

            if mime.is_xml() {
                let staged = store.validate_xml(txn, &collection, name, &content)?;
                store.store_xml(txn, staged, &mime.name, &update)?;
            } else {
                store.store_binary(txn, &collection, name, &content, &mime.name, &update)?;
            }
            Ok(ApplyOutcome::Applied)
        })
    }

    fn update_document_metadata(&self, message: &ChangeMessage) -> Result<ApplyOutcome, ApplyError> {
        let path = parse_path(&message.source_path)?;
        let (collection, name) = path.split_last()?;
        let update = self.reconciler.permission_update(&message.metadata);
        let mime = self
            .reconciler
            .declared_mime_type(&message.metadata, &path)?;
        let store = &*self.store;

        self.transact(|txn, locks| {
            if locks.open(store, &collection, LockMode::Write)?.is_none() {
                return Ok(skip(SkipReason::MissingCollection, &collection));
            }
            if store.document(txn, &collection, name)?.is_none() {
                return Ok(skip(SkipReason::MissingDocument, &path));
            }

            if !update.is_empty() || mime.is_some() {
                let mime_type = mime.as_ref().map(|mime| mime.name.as_str());
                store.update_document_metadata(txn, &path, &update, mime_type)?;
            }
            Ok(ApplyOutcome::Applied)
        })
    }

    fn delete_document(&self, message: &ChangeMessage) -> Result<ApplyOutcome, ApplyError> {
        let path = parse_path(&message.source_path)?;
        let (collection, name) = path.split_last()?;
        let store = &*self.store;

        self.transact(|txn, locks| {
            if locks.open(store, &collection, LockMode::Write)?.is_none() {
                return Ok(skip(SkipReason::MissingCollection, &collection));
            }
            let Some(document) = store.document(txn, &collection, name)? else {
                return Ok(skip(SkipReason::MissingDocument, &path));
            };

            match document.kind {
                DocumentKind::Xml => store.remove_xml(txn, &path)?,
                DocumentKind::Binary => store.remove_binary(txn, &path)?,
            }
            Ok(ApplyOutcome::Applied)
        })
    }

    fn move_document(&self, message: &ChangeMessage) -> Result<ApplyOutcome, ApplyError> {
        self.relocate_document(message, false)
    }

    fn copy_document(&self, message: &ChangeMessage) -> Result<ApplyOutcome, ApplyError> {
        self.relocate_document(message, true)
    }

    fn relocate_document(
        &self,
        message: &ChangeMessage,
        keep_source: bool,
    ) -> Result<ApplyOutcome, ApplyError> {
        let source = parse_path(&message.source_path)?;
        let destination = parse_path(destination_of(message)?)?;
        let (source_collection, name) = source.split_last()?;
        let (target_collection, new_name) = destination.split_last()?;
        // A copy only reads its source, unless source and target share a collection.
        let source_mode = if keep_source && source_collection != target_collection {
            LockMode::Read
        } else {
            LockMode::Write
        };
        let store = &*self.store;

        self.transact(|txn, locks| {
            if locks.open(store, &source_collection, source_mode)?.is_none() {
                return Ok(skip(SkipReason::MissingCollection, &source_collection));
            }
            if locks.open(store, &target_collection, LockMode::Write)?.is_none() {
                return Ok(skip(SkipReason::MissingCollection, &target_collection));
            }
            if store.document(txn, &source_collection, name)?.is_none() {
                return Ok(skip(SkipReason::MissingDocument, &source));
            }

            if keep_source {
                store.copy_document(txn, &source, &target_collection, new_name)?;
            } else {
                store.move_document(txn, &source, &target_collection, new_name)?;
            }
            Ok(ApplyOutcome::Applied)
        })
    }

    fn create_collection(&self, message: &ChangeMessage) -> Result<ApplyOutcome, ApplyError> {
        let path = parse_path(&message.source_path)?;
        let update = self.reconciler.permission_update(&message.metadata);
        let store = &*self.store;

        self.transact(|txn, locks| {
            if locks.open(store, &path, LockMode::Write)?.is_some() {
                return Ok(skip(SkipReason::CollectionExists, &path));
            }

            store.get_or_create_collection(txn, &path, &update)?;
            Ok(ApplyOutcome::Applied)
        })
    }

    fn update_collection_metadata(
        &self,
        message: &ChangeMessage,
    ) -> Result<ApplyOutcome, ApplyError> {
        let path = parse_path(&message.source_path)?;
        let update = self.reconciler.permission_update(&message.metadata);
        let store = &*self.store;

        self.transact(|txn, locks| {
            if locks.open(store, &path, LockMode::Write)?.is_none() {
                return Ok(skip(SkipReason::MissingCollection, &path));
            }
            if !update.is_empty() {
                store.update_collection_permission(txn, &path, &update)?;
            }
            Ok(ApplyOutcome::Applied)
        })
    }

    fn delete_collection(&self, message: &ChangeMessage) -> Result<ApplyOutcome, ApplyError> {
        let path = parse_path(&message.source_path)?;
        let store = &*self.store;

        self.transact(|txn, locks| {
            if locks.open(store, &path, LockMode::Write)?.is_none() {
                return Ok(skip(SkipReason::MissingCollection, &path));
            }
            store.remove_collection(txn, &path)?;
            Ok(ApplyOutcome::Applied)
        })
    }

    fn move_collection(&self, message: &ChangeMessage) -> Result<ApplyOutcome, ApplyError> {
        self.relocate_collection(message, false)
    }

    fn copy_collection(&self, message: &ChangeMessage) -> Result<ApplyOutcome, ApplyError> {
        self.relocate_collection(message, true)
    }

    fn relocate_collection(
        &self,
        message: &ChangeMessage,
        keep_source: bool,
    ) -> Result<ApplyOutcome, ApplyError> {
        let source = parse_path(&message.source_path)?;
        let destination = parse_path(destination_of(message)?)?;
        let (target_parent, new_name) = destination.split_last()?;
        let store = &*self.store;

        self.transact(|txn, locks| {
            if locks.open(store, &source, LockMode::Write)?.is_none() {
                return Ok(skip(SkipReason::MissingCollection, &source));
            }
            if locks.open(store, &target_parent, LockMode::Write)?.is_none() {
                return Ok(skip(SkipReason::MissingCollection, &target_parent));
            }

            if keep_source {
                store.copy_collection(txn, &source, &target_parent, new_name)?;
            } else {
                store.move_collection(txn, &source, &target_parent, new_name)?;
            }
            Ok(ApplyOutcome::Applied)
        })
    }
}

fn parse_path(raw: &str) -> Result<ResourcePath, ApplyError> {
    Ok(ResourcePath::parse(raw)?)
}

fn destination_of(message: &ChangeMessage) -> Result<&str, ApplyError> {
    message
        .destination_path
        .as_deref()
        .ok_or(ApplyError::Message(MessageError::MissingDestination(
            message.operation,
        )))
}

fn skip(reason: SkipReason, path: &ResourcePath) -> ApplyOutcome {
    tracing::info!(%reason, path = %path, "Target state already reached, aborting change");
    ApplyOutcome::Skipped(reason)
}

/// Collection locks held for one apply, released in reverse order on drop.
#[derive(Debug, Default)]
struct LockSet {
    guards: Vec<CollectionGuard>,
}

impl LockSet {
    /// Lock a collection, or reuse a lock this set already holds on it.
    ///
    /// Returns `None` if the collection does not exist.
    fn open<S: Store>(
        &mut self,
        store: &S,
        path: &ResourcePath,
        mode: LockMode,
    ) -> Result<Option<CollectionMeta>, ApplyError> {
        if let Some(held) = self.guards.iter().find(|guard| guard.path() == path) {
            if held.mode().covers(mode) {
                return Ok(Some(held.meta().clone()));
            }
            return Err(ApplyError::LockUpgrade(path.to_string()));
        }

        match store.open_collection(path, mode)? {
            Some(guard) => {
                let meta = guard.meta().clone();
                self.guards.push(guard);
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }
}

impl LockSet {
    /// Release every held lock, last acquired first, returning the paths in
    /// release order.
    fn release(&mut self) -> Vec<ResourcePath> {
        let mut released = Vec::with_capacity(self.guards.len());
        while let Some(guard) = self.guards.pop() {
            released.push(guard.path().clone());
            drop(guard);
        }
        released
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        self.release();
    }
}

/// Errors from applying a change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    /// Message conversion or validation failed
    #[error("invalid change message: {0}")]
    Message(#[from] MessageError),
    /// A path in the message is malformed
    #[error("invalid path: {0}")]
    Path(#[from] PathError),
    /// The payload could not be decoded
    #[error("payload decoding failed: {0}")]
    Codec(#[from] CodecError),
    /// Metadata could not be reconciled
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    /// The store rejected the change
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// A document create or update arrived without content
    #[error("no payload for document {path}")]
    MissingPayload {
        /// Document path
        path: String,
    },
    /// A held read lock would need upgrading to write
    #[error("cannot upgrade read lock on {0}")]
    LockUpgrade(String),
}
