//! In-memory transactional store.
//!
//! Entries live in a flat ordered map keyed by path. Every mutation made
//! through a transaction records the entry it replaced, so abort (or dropping
//! an unfinished transaction) restores the previous state exactly. Events are
//! queued per transaction and delivered to observers only after commit.

use crate::identity::{SYSTEM_ACCOUNT, SYSTEM_GROUP};
use crate::lock::{CollectionGuard, LockMode, LockTable, DEFAULT_LOCK_TIMEOUT};
use crate::path::ResourcePath;
use crate::permission::{
    Permission, PermissionUpdate, DEFAULT_COLLECTION_MODE, DEFAULT_DOCUMENT_MODE,
};
use crate::store::{
    CollectionMeta, DocumentKind, DocumentMeta, DocumentSnapshot, EventContext, StagedDocument,
    Store, StoreError, StoreEvent, StoreObserver, Transaction,
};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Collection(CollectionMeta),
    Document(DocumentSnapshot),
}

impl Entry {
    fn relocated(&self, to: ResourcePath) -> Self {
        match self {
            Self::Collection(meta) => Self::Collection(CollectionMeta {
                path: to,
                permission: meta.permission.clone(),
            }),
            Self::Document(doc) => {
                let mut doc = doc.clone();
                doc.meta.path = to;
                Self::Document(doc)
            }
        }
    }
}

type Entries = BTreeMap<ResourcePath, Entry>;
type UndoLog = Vec<(ResourcePath, Option<Entry>)>;

/// Options for a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryStoreOptions {
    /// How long to wait for a collection lock
    pub lock_timeout: Duration,
    /// Whether transactions accept origin tags
    pub origin_tracking: bool,
}

impl Default for MemoryStoreOptions {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            origin_tracking: true,
        }
    }
}

struct Inner {
    entries: Mutex<Entries>,
    locks: LockTable,
    observers: RwLock<Vec<Arc<dyn StoreObserver>>>,
    next_txn: AtomicU64,
    origin_tracking: bool,
}

impl Inner {
    fn rollback(&self, undo: &mut UndoLog) {
        let mut entries = self.entries.lock();
        while let Some((path, previous)) = undo.pop() {
            match previous {
                Some(entry) => {
                    entries.insert(path, entry);
                }
                None => {
                    entries.remove(&path);
                }
            }
        }
    }
}

/// In-memory implementation of [`Store`].
///
/// Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.inner.entries.lock().len())
            .field("origin_tracking", &self.inner.origin_tracking)
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// Create a store holding the root collection and `/db`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(MemoryStoreOptions::default())
    }

    /// Create a store whose transactions reject origin tags.
    #[must_use]
    pub fn without_origin_tracking() -> Self {
        Self::with_options(MemoryStoreOptions {
            origin_tracking: false,
            ..MemoryStoreOptions::default()
        })
    }

    /// Create a store with explicit options.
    #[must_use]
    pub fn with_options(options: MemoryStoreOptions) -> Self {
        let mut entries = Entries::new();
        for path in [ResourcePath::root(), ResourcePath::root_collection()] {
            entries.insert(
                path.clone(),
                Entry::Collection(CollectionMeta {
                    path,
                    permission: default_permission(DEFAULT_COLLECTION_MODE),
                }),
            );
        }

        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(entries),
                locks: LockTable::new(options.lock_timeout),
                observers: RwLock::new(Vec::new()),
                next_txn: AtomicU64::new(1),
                origin_tracking: options.origin_tracking,
            }),
        }
    }

    /// Register an observer for committed events.
    pub fn register_observer(&self, observer: Arc<dyn StoreObserver>) {
        self.inner.observers.write().push(observer);
    }

    /// Committed (or in-flight) document at `path`.
    #[must_use]
    pub fn document_at(&self, path: &ResourcePath) -> Option<DocumentSnapshot> {
        match self.inner.entries.lock().get(path) {
            Some(Entry::Document(doc)) => Some(doc.clone()),
            _ => None,
        }
    }

    /// Collection at `path`.
    #[must_use]
    pub fn collection_at(&self, path: &ResourcePath) -> Option<CollectionMeta> {
        match self.inner.entries.lock().get(path) {
            Some(Entry::Collection(meta)) => Some(meta.clone()),
            _ => None,
        }
    }

    /// All paths currently present, in order.
    #[must_use]
    pub fn paths(&self) -> Vec<ResourcePath> {
        self.inner.entries.lock().keys().cloned().collect()
    }

    fn write_document(
        &self,
        txn: &mut MemoryTxn,
        path: ResourcePath,
        content: Vec<u8>,
        kind: DocumentKind,
        mime_type: &str,
        update: &PermissionUpdate,
    ) -> Result<DocumentMeta, StoreError> {
        let mut entries = self.inner.entries.lock();
        let (parent, _) = path.split_last()?;
        require_collection(&entries, &parent)?;

        let (mut permission, created) = match entries.get(&path) {
            Some(Entry::Collection(_)) => return Err(StoreError::AlreadyExists(path.to_string())),
            Some(Entry::Document(previous)) => (previous.meta.permission.clone(), false),
            None => (default_permission(DEFAULT_DOCUMENT_MODE), true),
        };
        permission.apply(update);

        let snapshot = DocumentSnapshot {
            meta: DocumentMeta {
                path: path.clone(),
                kind,
                mime_type: mime_type.to_string(),
                permission,
                content_length: content.len() as u64,
            },
            content,
        };
        let meta = snapshot.meta.clone();

        set_entry(
            &mut entries,
            &mut txn.undo,
            path,
            Some(Entry::Document(snapshot.clone())),
        );
        txn.events.push(if created {
            StoreEvent::DocumentCreated(snapshot)
        } else {
            StoreEvent::DocumentUpdated(snapshot)
        });

        Ok(meta)
    }

    fn remove_document(
        &self,
        txn: &mut MemoryTxn,
        path: &ResourcePath,
        expected: DocumentKind,
    ) -> Result<(), StoreError> {
        let mut entries = self.inner.entries.lock();
        let doc = require_document(&entries, path)?;
        if doc.meta.kind != expected {
            return Err(StoreError::WrongKind {
                path: path.to_string(),
                expected,
            });
        }

        set_entry(&mut entries, &mut txn.undo, path.clone(), None);
        txn.events
            .push(StoreEvent::DocumentDeleted { path: path.clone() });
        Ok(())
    }

    fn relocate_document(
        &self,
        txn: &mut MemoryTxn,
        source: &ResourcePath,
        destination: &ResourcePath,
        new_name: &str,
        keep_source: bool,
    ) -> Result<DocumentMeta, StoreError> {
        let mut entries = self.inner.entries.lock();
        let doc = require_document(&entries, source)?.clone();
        require_collection(&entries, destination)?;

        let target = destination.join(new_name)?;
        if target == *source {
            return Ok(doc.meta);
        }
        if let Some(Entry::Collection(_)) = entries.get(&target) {
            return Err(StoreError::AlreadyExists(target.to_string()));
        }

        let mut moved = doc;
        moved.meta.path = target.clone();
        let meta = moved.meta.clone();
        if !keep_source {
            set_entry(&mut entries, &mut txn.undo, source.clone(), None);
        }
        set_entry(
            &mut entries,
            &mut txn.undo,
            target.clone(),
            Some(Entry::Document(moved)),
        );

        txn.events.push(if keep_source {
            StoreEvent::DocumentCopied {
                from: source.clone(),
                to: target,
            }
        } else {
            StoreEvent::DocumentMoved {
                from: source.clone(),
                to: target,
            }
        });

        Ok(meta)
    }

    fn relocate_collection(
        &self,
        txn: &mut MemoryTxn,
        source: &ResourcePath,
        destination: &ResourcePath,
        new_name: &str,
        keep_source: bool,
    ) -> Result<CollectionMeta, StoreError> {
        let mut entries = self.inner.entries.lock();
        let source_meta = require_collection(&entries, source)?.clone();
        require_collection(&entries, destination)?;

        let target = destination.join(new_name)?;
        if target == *source && !keep_source {
            return Ok(source_meta);
        }
        if target == *source || target.is_descendant_of(source) {
            return Err(StoreError::IntoOwnSubtree {
                from: source.to_string(),
                to: target.to_string(),
            });
        }
        if entries.contains_key(&target) {
            return Err(StoreError::AlreadyExists(target.to_string()));
        }

        let subtree: Vec<(ResourcePath, Entry)> = entries
            .iter()
            .filter(|(path, _)| *path == source || path.is_descendant_of(source))
            .map(|(path, entry)| (path.clone(), entry.clone()))
            .collect();

        for (path, entry) in subtree {
            let Some(new_path) = path.rebase(source, &target) else {
                continue;
            };
            if !keep_source {
                set_entry(&mut entries, &mut txn.undo, path, None);
            }
            let relocated = entry.relocated(new_path.clone());
            set_entry(&mut entries, &mut txn.undo, new_path, Some(relocated));
        }

        txn.events.push(if keep_source {
            StoreEvent::CollectionCopied {
                from: source.clone(),
                to: target.clone(),
            }
        } else {
            StoreEvent::CollectionMoved {
                from: source.clone(),
                to: target.clone(),
            }
        });

        Ok(CollectionMeta {
            path: target,
            permission: source_meta.permission,
        })
    }
}

fn default_permission(mode: u32) -> Permission {
    Permission::new(SYSTEM_ACCOUNT, SYSTEM_GROUP, mode)
}

fn set_entry(entries: &mut Entries, undo: &mut UndoLog, path: ResourcePath, value: Option<Entry>) {
    let previous = match value {
        Some(entry) => entries.insert(path.clone(), entry),
        None => entries.remove(&path),
    };
    undo.push((path, previous));
}

fn require_collection<'a>(
    entries: &'a Entries,
    path: &ResourcePath,
) -> Result<&'a CollectionMeta, StoreError> {
    match entries.get(path) {
        Some(Entry::Collection(meta)) => Ok(meta),
        _ => Err(StoreError::CollectionNotFound(path.to_string())),
    }
}

fn require_document<'a>(
    entries: &'a Entries,
    path: &ResourcePath,
) -> Result<&'a DocumentSnapshot, StoreError> {
    match entries.get(path) {
        Some(Entry::Document(doc)) => Ok(doc),
        _ => Err(StoreError::DocumentNotFound(path.to_string())),
    }
}

fn check_well_formed(path: &ResourcePath, content: &[u8]) -> Result<(), StoreError> {
    let invalid = |reason: &str| StoreError::Validation {
        path: path.to_string(),
        reason: reason.to_string(),
    };
    let text = std::str::from_utf8(content).map_err(|_| invalid("content is not UTF-8"))?;
    let text = text.trim_start_matches('\u{feff}').trim();
    if text.is_empty() {
        return Err(invalid("document is empty"));
    }
    if !text.starts_with('<') || !text.ends_with('>') {
        return Err(invalid("no root element"));
    }
    Ok(())
}

/// Transaction of a [`MemoryStore`].
///
/// Dropping it without commit or abort rolls its changes back.
pub struct MemoryTxn {
    id: u64,
    origin: Option<String>,
    origin_tracking: bool,
    undo: UndoLog,
    events: Vec<StoreEvent>,
    inner: Arc<Inner>,
    finished: bool,
}

impl MemoryTxn {
    /// Events queued so far.
    #[must_use]
    pub fn pending_events(&self) -> &[StoreEvent] {
        &self.events
    }
}

impl std::fmt::Debug for MemoryTxn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTxn")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("changes", &self.undo.len())
            .finish_non_exhaustive()
    }
}

impl Transaction for MemoryTxn {
    fn id(&self) -> u64 {
        self.id
    }

    fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    fn set_origin(&mut self, origin: &str) -> bool {
        if !self.origin_tracking {
            return false;
        }
        self.origin = Some(origin.to_string());
        true
    }
}

impl Drop for MemoryTxn {
    fn drop(&mut self) {
        if !self.finished && !self.undo.is_empty() {
            tracing::warn!(
                txn_id = self.id,
                changes = self.undo.len(),
                "Transaction dropped without commit, rolling back"
            );
            self.inner.rollback(&mut self.undo);
        }
    }
}

impl Store for MemoryStore {
    type Txn = MemoryTxn;

    fn begin(&self) -> MemoryTxn {
        let id = self.inner.next_txn.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(txn_id = id, "Begin transaction");
        MemoryTxn {
            id,
            origin: None,
            origin_tracking: self.inner.origin_tracking,
            undo: Vec::new(),
            events: Vec::new(),
            inner: Arc::clone(&self.inner),
            finished: false,
        }
    }

    fn commit(&self, mut txn: MemoryTxn) -> Result<(), StoreError> {
        txn.finished = true;
        txn.undo.clear();
        let events = std::mem::take(&mut txn.events);

        tracing::debug!(
            txn_id = txn.id,
            origin = ?txn.origin,
            events = events.len(),
            "Committed transaction"
        );

        let observers = self.inner.observers.read().clone();
        let context = EventContext {
            transaction_id: txn.id,
            origin: txn.origin.as_deref(),
            origin_tracking: txn.origin_tracking,
        };
        for event in &events {
            for observer in &observers {
                observer.on_event(&context, event);
            }
        }

        Ok(())
    }

    fn abort(&self, mut txn: MemoryTxn) {
        tracing::debug!(
            txn_id = txn.id,
            changes = txn.undo.len(),
            "Aborted transaction"
        );
        self.inner.rollback(&mut txn.undo);
        txn.events.clear();
        txn.finished = true;
    }

    fn open_collection(
        &self,
        path: &ResourcePath,
        mode: LockMode,
    ) -> Result<Option<CollectionGuard>, StoreError> {
        let lock = self.inner.locks.acquire(path, mode)?;
        let meta = match self.inner.entries.lock().get(path) {
            Some(Entry::Collection(meta)) => meta.clone(),
            _ => return Ok(None),
        };
        Ok(Some(CollectionGuard::new(meta, lock)))
    }

    fn document(
        &self,
        _txn: &MemoryTxn,
        collection: &ResourcePath,
        name: &str,
    ) -> Result<Option<DocumentMeta>, StoreError> {
        let path = collection.join(name)?;
        match self.inner.entries.lock().get(&path) {
            Some(Entry::Document(doc)) => Ok(Some(doc.meta.clone())),
            _ => Ok(None),
        }
    }

    fn get_or_create_collection(
        &self,
        txn: &mut MemoryTxn,
        path: &ResourcePath,
        permission: &PermissionUpdate,
    ) -> Result<CollectionMeta, StoreError> {
        let mut entries = self.inner.entries.lock();
        let mut current = ResourcePath::root();
        let mut meta = require_collection(&entries, &current)?.clone();

        for segment in path.segments() {
            current = current.join(segment)?;
            meta = match entries.get(&current) {
                Some(Entry::Collection(existing)) => existing.clone(),
                Some(Entry::Document(_)) => {
                    return Err(StoreError::AlreadyExists(current.to_string()))
                }
                None => {
                    let mut created = CollectionMeta {
                        path: current.clone(),
                        permission: default_permission(DEFAULT_COLLECTION_MODE),
                    };
                    created.permission.apply(permission);
                    set_entry(
                        &mut entries,
                        &mut txn.undo,
                        current.clone(),
                        Some(Entry::Collection(created.clone())),
                    );
                    txn.events
                        .push(StoreEvent::CollectionCreated(created.clone()));
                    created
                }
            };
        }

        Ok(meta)
    }

    fn validate_xml(
        &self,
        _txn: &mut MemoryTxn,
        collection: &ResourcePath,
        name: &str,
        content: &[u8],
    ) -> Result<StagedDocument, StoreError> {
        let path = collection.join(name)?;
        {
            let entries = self.inner.entries.lock();
            require_collection(&entries, collection)?;
            if let Some(Entry::Collection(_)) = entries.get(&path) {
                return Err(StoreError::AlreadyExists(path.to_string()));
            }
        }
        check_well_formed(&path, content)?;
        Ok(StagedDocument {
            path,
            content: content.to_vec(),
        })
    }

    fn store_xml(
        &self,
        txn: &mut MemoryTxn,
        staged: StagedDocument,
        mime_type: &str,
        permission: &PermissionUpdate,
    ) -> Result<DocumentMeta, StoreError> {
        self.write_document(
            txn,
            staged.path,
            staged.content,
            DocumentKind::Xml,
            mime_type,
            permission,
        )
    }

    fn store_binary(
        &self,
        txn: &mut MemoryTxn,
        collection: &ResourcePath,
        name: &str,
        content: &[u8],
        mime_type: &str,
        permission: &PermissionUpdate,
    ) -> Result<DocumentMeta, StoreError> {
        let path = collection.join(name)?;
        self.write_document(
            txn,
            path,
            content.to_vec(),
            DocumentKind::Binary,
            mime_type,
            permission,
        )
    }

    fn remove_xml(&self, txn: &mut MemoryTxn, document: &ResourcePath) -> Result<(), StoreError> {
        self.remove_document(txn, document, DocumentKind::Xml)
    }

    fn remove_binary(
        &self,
        txn: &mut MemoryTxn,
        document: &ResourcePath,
    ) -> Result<(), StoreError> {
        self.remove_document(txn, document, DocumentKind::Binary)
    }

    fn move_document(
        &self,
        txn: &mut MemoryTxn,
        document: &ResourcePath,
        destination: &ResourcePath,
        new_name: &str,
    ) -> Result<DocumentMeta, StoreError> {
        self.relocate_document(txn, document, destination, new_name, false)
    }

    fn copy_document(
        &self,
        txn: &mut MemoryTxn,
        document: &ResourcePath,
        destination: &ResourcePath,
        new_name: &str,
    ) -> Result<DocumentMeta, StoreError> {
        self.relocate_document(txn, document, destination, new_name, true)
    }

    fn remove_collection(
        &self,
        txn: &mut MemoryTxn,
        collection: &ResourcePath,
    ) -> Result<(), StoreError> {
        let mut entries = self.inner.entries.lock();
        require_collection(&entries, collection)?;

        let doomed: Vec<ResourcePath> = entries
            .keys()
            .filter(|path| *path == collection || path.is_descendant_of(collection))
            .cloned()
            .collect();
        for path in doomed {
            set_entry(&mut entries, &mut txn.undo, path, None);
        }

        txn.events.push(StoreEvent::CollectionDeleted {
            path: collection.clone(),
        });
        Ok(())
    }

    fn move_collection(
        &self,
        txn: &mut MemoryTxn,
        collection: &ResourcePath,
        destination: &ResourcePath,
        new_name: &str,
    ) -> Result<CollectionMeta, StoreError> {
        self.relocate_collection(txn, collection, destination, new_name, false)
    }

    fn copy_collection(
        &self,
        txn: &mut MemoryTxn,
        collection: &ResourcePath,
        destination: &ResourcePath,
        new_name: &str,
    ) -> Result<CollectionMeta, StoreError> {
        self.relocate_collection(txn, collection, destination, new_name, true)
    }

    fn update_document_metadata(
        &self,
        txn: &mut MemoryTxn,
        document: &ResourcePath,
        update: &PermissionUpdate,
        mime_type: Option<&str>,
    ) -> Result<DocumentMeta, StoreError> {
        let mut entries = self.inner.entries.lock();
        let mut doc = require_document(&entries, document)?.clone();
        doc.meta.permission.apply(update);
        if let Some(mime_type) = mime_type {
            doc.meta.mime_type = mime_type.to_string();
        }
        let meta = doc.meta.clone();

        set_entry(
            &mut entries,
            &mut txn.undo,
            document.clone(),
            Some(Entry::Document(doc)),
        );
        txn.events
            .push(StoreEvent::DocumentMetadataUpdated(meta.clone()));
        Ok(meta)
    }

    fn update_collection_permission(
        &self,
        txn: &mut MemoryTxn,
        collection: &ResourcePath,
        update: &PermissionUpdate,
    ) -> Result<CollectionMeta, StoreError> {
        let mut entries = self.inner.entries.lock();
        let mut meta = require_collection(&entries, collection)?.clone();
        meta.permission.apply(update);

        set_entry(
            &mut entries,
            &mut txn.undo,
            collection.clone(),
            Some(Entry::Collection(meta.clone())),
        );
        txn.events
            .push(StoreEvent::CollectionMetadataUpdated(meta.clone()));
        Ok(meta)
    }
}
