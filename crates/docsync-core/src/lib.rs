//! # docsync Core
//!
//! Shared vocabulary for replicating a hierarchical document store.
//!
//! This crate provides:
//! - Absolute resource paths and owner/group/mode permissions
//! - The store collaborator interface: transactions, collection locks, lifecycle events
//! - The origin tracker used to break capture-side replication loops
//! - Instance identity and the account/group directory
//! - A mime registry deciding between XML and binary storage
//! - `MemoryStore`, an in-memory transactional store implementing the interface

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod identity;
pub mod lock;
pub mod memory;
pub mod mime;
pub mod origin;
pub mod path;
pub mod permission;
pub mod store;

pub use identity::{Account, Directory, InstanceId, LocalDirectory};
pub use lock::{CollectionGuard, LockMode, LockTable};
pub use memory::{MemoryStore, MemoryStoreOptions, MemoryTxn};
pub use mime::{MimeKind, MimeTable, MimeType};
pub use path::{PathError, ResourcePath};
pub use permission::{Permission, PermissionUpdate};
pub use store::{
    CollectionMeta, DocumentKind, DocumentMeta, DocumentSnapshot, EventContext, StagedDocument,
    Store, StoreError, StoreEvent, StoreObserver, Transaction,
};
