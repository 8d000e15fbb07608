//! Identity and permission reconciliation.
//!
//! Owner and group names travel as plain strings and may not exist on the
//! receiving instance. Unknown names fall back to the system principal so an
//! apply never fails on identity alone. A mime type that cannot be resolved
//! is the one hard failure: without it the document cannot be stored.

use docsync_core::permission::parse_mode;
use docsync_core::{Directory, MimeTable, MimeType, PermissionUpdate, ResourcePath};
use docsync_proto::{keys, Metadata};
use serde_json::Value;
use std::sync::Arc;

/// Resolves message metadata against the local directory and mime table.
pub struct Reconciler<D: ?Sized> {
    directory: Arc<D>,
    mimes: MimeTable,
}

impl<D: Directory + ?Sized> Reconciler<D> {
    /// Create a reconciler.
    #[must_use]
    pub fn new(directory: Arc<D>, mimes: MimeTable) -> Self {
        Self { directory, mimes }
    }

    /// The mime table in use.
    #[must_use]
    pub fn mimes(&self) -> &MimeTable {
        &self.mimes
    }

    /// Owner to apply, `None` if the message names none.
    #[must_use]
    pub fn owner(&self, metadata: &Metadata) -> Option<String> {
        let name = string_field(metadata, keys::OWNER)?;
        if let Some(account) = self.directory.account(name) {
            return Some(account.name);
        }
        let system = self.directory.system_account();
        tracing::warn!(
            owner = name,
            fallback = %system.name,
            "Unknown owner, using system account"
        );
        Some(system.name)
    }

    /// Group to apply, `None` if the message names none.
    #[must_use]
    pub fn group(&self, metadata: &Metadata) -> Option<String> {
        let name = string_field(metadata, keys::GROUP)?;
        if let Some(group) = self.directory.group(name) {
            return Some(group);
        }
        let system = self.directory.system_account();
        tracing::warn!(
            group = name,
            fallback = %system.default_group,
            "Unknown group, using system default group"
        );
        Some(system.default_group)
    }

    /// Mode to apply, `None` if absent or unreadable.
    #[must_use]
    pub fn mode(&self, metadata: &Metadata) -> Option<u32> {
        let mode = match metadata.get(keys::MODE)? {
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(s) => parse_mode(s),
            _ => None,
        };
        if mode.is_none() {
            tracing::warn!(value = ?metadata.get(keys::MODE), "Ignoring unreadable mode");
        }
        mode
    }

    /// Owner, group and mode as a partial update.
    #[must_use]
    pub fn permission_update(&self, metadata: &Metadata) -> PermissionUpdate {
        PermissionUpdate {
            owner: self.owner(metadata),
            group: self.group(metadata),
            mode: self.mode(metadata),
        }
    }

    /// Mime type for a document: the declared type if registered, else by
    /// file extension.
    ///
    /// # Errors
    ///
    /// Returns error if neither resolves.
    pub fn mime_type(
        &self,
        metadata: &Metadata,
        path: &ResourcePath,
    ) -> Result<MimeType, ReconcileError> {
        let declared = string_field(metadata, keys::MIME_TYPE);
        if let Some(mime) = declared.and_then(|name| self.mimes.lookup(name)) {
            return Ok(mime.clone());
        }
        if let Some(mime) = self.mimes.for_path(path) {
            if let Some(name) = declared {
                tracing::debug!(
                    declared = name,
                    resolved = %mime.name,
                    path = %path,
                    "Declared mime type unknown, resolved by file name"
                );
            }
            return Ok(mime.clone());
        }
        Err(ReconcileError::UnresolvedMimeType {
            path: path.to_string(),
            declared: declared.map(str::to_string),
        })
    }

    /// Mime type to apply on a metadata update, `None` if the message
    /// declares none.
    ///
    /// # Errors
    ///
    /// Returns error if a type is declared but cannot be resolved.
    pub fn declared_mime_type(
        &self,
        metadata: &Metadata,
        path: &ResourcePath,
    ) -> Result<Option<MimeType>, ReconcileError> {
        if !metadata.contains_key(keys::MIME_TYPE) {
            return Ok(None);
        }
        self.mime_type(metadata, path).map(Some)
    }
}

fn string_field<'a>(metadata: &'a Metadata, key: &str) -> Option<&'a str> {
    metadata.get(key).and_then(Value::as_str)
}

/// Errors from reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    /// No mime type could be determined for a document
    #[error("cannot determine mime type of {path} (declared: {declared:?})")]
    UnresolvedMimeType {
        /// Document path
        path: String,
        /// Declared type, if any
        declared: Option<String>,
    },
}
