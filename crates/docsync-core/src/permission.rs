//! Owner, group and mode of a stored resource.

use serde::{Deserialize, Serialize};

/// Mode given to collections created without explicit permissions.
pub const DEFAULT_COLLECTION_MODE: u32 = 0o755;

/// Mode given to documents stored without explicit permissions.
pub const DEFAULT_DOCUMENT_MODE: u32 = 0o644;

/// Ownership and access mode of a collection or document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    /// Owning account name
    pub owner: String,
    /// Owning group name
    pub group: String,
    /// Unix-style access mode (e.g. `0o640`)
    pub mode: u32,
}

impl Permission {
    /// Create a permission triple.
    #[must_use]
    pub fn new(owner: impl Into<String>, group: impl Into<String>, mode: u32) -> Self {
        Self {
            owner: owner.into(),
            group: group.into(),
            mode,
        }
    }

    /// Apply a partial update, leaving unspecified fields untouched.
    pub fn apply(&mut self, update: &PermissionUpdate) {
        if let Some(owner) = &update.owner {
            self.owner.clone_from(owner);
        }
        if let Some(group) = &update.group {
            self.group.clone_from(group);
        }
        if let Some(mode) = update.mode {
            self.mode = mode;
        }
    }
}

/// A partial permission change. `None` fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionUpdate {
    /// New owner, if any
    pub owner: Option<String>,
    /// New group, if any
    pub group: Option<String>,
    /// New mode, if any
    pub mode: Option<u32>,
}

impl PermissionUpdate {
    /// Whether the update changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.owner.is_none() && self.group.is_none() && self.mode.is_none()
    }
}

/// Format a mode as a four-digit octal string, e.g. `0640`.
#[must_use]
pub fn format_mode(mode: u32) -> String {
    format!("{mode:04o}")
}

/// Parse an octal mode string such as `0640`, `640` or `0o640`.
#[must_use]
pub fn parse_mode(input: &str) -> Option<u32> {
    let digits = input.trim();
    let digits = digits.strip_prefix("0o").unwrap_or(digits);
    if digits.is_empty() || digits.len() > 5 {
        return None;
    }
    u32::from_str_radix(digits, 8).ok()
}
