//! Instance identity and the account/group directory.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use uuid::Uuid;

/// Name of the built-in system account.
pub const SYSTEM_ACCOUNT: &str = "SYSTEM";

/// Default group of the built-in system account.
pub const SYSTEM_GROUP: &str = "dba";

/// Unique identity of one replicating instance.
///
/// Compared against the `sender-instance-id` of inbound messages so an
/// instance never re-applies what it published itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identity.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<Uuid> for InstanceId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A local account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account name
    pub name: String,
    /// Group assigned when none is given
    pub default_group: String,
}

impl Account {
    /// Create an account.
    #[must_use]
    pub fn new(name: impl Into<String>, default_group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_group: default_group.into(),
        }
    }
}

/// Lookup service for accounts and groups, keyed by name.
pub trait Directory: Send + Sync {
    /// Find an account by name.
    fn account(&self, name: &str) -> Option<Account>;

    /// Find a group by name.
    fn group(&self, name: &str) -> Option<String>;

    /// The system account, which always resolves.
    fn system_account(&self) -> Account;
}

/// In-memory [`Directory`].
#[derive(Debug, Clone)]
pub struct LocalDirectory {
    system: Account,
    accounts: HashMap<String, Account>,
    groups: HashSet<String>,
}

impl Default for LocalDirectory {
    fn default() -> Self {
        Self::new(Account::new(SYSTEM_ACCOUNT, SYSTEM_GROUP))
    }
}

impl LocalDirectory {
    /// Create a directory holding only the given system account.
    #[must_use]
    pub fn new(system: Account) -> Self {
        let mut directory = Self {
            system: system.clone(),
            accounts: HashMap::new(),
            groups: HashSet::new(),
        };
        directory.add_account(system);
        directory
    }

    /// Register an account; its default group is registered too.
    pub fn add_account(&mut self, account: Account) {
        self.groups.insert(account.default_group.clone());
        self.accounts.insert(account.name.clone(), account);
    }

    /// Register a group.
    pub fn add_group(&mut self, name: impl Into<String>) {
        self.groups.insert(name.into());
    }

    /// Builder-style [`add_account`](Self::add_account).
    #[must_use]
    pub fn with_account(mut self, name: &str, default_group: &str) -> Self {
        self.add_account(Account::new(name, default_group));
        self
    }

    /// Builder-style [`add_group`](Self::add_group).
    #[must_use]
    pub fn with_group(mut self, name: &str) -> Self {
        self.add_group(name);
        self
    }
}

impl Directory for LocalDirectory {
    fn account(&self, name: &str) -> Option<Account> {
        self.accounts.get(name).cloned()
    }

    fn group(&self, name: &str) -> Option<String> {
        self.groups.get(name).cloned()
    }

    fn system_account(&self) -> Account {
        self.system.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_account_always_present() {
        let directory = LocalDirectory::default();
        assert_eq!(directory.system_account().name, SYSTEM_ACCOUNT);
        assert!(directory.account(SYSTEM_ACCOUNT).is_some());
        assert_eq!(directory.group(SYSTEM_GROUP).as_deref(), Some(SYSTEM_GROUP));
    }

    #[test]
    fn accounts_register_their_group() {
        let directory = LocalDirectory::default()
            .with_account("alice", "staff")
            .with_group("editors");
        assert_eq!(directory.account("alice").unwrap().default_group, "staff");
        assert!(directory.group("staff").is_some());
        assert!(directory.group("editors").is_some());
        assert!(directory.group("nobody").is_none());
        assert!(directory.account("bob").is_none());
    }

    #[test]
    fn generated_ids_differ() {
        assert_ne!(InstanceId::generate(), InstanceId::generate());
    }
}
