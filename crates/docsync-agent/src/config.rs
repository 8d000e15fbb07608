//! Agent configuration.

use anyhow::{Context, Result};
use docsync_core::{Account, LocalDirectory};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Instance identifier; generated when absent
    pub instance_id: Option<String>,

    /// Replication configuration
    pub replication: ReplicationConfig,

    /// Local store configuration
    pub store: StoreConfig,

    /// Apply journal configuration
    pub journal: JournalConfig,

    /// Accounts and groups known locally
    pub directory: DirectoryConfig,
}

/// Replication configuration.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// MQTT broker URL
    pub mqtt_broker: String,

    /// Tenant identifier
    pub tenant: String,

    /// MQTT client id; derived from the instance id when absent
    pub client_id: Option<String>,

    /// Publish local changes
    pub capture: bool,

    /// Interval between statistics reports
    pub report_interval: Duration,
}

/// Local store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long an apply waits for a collection lock
    pub lock_timeout: Duration,
}

/// Apply journal configuration.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Journal type: "sqlite" or "memory"
    pub store_type: String,

    /// Database path (for SQLite)
    pub db_path: PathBuf,

    /// How long journal entries are kept
    pub retention: Duration,
}

/// Accounts and groups known to this instance.
#[derive(Debug, Clone, Default)]
pub struct DirectoryConfig {
    /// Local accounts
    pub accounts: Vec<AccountConfig>,

    /// Extra local groups
    pub groups: Vec<String>,
}

/// One local account.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// Account name
    pub name: String,

    /// Primary group
    pub default_group: String,
}

impl DirectoryConfig {
    /// Build the in-memory directory.
    #[must_use]
    pub fn build(&self) -> LocalDirectory {
        let mut directory = LocalDirectory::default();
        for account in &self.accounts {
            directory.add_account(Account::new(&account.name, &account.default_group));
        }
        for group in &self.groups {
            directory.add_group(group.as_str());
        }
        directory
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            replication: ReplicationConfig {
                mqtt_broker: "tcp://localhost:1883".to_string(),
                tenant: "default".to_string(),
                client_id: None,
                capture: true,
                report_interval: Duration::from_secs(60),
            },
            store: StoreConfig {
                lock_timeout: docsync_core::lock::DEFAULT_LOCK_TIMEOUT,
            },
            journal: JournalConfig {
                store_type: "sqlite".to_string(),
                db_path: PathBuf::from("./docsync.db"),
                retention: Duration::from_secs(7 * 24 * 3600),
            },
            directory: DirectoryConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DOCSYNC_INSTANCE_ID`: Instance identifier
    /// - `DOCSYNC_MQTT_BROKER`: MQTT broker URL
    /// - `DOCSYNC_TENANT`: Tenant identifier
    /// - `DOCSYNC_CLIENT_ID`: MQTT client id
    /// - `DOCSYNC_CAPTURE`: "true" or "false"
    /// - `DOCSYNC_JOURNAL`: "sqlite" or "memory"
    /// - `DOCSYNC_DB_PATH`: SQLite database path
    /// - `DOCSYNC_LOCK_TIMEOUT_SECS`: Collection lock timeout
    /// - `DOCSYNC_ACCOUNTS`: JSON list of `{"name", "default_group"}`
    /// - `DOCSYNC_GROUPS`: JSON list of group names
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(id) = lookup("DOCSYNC_INSTANCE_ID") {
            config.instance_id = Some(id);
        }

        if let Some(mqtt) = lookup("DOCSYNC_MQTT_BROKER") {
            config.replication.mqtt_broker = mqtt;
        }

        if let Some(tenant) = lookup("DOCSYNC_TENANT") {
            config.replication.tenant = tenant;
        }

        if let Some(client_id) = lookup("DOCSYNC_CLIENT_ID") {
            config.replication.client_id = Some(client_id);
        }

        if let Some(capture) = lookup("DOCSYNC_CAPTURE") {
            config.replication.capture = capture
                .parse()
                .context("Invalid DOCSYNC_CAPTURE, expected true or false")?;
        }

        if let Some(journal) = lookup("DOCSYNC_JOURNAL") {
            config.journal.store_type = journal;
        }

        if let Some(db_path) = lookup("DOCSYNC_DB_PATH") {
            config.journal.db_path = PathBuf::from(db_path);
        }

        if let Some(secs) = lookup("DOCSYNC_LOCK_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().context("Invalid DOCSYNC_LOCK_TIMEOUT_SECS")?;
            config.store.lock_timeout = Duration::from_secs(secs);
        }

        if let Some(accounts_json) = lookup("DOCSYNC_ACCOUNTS") {
            config.directory.accounts =
                serde_json::from_str(&accounts_json).context("Invalid DOCSYNC_ACCOUNTS JSON")?;
        }

        if let Some(groups_json) = lookup("DOCSYNC_GROUPS") {
            config.directory.groups =
                serde_json::from_str(&groups_json).context("Invalid DOCSYNC_GROUPS JSON")?;
        }

        Ok(config)
    }
}
