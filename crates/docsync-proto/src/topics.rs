//! MQTT topic scheme for change replication.
//!
//! Topic structure: `docsync/v1/{tenant}/changes`
//!
//! Every instance of a tenant publishes to and subscribes on the same topic;
//! the sender identity carried in each message breaks the echo.

use serde::{Deserialize, Serialize};

/// Protocol version for topic scheme.
pub const PROTOCOL_VERSION: &str = "v1";

/// Default topic prefix.
pub const DEFAULT_PREFIX: &str = "docsync";

/// Topic scheme configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicScheme {
    /// Tenant identifier
    pub tenant: String,
    /// Topic prefix (default: "docsync")
    pub prefix: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self::new("default")
    }
}

impl TopicScheme {
    /// Create a new topic scheme with the given tenant.
    #[must_use]
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }

    fn base(&self) -> String {
        format!("{}/{}/{}", self.prefix, PROTOCOL_VERSION, self.tenant)
    }

    /// Topic change messages are published on.
    #[must_use]
    pub fn changes(&self) -> String {
        format!("{}/changes", self.base())
    }

    /// Wildcard subscription for all messages in the tenant.
    #[must_use]
    pub fn tenant_wildcard(&self) -> String {
        format!("{}/#", self.base())
    }

    /// Parse a topic of this tenant.
    ///
    /// Returns the message kind if the topic belongs to this scheme.
    #[must_use]
    pub fn parse(&self, topic: &str) -> Option<TopicKind> {
        let remainder = topic.strip_prefix(&self.base())?.strip_prefix('/')?;
        match remainder {
            "changes" => Some(TopicKind::Changes),
            _ => None,
        }
    }
}

/// Message kinds carried under a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    /// Change messages
    Changes,
}
