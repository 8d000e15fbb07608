//! Stable property and metadata key names.

/// Resource type routing property (`DOCUMENT` or `COLLECTION`).
pub const RESOURCE_TYPE: &str = "resource-type";
/// Operation routing property (`CREATE` .. `METADATA`).
pub const RESOURCE_OPERATION: &str = "resource-operation";
/// Path of the affected resource.
pub const SOURCE_PATH: &str = "source-path";
/// New or duplicate path for MOVE and COPY.
pub const DESTINATION_PATH: &str = "destination-path";

/// Identity of the publishing instance.
pub const SENDER_INSTANCE_ID: &str = "sender-instance-id";
/// Owner account name.
pub const OWNER: &str = "owner";
/// Owner group name.
pub const GROUP: &str = "group";
/// Unix-style mode, integer or octal string.
pub const MODE: &str = "mode";
/// Declared mime type of a document.
pub const MIME_TYPE: &str = "mime-type";
/// Encoding applied to the body.
pub const CONTENT_ENCODING: &str = "content-encoding";
/// Length of the body before encoding.
pub const CONTENT_LENGTH: &str = "content-length";

/// Keys consumed into message fields rather than metadata.
pub const ROUTING_KEYS: [&str; 4] = [RESOURCE_TYPE, RESOURCE_OPERATION, SOURCE_PATH, DESTINATION_PATH];

/// Whether `key` is a routing property.
#[must_use]
pub fn is_routing_key(key: &str) -> bool {
    ROUTING_KEYS.contains(&key)
}
