//! Origin tracker for replicated transactions.
//!
//! The applier tags every transaction it opens with [`APPLIER_ORIGIN`].
//! Capture hooks firing inside such a transaction see the tag and stay quiet,
//! which is what stops a replayed change from being published again.

/// Prefix shared by every origin tag set by the replication layer.
pub const REPLICATION_ORIGIN_PREFIX: &str = "docsync.replication";

/// Origin tag set by the change applier.
pub const APPLIER_ORIGIN: &str = "docsync.replication.applier";

/// Whether a transaction origin marks a replayed (remote) mutation.
#[must_use]
pub fn is_replicated_origin(origin: Option<&str>) -> bool {
    origin.is_some_and(|origin| origin.starts_with(REPLICATION_ORIGIN_PREFIX))
}
