//! # docsync Apply
//!
//! Consumer side of replication: replays change messages against a local
//! store, one transaction per message.
//!
//! - `ChangeApplier`: self-origin filter, dispatch and per-operation handlers
//! - `Reconciler`: maps owner, group, mode and mime type onto local principals
//! - `ApplyReport`: counters distinguishing applied, skipped and failed messages

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod applier;
pub mod reconcile;
pub mod report;

pub use applier::{ApplyError, ApplyOutcome, ChangeApplier, SkipReason};
pub use reconcile::{ReconcileError, Reconciler};
pub use report::{ApplyReport, ReportSnapshot};
