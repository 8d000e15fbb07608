//! Apply statistics.

use crate::applier::{ApplyError, ApplyOutcome};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Running counters for one applier.
#[derive(Debug, Default)]
pub struct ApplyReport {
    total: AtomicU64,
    applied: AtomicU64,
    skipped: AtomicU64,
    self_origin: AtomicU64,
    failed: AtomicU64,
    processing_micros: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl ApplyReport {
    /// Record the result of handling one message.
    pub fn record(&self, result: &Result<ApplyOutcome, ApplyError>, elapsed: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.processing_micros.fetch_add(micros, Ordering::Relaxed);

        let counter = match result {
            Ok(ApplyOutcome::Applied) => &self.applied,
            Ok(ApplyOutcome::Skipped(_)) => &self.skipped,
            Ok(ApplyOutcome::SelfOrigin) => &self.self_origin,
            Err(err) => {
                *self.last_error.lock() = Some(err.to_string());
                &self.failed
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> ReportSnapshot {
        ReportSnapshot {
            total: self.total.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            self_origin: self.self_origin.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            processing_time: Duration::from_micros(self.processing_micros.load(Ordering::Relaxed)),
            last_error: self.last_error.lock().clone(),
        }
    }
}

/// Counters at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportSnapshot {
    /// Messages handled
    pub total: u64,
    /// Messages committed
    pub applied: u64,
    /// Messages whose target was absent or already present
    pub skipped: u64,
    /// Messages this instance published itself
    pub self_origin: u64,
    /// Messages that failed
    pub failed: u64,
    /// Cumulative handling time
    pub processing_time: Duration,
    /// Most recent failure
    pub last_error: Option<String>,
}

impl fmt::Display for ReportSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={} applied={} skipped={} self_origin={} failed={} time={}ms",
            self.total,
            self.applied,
            self.skipped,
            self.self_origin,
            self.failed,
            self.processing_time.as_millis()
        )?;
        if let Some(err) = &self.last_error {
            write!(f, " last_error=\"{err}\"")?;
        }
        Ok(())
    }
}
