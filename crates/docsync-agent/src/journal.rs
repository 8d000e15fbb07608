//! `SQLite` apply journal.
//!
//! One row per handled message, whatever its outcome, so operators can tell
//! "already consistent" skips from real failures after the fact. Failed rows
//! keep the received bytes and serve as the dead-letter store.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Result as SqliteResult};
use std::collections::BTreeMap;
use std::path::Path;

/// A message outcome to record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalEntry {
    /// Resource type, if the message got that far
    pub resource_type: Option<String>,
    /// Operation, if known
    pub operation: Option<String>,
    /// Source path, if known
    pub source_path: Option<String>,
    /// Destination path for MOVE and COPY
    pub destination_path: Option<String>,
    /// Publishing instance, if known
    pub sender: Option<String>,
    /// "applied", "skipped", "self_origin" or "failed"
    pub outcome: String,
    /// Skip reason or error text
    pub detail: Option<String>,
    /// Received bytes, kept for failed messages
    pub payload: Option<Vec<u8>>,
}

/// A recorded journal row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    /// Row id, increasing
    pub id: i64,
    /// The recorded entry
    pub entry: JournalEntry,
    /// When the entry was recorded
    pub recorded_at: DateTime<Utc>,
}

/// `SQLite`-backed apply journal.
pub struct SqliteJournal {
    conn: Connection,
}

impl SqliteJournal {
    /// Open or create a journal database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> SqliteResult<Self> {
        let conn = Connection::open(path)?;
        let journal = Self { conn };
        journal.init_schema()?;
        Ok(journal)
    }

    /// Create an in-memory journal.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        let journal = Self { conn };
        journal.init_schema()?;
        Ok(journal)
    }

    fn init_schema(&self) -> SqliteResult<()> {
        self.conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS apply_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                resource_type TEXT,
                operation TEXT,
                source_path TEXT,
                destination_path TEXT,
                sender TEXT,
                outcome TEXT NOT NULL,
                detail TEXT,
                payload BLOB,
                recorded_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_apply_log_recorded_at ON apply_log(recorded_at);
            CREATE INDEX IF NOT EXISTS idx_apply_log_outcome ON apply_log(outcome);
            ",
        )?;

        Ok(())
    }

    /// Record an entry stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub fn record(&self, entry: &JournalEntry) -> SqliteResult<()> {
        self.record_at(entry, Utc::now())
    }

    /// Record an entry with an explicit timestamp.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub fn record_at(&self, entry: &JournalEntry, at: DateTime<Utc>) -> SqliteResult<()> {
        self.conn.execute(
            r"
            INSERT INTO apply_log
                (resource_type, operation, source_path, destination_path, sender, outcome, detail, payload, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
            (
                entry.resource_type.as_deref(),
                entry.operation.as_deref(),
                entry.source_path.as_deref(),
                entry.destination_path.as_deref(),
                entry.sender.as_deref(),
                entry.outcome.as_str(),
                entry.detail.as_deref(),
                entry.payload.as_deref(),
                at.timestamp_millis(),
            ),
        )?;

        Ok(())
    }

    /// Most recent entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub fn recent(&self, limit: usize) -> SqliteResult<Vec<JournalRecord>> {
        let mut stmt = self.conn.prepare(
            r"
            SELECT id, resource_type, operation, source_path, destination_path, sender,
                   outcome, detail, payload, recorded_at
            FROM apply_log
            ORDER BY id DESC
            LIMIT ?1
            ",
        )?;

        let records = stmt
            .query_map([to_i64(limit)?], |row| {
                let millis: i64 = row.get(9)?;
                Ok(JournalRecord {
                    id: row.get(0)?,
                    entry: JournalEntry {
                        resource_type: row.get(1)?,
                        operation: row.get(2)?,
                        source_path: row.get(3)?,
                        destination_path: row.get(4)?,
                        sender: row.get(5)?,
                        outcome: row.get(6)?,
                        detail: row.get(7)?,
                        payload: row.get(8)?,
                    },
                    recorded_at: DateTime::from_timestamp_millis(millis).unwrap_or_default(),
                })
            })?
            .collect::<SqliteResult<Vec<_>>>()?;

        Ok(records)
    }

    /// Number of entries per outcome.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub fn count_by_outcome(&self) -> SqliteResult<BTreeMap<String, u64>> {
        let mut stmt = self.conn.prepare(
            r"
            SELECT outcome, COUNT(*) FROM apply_log
            GROUP BY outcome
            ",
        )?;

        let counts = stmt
            .query_map([], |row| {
                let count: i64 = row.get(1)?;
                Ok((row.get(0)?, u64::try_from(count).unwrap_or_default()))
            })?
            .collect::<SqliteResult<BTreeMap<String, u64>>>()?;

        Ok(counts)
    }

    /// Delete entries recorded before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> SqliteResult<usize> {
        let deleted = self.conn.execute(
            r"
            DELETE FROM apply_log
            WHERE recorded_at < ?1
            ",
            [cutoff.timestamp_millis()],
        )?;

        Ok(deleted)
    }
}

fn to_i64(value: usize) -> SqliteResult<i64> {
    i64::try_from(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(outcome: &str, path: &str) -> JournalEntry {
        JournalEntry {
            resource_type: Some("DOCUMENT".to_string()),
            operation: Some("CREATE".to_string()),
            source_path: Some(path.to_string()),
            sender: Some("node-a".to_string()),
            outcome: outcome.to_string(),
            ..JournalEntry::default()
        }
    }

    #[test]
    fn sqlite_journal_basic_operations() {
        let journal = SqliteJournal::in_memory().unwrap();
        let now = Utc::now();

        journal
            .record_at(&entry("applied", "/db/a.xml"), now - Duration::days(10))
            .unwrap();
        journal.record(&entry("applied", "/db/b.xml")).unwrap();
        journal.record(&entry("skipped", "/db/c.xml")).unwrap();

        let recent = journal.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].entry.source_path.as_deref(), Some("/db/c.xml"));
        assert_eq!(recent[1].entry.outcome, "applied");

        let counts = journal.count_by_outcome().unwrap();
        assert_eq!(counts.get("applied"), Some(&2));
        assert_eq!(counts.get("skipped"), Some(&1));

        let deleted = journal.prune_before(now - Duration::days(1)).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(journal.count_by_outcome().unwrap().get("applied"), Some(&1));
    }

    #[test]
    fn journal_persists_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.db");

        {
            let journal = SqliteJournal::open(&path).unwrap();
            let mut failed = entry("failed", "/db/x.xml");
            failed.detail = Some("no payload".to_string());
            failed.payload = Some(vec![0xa1, 0x00]);
            journal.record(&failed).unwrap();
        }

        let journal = SqliteJournal::open(&path).unwrap();
        let recent = journal.recent(10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].entry.detail.as_deref(), Some("no payload"));
        assert_eq!(recent[0].entry.payload.as_deref(), Some(&[0xa1, 0x00][..]));
    }
}
