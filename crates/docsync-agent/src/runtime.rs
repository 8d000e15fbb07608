//! Agent runtime orchestration.

use crate::config::AgentConfig;
use crate::journal::{JournalEntry, SqliteJournal};
use crate::transport::MqttTransport;
use anyhow::{Context, Result};
use chrono::Utc;
use docsync_apply::{ApplyError, ApplyOutcome, ChangeApplier};
use docsync_capture::ChangeCapture;
use docsync_core::{Directory, InstanceId, MemoryStore, MemoryStoreOptions, Store};
use docsync_proto::topics::TopicKind;
use docsync_proto::{keys, Envelope, TopicScheme};
use std::sync::Arc;
use std::time::Duration;

/// The main agent runtime.
pub struct Agent {
    config: AgentConfig,
    instance: InstanceId,
    journal: Option<SqliteJournal>,
}

impl Agent {
    /// Create a new agent.
    ///
    /// # Errors
    ///
    /// Returns error if initialization fails.
    pub fn new(config: AgentConfig, instance: InstanceId) -> Result<Self> {
        let journal = if config.journal.store_type == "sqlite" {
            Some(
                SqliteJournal::open(&config.journal.db_path)
                    .context("Failed to open SQLite journal")?,
            )
        } else {
            None
        };

        Ok(Self {
            config,
            instance,
            journal,
        })
    }

    /// Run the agent's main loop.
    ///
    /// # Errors
    ///
    /// Returns error if any component fails.
    pub async fn run(self) -> Result<()> {
        tracing::info!(instance = %self.instance, "Starting agent runtime");

        let store = Arc::new(MemoryStore::with_options(MemoryStoreOptions {
            lock_timeout: self.config.store.lock_timeout,
            origin_tracking: true,
        }));
        let directory = Arc::new(self.config.directory.build());

        let client_id = self
            .config
            .replication
            .client_id
            .clone()
            .unwrap_or_else(|| format!("docsync-{}", self.instance));
        let topic_scheme = TopicScheme::new(&self.config.replication.tenant);

        let (transport, mut eventloop) = MqttTransport::new(
            &self.config.replication.mqtt_broker,
            &client_id,
            topic_scheme,
        )
        .context("Failed to create MQTT transport")?;

        if self.config.replication.capture {
            store.register_observer(Arc::new(ChangeCapture::new(
                self.instance.clone(),
                transport.publisher(),
            )));
        } else {
            tracing::info!("Capture disabled, local changes are not published");
        }

        let applier = ChangeApplier::new(Arc::clone(&store), directory, self.instance.clone());

        transport.subscribe().await?;

        if let Some(journal) = self.journal.as_ref() {
            match journal.recent(1) {
                Ok(records) => {
                    if let Some(last) = records.first() {
                        tracing::info!(
                            id = last.id,
                            outcome = %last.entry.outcome,
                            recorded_at = %last.recorded_at,
                            "Last journal entry"
                        );
                    }
                }
                Err(err) => tracing::warn!(error = %err, "Failed to read journal"),
            }
        }

        let period = self.config.replication.report_interval;
        let mut report_timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        tracing::info!("Agent running, press Ctrl+C to stop");

        // Main event loop
        loop {
            tokio::select! {
                event = eventloop.poll() => {
                    match event {
                        Ok(rumqttc::Event::Incoming(rumqttc::Packet::Publish(publish))) => {
                            tracing::debug!(
                                topic = %publish.topic,
                                payload_len = publish.payload.len(),
                                "Received change message"
                            );

                            if transport.topic_scheme().parse(&publish.topic) != Some(TopicKind::Changes) {
                                tracing::debug!(topic = %publish.topic, "Ignoring foreign topic");
                                if let Err(err) = transport.ack(&publish).await {
                                    tracing::warn!(error = %err, "Failed to ack publish");
                                }
                                continue;
                            }

                            if let Err(err) = process_payload(&applier, self.journal.as_ref(), &publish.payload) {
                                tracing::warn!(
                                    error = %err,
                                    topic = %publish.topic,
                                    "Change failed, acknowledging and keeping it as a dead letter"
                                );
                            }
                            if let Err(err) = transport.ack(&publish).await {
                                tracing::warn!(error = %err, "Failed to ack publish");
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "MQTT error");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }

                _ = report_timer.tick() => {
                    report(&applier, self.journal.as_ref(), self.config.journal.retention);
                }

                // Handle shutdown
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
            }
        }

        report(&applier, self.journal.as_ref(), self.config.journal.retention);
        tracing::info!("Agent stopped");
        Ok(())
    }
}

/// Decode, apply and journal one received payload.
///
/// A live MQTT session never redelivers an unacknowledged publish, so the
/// caller acks every payload once this returns. Failures are journaled as
/// `failed` together with the received bytes.
///
/// # Errors
///
/// Returns error if the payload is not a change message or cannot be
/// applied.
pub fn process_payload<S: Store, D: Directory>(
    applier: &ChangeApplier<S, D>,
    journal: Option<&SqliteJournal>,
    payload: &[u8],
) -> Result<ApplyOutcome, ApplyError> {
    let envelope = match Envelope::from_cbor(payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::warn!(error = %err, payload_len = payload.len(), "Failed to decode envelope");
            let result = Err(ApplyError::from(err));
            applier.report().record(&result, Duration::ZERO);
            record(journal, &journal_entry(None, &result, payload));
            return result;
        }
    };

    let result = applier.handle_envelope(&envelope);
    record(journal, &journal_entry(Some(&envelope), &result, payload));
    result
}

fn journal_entry(
    envelope: Option<&Envelope>,
    result: &Result<ApplyOutcome, ApplyError>,
    payload: &[u8],
) -> JournalEntry {
    let property = |key: &str| {
        envelope
            .and_then(|e| e.property_str(key))
            .map(ToString::to_string)
    };

    let (outcome, detail) = match result {
        Ok(ApplyOutcome::Skipped(reason)) => ("skipped".to_string(), Some(reason.to_string())),
        Ok(outcome) => (outcome.as_str().to_string(), None),
        Err(err) => ("failed".to_string(), Some(err.to_string())),
    };

    JournalEntry {
        resource_type: property(keys::RESOURCE_TYPE),
        operation: property(keys::RESOURCE_OPERATION),
        source_path: property(keys::SOURCE_PATH),
        destination_path: property(keys::DESTINATION_PATH),
        sender: property(keys::SENDER_INSTANCE_ID),
        payload: result.is_err().then(|| payload.to_vec()),
        outcome,
        detail,
    }
}

fn record(journal: Option<&SqliteJournal>, entry: &JournalEntry) {
    if let Some(journal) = journal {
        if let Err(err) = journal.record(entry) {
            tracing::warn!(error = %err, path = ?entry.source_path, "Failed to journal message");
        }
    }
}

fn report<S: Store, D: Directory>(
    applier: &ChangeApplier<S, D>,
    journal: Option<&SqliteJournal>,
    retention: Duration,
) {
    let snapshot = applier.report().snapshot();
    tracing::info!(report = %snapshot, "Apply statistics");

    let Some(journal) = journal else {
        return;
    };
    match journal.count_by_outcome() {
        Ok(counts) => tracing::info!(?counts, "Journal totals"),
        Err(err) => tracing::warn!(error = %err, "Failed to read journal totals"),
    }

    let Ok(retention) = chrono::Duration::from_std(retention) else {
        return;
    };
    match journal.prune_before(Utc::now() - retention) {
        Ok(0) => {}
        Ok(deleted) => tracing::info!(deleted, "Pruned journal"),
        Err(err) => tracing::warn!(error = %err, "Failed to prune journal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::{LocalDirectory, ResourcePath};
    use docsync_proto::{ChangeMessage, Operation, ResourceType};

    fn applier() -> ChangeApplier<MemoryStore, LocalDirectory> {
        ChangeApplier::new(
            Arc::new(MemoryStore::new()),
            Arc::new(LocalDirectory::default()),
            InstanceId::new("node-b"),
        )
    }

    fn encoded(message: &ChangeMessage) -> Vec<u8> {
        message.to_envelope().to_cbor().unwrap()
    }

    #[test]
    fn applied_message_is_journaled() {
        let applier = applier();
        let journal = SqliteJournal::in_memory().unwrap();
        let message = ChangeMessage::new(ResourceType::Collection, Operation::Create, "/db/reports")
            .with_metadata(keys::SENDER_INSTANCE_ID, "node-a");

        let outcome = process_payload(&applier, Some(&journal), &encoded(&message)).unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        let path = ResourcePath::parse("/db/reports").unwrap();
        assert!(applier.store().collection_at(&path).is_some());

        let recent = journal.recent(1).unwrap();
        assert_eq!(recent[0].entry.outcome, "applied");
        assert_eq!(recent[0].entry.resource_type.as_deref(), Some("COLLECTION"));
        assert_eq!(recent[0].entry.sender.as_deref(), Some("node-a"));
    }

    #[test]
    fn skip_and_self_origin_are_journaled() {
        let applier = applier();
        let journal = SqliteJournal::in_memory().unwrap();

        let missing = ChangeMessage::new(ResourceType::Document, Operation::Delete, "/db/none/a.xml");
        let own = ChangeMessage::new(ResourceType::Collection, Operation::Delete, "/db/x")
            .with_metadata(keys::SENDER_INSTANCE_ID, "node-b");

        assert!(matches!(
            process_payload(&applier, Some(&journal), &encoded(&missing)),
            Ok(ApplyOutcome::Skipped(_))
        ));
        assert_eq!(
            process_payload(&applier, Some(&journal), &encoded(&own)).unwrap(),
            ApplyOutcome::SelfOrigin
        );

        let counts = journal.count_by_outcome().unwrap();
        assert_eq!(counts.get("skipped"), Some(&1));
        assert_eq!(counts.get("self_origin"), Some(&1));
    }

    #[test]
    fn undecodable_payload_fails_and_is_counted() {
        let applier = applier();
        let journal = SqliteJournal::in_memory().unwrap();

        assert!(process_payload(&applier, Some(&journal), b"\xff\x00 not cbor").is_err());

        let snapshot = applier.report().snapshot();
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.total, 1);

        let recent = journal.recent(1).unwrap();
        assert_eq!(recent[0].entry.outcome, "failed");
        assert!(recent[0].entry.resource_type.is_none());
        assert_eq!(recent[0].entry.payload.as_deref(), Some(&b"\xff\x00 not cbor"[..]));
    }

    #[test]
    fn failed_apply_is_kept_as_dead_letter() {
        let applier = applier();
        let journal = SqliteJournal::in_memory().unwrap();
        let poison = ChangeMessage::new(ResourceType::Document, Operation::Create, "/db/blob.zzz")
            .with_metadata(keys::SENDER_INSTANCE_ID, "node-a")
            .with_payload(b"opaque".to_vec());
        let bytes = encoded(&poison);

        let result = process_payload(&applier, Some(&journal), &bytes);
        assert!(matches!(result, Err(ApplyError::Reconcile(_))));

        // The next message is handled normally
        let next = ChangeMessage::new(ResourceType::Collection, Operation::Create, "/db/after");
        assert!(process_payload(&applier, Some(&journal), &encoded(&next)).is_ok());

        let recent = journal.recent(2).unwrap();
        assert_eq!(recent[0].entry.outcome, "applied");
        assert!(recent[0].entry.payload.is_none());

        let dead = &recent[1].entry;
        assert_eq!(dead.outcome, "failed");
        assert_eq!(dead.source_path.as_deref(), Some("/db/blob.zzz"));
        assert!(dead.detail.is_some());
        let kept = dead.payload.as_deref().unwrap();
        let replayed = ChangeMessage::from_envelope(&Envelope::from_cbor(kept).unwrap()).unwrap();
        assert_eq!(replayed, poison);
    }

    #[test]
    fn works_without_journal() {
        let applier = applier();
        let message = ChangeMessage::new(ResourceType::Collection, Operation::Create, "/db/a");
        assert!(process_payload(&applier, None, &encoded(&message)).is_ok());
        report(&applier, None, Duration::from_secs(60));
    }
}
