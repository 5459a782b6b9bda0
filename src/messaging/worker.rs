//! Consumer worker
//!
//! One worker owns whatever partitions the transport assigns it and cycles
//! Idle → Receiving → Processing → Committing → Idle:
//! - shutdown is only honoured at the Idle → Receiving boundary, or while
//!   waiting inside a poll; a fetched batch is always processed to the end
//! - a record that can never decode is logged, optionally dead-lettered,
//!   and committed past so it cannot stall its partition
//! - a record whose save fails for any other reason is not committed; the
//!   worker seeks back to it and drops the rest of that partition's batch,
//!   so the next poll redelivers it in order
//! - the offset is committed only after the save succeeded, which makes
//!   delivery at-least-once; a repeated save is a harmless upsert

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerTransport, RebalanceListener, Record, Subscription};
use crate::config::WorkerSettings;
use crate::messaging::group::GroupSettings;
use crate::model::{Message, MessageEnvelope};
use crate::persistence::IndexedStore;
use crate::utils::{Error, Result};

/// Pause after a failed poll before trying again.
const POLL_ERROR_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    Idle,
    Receiving,
    Processing,
    Committing,
    Stopped,
}

#[derive(Debug, Default)]
pub struct WorkerStats {
    processed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    /// Records saved and committed.
    pub processed: u64,
    /// Malformed records committed past without saving.
    pub skipped: u64,
    /// Records whose save failed and were left for redelivery.
    pub failed: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Tracks the partitions this worker currently owns.
struct PartitionOwnership {
    owned: Mutex<HashSet<u32>>,
}

impl PartitionOwnership {
    fn new() -> Self {
        Self {
            owned: Mutex::new(HashSet::new()),
        }
    }

    fn owns(&self, partition: u32) -> bool {
        self.owned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&partition)
    }
}

impl RebalanceListener for PartitionOwnership {
    fn on_partitions_revoked(&self, member_id: &str, partitions: &[u32]) {
        let mut owned = self.owned.lock().unwrap_or_else(PoisonError::into_inner);
        for p in partitions {
            owned.remove(p);
        }
        info!(worker = member_id, ?partitions, "Partitions revoked");
    }

    fn on_partitions_assigned(&self, member_id: &str, partitions: &[u32]) {
        self.owned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(partitions.iter().copied());
        info!(worker = member_id, ?partitions, "Partitions assigned");
    }
}

pub struct ConsumerWorker {
    settings: WorkerSettings,
    group: GroupSettings,
    transport: Arc<dyn BrokerTransport>,
    store: Arc<IndexedStore>,
    stats: Arc<WorkerStats>,
    state: watch::Sender<WorkerState>,
}

impl ConsumerWorker {
    pub fn new(
        settings: WorkerSettings,
        group: GroupSettings,
        transport: Arc<dyn BrokerTransport>,
        store: Arc<IndexedStore>,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Idle);
        Self {
            settings,
            group,
            transport,
            store,
            stats: Arc::new(WorkerStats::default()),
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Observes state transitions, mostly useful for tests and status pages.
    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    fn enter(&self, next: WorkerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(worker = %self.settings.name, from = ?previous, to = ?next, "Worker state");
        }
    }

    /// Joins the group and consumes until `shutdown` flips to true (or its
    /// sender goes away), then leaves the group.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<WorkerStatsSnapshot> {
        let ownership = Arc::new(PartitionOwnership::new());
        let subscription = self.transport.subscribe(
            &self.group.topic,
            &self.group.group_id,
            &self.settings.name,
            Some(ownership.clone()),
        )?;
        info!(
            worker = %self.settings.name,
            topic = %self.group.topic,
            group = %self.group.group_id,
            delay_ms = self.settings.processing_delay_ms,
            "Consumer worker started"
        );

        loop {
            self.enter(WorkerState::Idle);
            if *shutdown.borrow() {
                break;
            }

            self.enter(WorkerState::Receiving);
            let polled = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!(worker = %self.settings.name, "Wait interrupted, shutting down");
                    break;
                }
                polled = self.transport.poll(
                    &subscription,
                    self.group.max_poll_records,
                    self.group.poll_timeout,
                ) => polled,
            };

            match polled {
                Ok(records) if records.is_empty() => {}
                Ok(records) => self.process_batch(&subscription, &ownership, records).await,
                Err(e) => {
                    warn!(worker = %self.settings.name, error = %e, "Poll failed");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        self.transport.unsubscribe(&subscription);
        self.enter(WorkerState::Stopped);
        let stats = self.stats.snapshot();
        info!(
            worker = %self.settings.name,
            processed = stats.processed,
            skipped = stats.skipped,
            failed = stats.failed,
            "Consumer worker stopped"
        );
        Ok(stats)
    }

    async fn process_batch(
        &self,
        subscription: &Subscription,
        ownership: &PartitionOwnership,
        records: Vec<Record>,
    ) {
        // partitions whose remaining records must wait for a later poll
        let mut held_back: HashSet<u32> = HashSet::new();

        for record in records {
            if held_back.contains(&record.partition) {
                continue;
            }
            if !ownership.owns(record.partition) {
                debug!(
                    worker = %self.settings.name,
                    partition = record.partition,
                    offset = record.offset,
                    "Partition revoked mid-batch, leaving record to its new owner"
                );
                held_back.insert(record.partition);
                continue;
            }

            info!(
                worker = %self.settings.name,
                key = %record.key,
                partition = record.partition,
                offset = record.offset,
                "Received message"
            );

            if self.settings.processing_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.settings.processing_delay_ms)).await;
            }

            self.enter(WorkerState::Processing);
            match self.handle(&record) {
                Ok(message) => {
                    self.stats.processed.fetch_add(1, Ordering::Relaxed);
                    info!(
                        worker = %self.settings.name,
                        id = message.id(),
                        sender = message.sender(),
                        message_type = %message.message_type(),
                        "Message processed and saved"
                    );
                    self.commit(subscription, &record);
                }
                Err(e) if e.is_permanent() => {
                    self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                    error!(
                        worker = %self.settings.name,
                        key = %record.key,
                        partition = record.partition,
                        offset = record.offset,
                        error = %e,
                        "Failed to deserialize message, skipping"
                    );
                    self.dead_letter(&record, &e);
                    self.commit(subscription, &record);
                }
                Err(e) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        worker = %self.settings.name,
                        key = %record.key,
                        partition = record.partition,
                        offset = record.offset,
                        error = %e,
                        "Failed to process message, will retry"
                    );
                    if let Err(seek_err) =
                        self.transport
                            .seek(subscription, record.partition, record.offset)
                    {
                        warn!(worker = %self.settings.name, error = %seek_err, "Seek failed");
                    }
                    held_back.insert(record.partition);
                }
            }
        }
    }

    fn handle(&self, record: &Record) -> Result<Message> {
        let message = MessageEnvelope::decode(&record.payload)?;
        self.store.save(&message)
    }

    fn commit(&self, subscription: &Subscription, record: &Record) {
        self.enter(WorkerState::Committing);
        if let Err(e) = self
            .transport
            .commit(subscription, record.partition, record.offset)
        {
            // the next owner will see this record again
            warn!(
                worker = %self.settings.name,
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "Commit rejected"
            );
        }
    }

    fn dead_letter(&self, record: &Record, cause: &Error) {
        let Some(topic) = &self.group.dead_letter_topic else {
            return;
        };
        match self
            .transport
            .send(topic, &record.key, record.payload.clone())
            .now_or_never()
        {
            Some(Err(e)) => {
                warn!(
                    worker = %self.settings.name,
                    topic = %topic,
                    offset = record.offset,
                    error = %e,
                    "Failed to forward record to dead-letter topic"
                );
                return;
            }
            Some(Ok(_)) => {}
            None => debug!(worker = %self.settings.name, topic = %topic, "Dead-letter ack still pending"),
        }
        debug!(
            worker = %self.settings.name,
            topic = %topic,
            offset = record.offset,
            cause = %cause,
            "Record forwarded to dead-letter topic"
        );
    }
}
