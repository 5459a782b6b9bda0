//! Broker engine
//!
//! This module contains the in-process partitioned log responsible for:
//! - keeping one append-only log per topic partition
//! - routing producer records to partitions by key
//! - coordinating consumer groups (membership, assignment, positions, commits)
//! - waking pollers when records arrive or ownership changes
//!
//! Concurrency and usage notes:
//! - All state sits behind one `std::sync::Mutex`; no method holds it across
//!   an `.await`, and rebalance callbacks run after the lock is released so a
//!   listener may call back into the broker.
//! - Every successful append is acknowledged with all replicas in sync, since
//!   the log has exactly one replica.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::broker::group::{AssignmentChange, ConsumerGroupState};
use crate::broker::record::{Record, RecordMetadata};
use crate::broker::topic::Topic;
use crate::broker::transport::{BrokerTransport, DeliveryFuture, RebalanceListener, Subscription};
use crate::config::{BrokerSettings, OffsetReset};
use crate::utils::{Error, Result};

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Topic>,
    // keyed by (topic, group id)
    groups: HashMap<(String, String), ConsumerGroupState>,
    closed: bool,
}

pub struct Broker {
    state: Mutex<BrokerState>,
    notify: Notify,
    offset_reset: OffsetReset,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(OffsetReset::Earliest)
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Broker")
            .field("topics", &state.topics.len())
            .field("groups", &state.groups.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl Broker {
    pub fn new(offset_reset: OffsetReset) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            notify: Notify::new(),
            offset_reset,
        }
    }

    /// Builds a broker with the configured topic and, when enabled, its
    /// single-partition dead-letter topic.
    pub fn from_settings(settings: &BrokerSettings) -> Self {
        let broker = Self::new(settings.offset_reset);
        broker.create_topic(&settings.topic, settings.partitions);
        if settings.dead_letter {
            broker.create_topic(&settings.dead_letter_topic(), 1);
        }
        broker
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a topic if it does not exist yet. Returns false when it did.
    pub fn create_topic(&self, name: &str, partitions: u32) -> bool {
        let mut state = self.state();
        if state.topics.contains_key(name) {
            return false;
        }
        state
            .topics
            .insert(name.to_string(), Topic::new(name, partitions));
        info!(topic = name, partitions, "Topic created");
        true
    }

    pub fn partition_count(&self, topic: &str) -> Option<u32> {
        self.state().topics.get(topic).map(Topic::partition_count)
    }

    /// Every record currently held by one partition, oldest first.
    pub fn records(&self, topic: &str, partition: u32) -> Vec<Record> {
        self.state()
            .topics
            .get(topic)
            .map(|t| t.read(partition, 0, usize::MAX))
            .unwrap_or_default()
    }

    pub fn end_offset(&self, topic: &str, partition: u32) -> u64 {
        self.state()
            .topics
            .get(topic)
            .map_or(0, |t| t.end_offset(partition))
    }

    pub fn committed(&self, topic: &str, group_id: &str, partition: u32) -> Option<u64> {
        self.state()
            .groups
            .get(&(topic.to_string(), group_id.to_string()))
            .and_then(|g| g.committed(partition))
    }

    /// Sum over partitions of records the group has not committed yet.
    pub fn lag(&self, topic: &str, group_id: &str) -> u64 {
        let state = self.state();
        let Some(t) = state.topics.get(topic) else {
            return 0;
        };
        let group = state.groups.get(&(topic.to_string(), group_id.to_string()));
        (0..t.partition_count())
            .map(|p| {
                let committed = group.and_then(|g| g.committed(p)).unwrap_or(0);
                t.end_offset(p).saturating_sub(committed)
            })
            .sum()
    }

    pub fn generation(&self, topic: &str, group_id: &str) -> u64 {
        self.state()
            .groups
            .get(&(topic.to_string(), group_id.to_string()))
            .map_or(0, ConsumerGroupState::generation)
    }

    /// Stops accepting sends and wakes every poller.
    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_waiters();
        info!("Broker closed");
    }

    fn append(&self, topic: &str, key: &str, payload: String) -> Result<RecordMetadata> {
        let mut state = self.state();
        if state.closed {
            return Err(Error::Delivery("broker is closed".to_string()));
        }
        let t = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| Error::Delivery(format!("unknown topic '{topic}'")))?;
        Ok(t.append(key, payload))
    }

    /// Runs a group operation with both the topic and the group borrowed.
    fn with_group<T>(
        &self,
        subscription: &Subscription,
        op: impl FnOnce(&mut ConsumerGroupState, &Topic) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state();
        let BrokerState { topics, groups, .. } = &mut *state;
        let topic = topics
            .get(&subscription.topic)
            .ok_or_else(|| Error::Transport(format!("unknown topic '{}'", subscription.topic)))?;
        let group = groups
            .get_mut(&(subscription.topic.clone(), subscription.group_id.clone()))
            .ok_or_else(|| {
                Error::Transport(format!("unknown group '{}'", subscription.group_id))
            })?;
        op(group, topic)
    }

    fn announce(&self, subscription: &Subscription, changes: Vec<AssignmentChange>) {
        for change in &changes {
            debug!(
                group = %subscription.group_id,
                member = %change.member_id,
                revoked = ?change.revoked,
                assigned = ?change.assigned,
                "Partition ownership changed"
            );
            change.notify();
        }
        // newly owned partitions may already hold records
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl BrokerTransport for Broker {
    fn send(&self, topic: &str, key: &str, payload: String) -> DeliveryFuture {
        let result = self.append(topic, key, payload);
        if result.is_ok() {
            self.notify.notify_waiters();
        }
        Box::pin(future::ready(result))
    }

    fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        member_id: &str,
        listener: Option<Arc<dyn RebalanceListener>>,
    ) -> Result<Subscription> {
        let subscription = Subscription {
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            member_id: member_id.to_string(),
        };

        let changes = {
            let mut state = self.state();
            let BrokerState { topics, groups, .. } = &mut *state;
            let t = topics
                .get(topic)
                .ok_or_else(|| Error::Transport(format!("unknown topic '{topic}'")))?;
            let group = groups
                .entry((topic.to_string(), group_id.to_string()))
                .or_insert_with(|| ConsumerGroupState::new(group_id, self.offset_reset));
            let changes = group.join(member_id, listener, t);
            info!(
                topic,
                group = group_id,
                member = member_id,
                members = group.member_count(),
                generation = group.generation(),
                "Member joined group"
            );
            changes
        };

        self.announce(&subscription, changes);
        Ok(subscription)
    }

    async fn poll(
        &self,
        subscription: &Subscription,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<Record>> {
        let deadline = Instant::now() + timeout;
        loop {
            // registered before the check so a send in between still wakes us
            let notified = self.notify.notified();
            {
                if self.state().closed {
                    return Err(Error::Transport("broker is closed".to_string()));
                }
                let records =
                    self.with_group(subscription, |g, t| g.fetch(&subscription.member_id, t, max_records))?;
                if !records.is_empty() {
                    return Ok(records);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    fn commit(&self, subscription: &Subscription, partition: u32, offset: u64) -> Result<()> {
        self.with_group(subscription, |g, _| {
            g.commit(&subscription.member_id, partition, offset)
        })
    }

    fn seek(&self, subscription: &Subscription, partition: u32, offset: u64) -> Result<()> {
        self.with_group(subscription, |g, _| {
            g.seek(&subscription.member_id, partition, offset)
        })?;
        self.notify.notify_waiters();
        Ok(())
    }

    fn assigned_partitions(&self, subscription: &Subscription) -> Vec<u32> {
        self.with_group(subscription, |g, _| Ok(g.assigned(&subscription.member_id)))
            .unwrap_or_default()
    }

    fn unsubscribe(&self, subscription: &Subscription) {
        let changes = self
            .with_group(subscription, |g, t| Ok(g.leave(&subscription.member_id, t)))
            .unwrap_or_default();
        info!(
            topic = %subscription.topic,
            group = %subscription.group_id,
            member = %subscription.member_id,
            "Member left group"
        );
        self.announce(subscription, changes);
    }
}
