use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, TimeDelta, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{error, info};

use crate::messaging::Publisher;
use crate::model::{Message, MessageType};
use crate::persistence::IndexedStore;
use crate::utils::{Error, Result};

/// The demo producers and the type each one sends.
pub const PRODUCERS: [(&str, MessageType); 3] = [
    ("Producer-A", MessageType::Order),
    ("Producer-B", MessageType::Notification),
    ("Producer-C", MessageType::Event),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub requested: usize,
    pub sent: usize,
    pub failed: usize,
}

/// Returned as soon as a stress run is spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StressTestStarted {
    pub duration_secs: u64,
    pub rate_per_second: u32,
}

impl BatchReport {
    fn record(&mut self, sent: bool) {
        if sent {
            self.sent += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Totals over everything currently stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerStatus {
    pub total: usize,
    pub producer_a: usize,
    pub producer_b: usize,
    pub producer_c: usize,
    pub order: usize,
    pub notification: usize,
    pub event: usize,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Front door used by the binary and the WebSocket adapter.
///
/// Writes made here are optimistic: the consumer group saves the same
/// message again once it comes off the log, and that save wins.
#[derive(Debug, Clone)]
pub struct MessageService {
    store: Arc<IndexedStore>,
    publisher: Publisher,
}

impl MessageService {
    pub fn new(store: Arc<IndexedStore>, publisher: Publisher) -> Self {
        Self { store, publisher }
    }

    pub fn store(&self) -> &Arc<IndexedStore> {
        &self.store
    }

    /// Builds a message, publishes it and stores it locally.
    pub fn create_and_send(
        &self,
        content: &str,
        sender: &str,
        message_type: MessageType,
    ) -> Result<Message> {
        let message = Message::create(content, sender, message_type)?;
        self.publisher.publish(&message)?;
        let saved = self.store.save(&message)?;
        info!(id = saved.id(), sender = saved.sender(), "Message created");
        Ok(saved)
    }

    /// Publishes without touching the store.
    pub fn send(&self, message: &Message) -> Result<()> {
        self.publisher.publish(message)
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<Message>> {
        self.store.get(id)
    }

    pub fn get_by_sender(&self, sender: &str) -> Result<Vec<Message>> {
        self.store.list_by_sender(sender)
    }

    pub fn get_all(&self) -> Result<Vec<Message>> {
        self.store.list()
    }

    pub fn get_urgent(&self) -> Result<Vec<Message>> {
        let mut messages = self.store.list()?;
        messages.retain(Message::is_urgent);
        Ok(messages)
    }

    /// Returns whether anything was deleted.
    pub fn delete_by_id(&self, id: &str) -> Result<bool> {
        self.store.delete(id)
    }

    /// Deletes every message older than `minutes` and returns how many went.
    pub fn cleanup(&self, minutes: i64) -> Result<usize> {
        if minutes < 0 {
            return Err(Error::InvalidArgument(format!(
                "minutes must not be negative, got {minutes}"
            )));
        }
        let removed = self.store.evict_older_than(TimeDelta::minutes(minutes))?;
        info!(minutes, removed, "Old messages cleaned up");
        Ok(removed)
    }

    /// Sends `count` messages split evenly over [`PRODUCERS`]; the remainder
    /// comes from the first producer. Individual failures are logged and
    /// counted, never fatal.
    pub fn send_batch(&self, count: usize) -> BatchReport {
        info!(count, producers = PRODUCERS.len(), "Starting batch send");
        let share = count / PRODUCERS.len();
        let remainder = count % PRODUCERS.len();

        let mut report = BatchReport {
            requested: count,
            sent: 0,
            failed: 0,
        };
        for (i, (producer, message_type)) in PRODUCERS.iter().enumerate() {
            let n = if i == 0 { share + remainder } else { share };
            for seq in 1..=n {
                let content = format!(
                    "[{message_type}] Message #{seq} from {producer} at {}",
                    Local::now().naive_local()
                );
                report.record(self.send_generated(content, producer, *message_type));
            }
            info!(producer, sent = n, "Producer finished");
        }
        report
    }

    /// Spawns a background run that keeps publishing for `duration` at
    /// `rate_per_second`, rotating over [`PRODUCERS`]. Must be called inside
    /// a tokio runtime. The task resolves to what it sent.
    pub fn stress_test(
        &self,
        duration: Duration,
        rate_per_second: u32,
    ) -> Result<(StressTestStarted, JoinHandle<BatchReport>)> {
        if rate_per_second == 0 || duration.is_zero() {
            return Err(Error::InvalidArgument(
                "stress test needs a positive duration and rate".to_string(),
            ));
        }
        let started = StressTestStarted {
            duration_secs: duration.as_secs(),
            rate_per_second,
        };
        info!(?duration, rate_per_second, "Starting stress test");

        let service = self.clone();
        let task = tokio::spawn(async move {
            let deadline = Instant::now() + duration;
            let mut ticker = interval(Duration::from_secs(1) / rate_per_second);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut report = BatchReport {
                requested: 0,
                sent: 0,
                failed: 0,
            };

            loop {
                ticker.tick().await;
                if Instant::now() >= deadline {
                    break;
                }
                let (producer, message_type) = PRODUCERS[report.requested % PRODUCERS.len()];
                report.requested += 1;
                let content = format!("[STRESS] Message #{} from {producer}", report.requested);
                report.record(service.send_generated(content, producer, message_type));
            }

            info!(sent = report.sent, failed = report.failed, "Stress test finished");
            report
        });

        Ok((started, task))
    }

    fn send_generated(&self, content: String, producer: &str, message_type: MessageType) -> bool {
        match Message::create(content, producer, message_type)
            .and_then(|m| self.publisher.publish(&m))
        {
            Ok(()) => true,
            Err(e) => {
                error!(producer, error = %e, "Failed to send generated message");
                false
            }
        }
    }

    pub fn consumer_status(&self) -> Result<ConsumerStatus> {
        let messages = self.store.list()?;
        let by_sender = |s: &str| messages.iter().filter(|m| m.sender() == s).count();
        let by_type = |t: MessageType| messages.iter().filter(|m| m.message_type() == t).count();

        Ok(ConsumerStatus {
            total: messages.len(),
            producer_a: by_sender(PRODUCERS[0].0),
            producer_b: by_sender(PRODUCERS[1].0),
            producer_c: by_sender(PRODUCERS[2].0),
            order: by_type(MessageType::Order),
            notification: by_type(MessageType::Notification),
            event: by_type(MessageType::Event),
            timestamp: Utc::now().timestamp_millis(),
        })
    }
}
