use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::broker::BrokerTransport;
use crate::config::{Settings, WorkerSettings};
use crate::messaging::worker::{ConsumerWorker, WorkerStats, WorkerStatsSnapshot};
use crate::persistence::IndexedStore;
use crate::utils::{Error, Result};

/// Everything the workers of one consumer group share.
#[derive(Debug, Clone)]
pub struct GroupSettings {
    pub topic: String,
    pub group_id: String,
    pub max_poll_records: usize,
    pub poll_timeout: Duration,
    pub dead_letter_topic: Option<String>,
    pub workers: Vec<WorkerSettings>,
}

impl GroupSettings {
    pub fn from_settings(settings: &Settings) -> Self {
        let broker = &settings.broker;
        Self {
            topic: broker.topic.clone(),
            group_id: settings.consumer.group_id.clone(),
            max_poll_records: broker.max_poll_records,
            poll_timeout: Duration::from_millis(broker.poll_timeout_ms),
            dead_letter_topic: broker.dead_letter.then(|| broker.dead_letter_topic()),
            workers: settings.consumer.workers.clone(),
        }
    }
}

/// A set of competing workers sharing one group id.
pub struct ConsumerGroup {
    transport: Arc<dyn BrokerTransport>,
    store: Arc<IndexedStore>,
    settings: GroupSettings,
}

impl ConsumerGroup {
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        store: Arc<IndexedStore>,
        settings: GroupSettings,
    ) -> Self {
        Self {
            transport,
            store,
            settings,
        }
    }

    /// Spawns one task per configured worker. Must be called inside a tokio
    /// runtime.
    pub fn start(self) -> Result<GroupHandle> {
        if self.settings.workers.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "consumer group {} has no workers",
                self.settings.group_id
            )));
        }

        let (shutdown, _) = watch::channel(false);
        let mut tasks = Vec::with_capacity(self.settings.workers.len());
        let mut stats = Vec::with_capacity(self.settings.workers.len());

        for worker_settings in &self.settings.workers {
            let worker = ConsumerWorker::new(
                worker_settings.clone(),
                self.settings.clone(),
                self.transport.clone(),
                self.store.clone(),
            );
            stats.push((worker.name().to_string(), worker.stats()));
            tasks.push(tokio::spawn(worker.run(shutdown.subscribe())));
        }

        info!(
            group = %self.settings.group_id,
            topic = %self.settings.topic,
            workers = tasks.len(),
            "Consumer group started"
        );

        Ok(GroupHandle {
            group_id: self.settings.group_id,
            shutdown,
            tasks,
            stats,
        })
    }
}

/// Controls a running [`ConsumerGroup`].
pub struct GroupHandle {
    group_id: String,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<Result<WorkerStatsSnapshot>>>,
    stats: Vec<(String, Arc<WorkerStats>)>,
}

impl GroupHandle {
    /// Live counters per worker name, in configuration order.
    pub fn stats(&self) -> Vec<(String, WorkerStatsSnapshot)> {
        self.stats
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect()
    }

    /// Signals every worker and waits for each to finish its current batch
    /// and leave the group.
    pub async fn shutdown(self) -> Vec<(String, WorkerStatsSnapshot)> {
        info!(group = %self.group_id, "Stopping consumer group");
        self.shutdown.send_replace(true);

        let results = join_all(self.tasks).await;
        let mut finished = Vec::with_capacity(results.len());
        for ((name, stats), result) in self.stats.into_iter().zip(results) {
            match result {
                Ok(Ok(snapshot)) => finished.push((name, snapshot)),
                Ok(Err(e)) => {
                    error!(worker = %name, error = %e, "Consumer worker failed");
                    finished.push((name, stats.snapshot()));
                }
                Err(e) => {
                    error!(worker = %name, error = %e, "Consumer worker panicked");
                    finished.push((name, stats.snapshot()));
                }
            }
        }
        info!(group = %self.group_id, "Consumer group stopped");
        finished
    }
}
