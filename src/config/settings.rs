use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the WebSocket adapter, the indexed store, the
/// in-process broker and the consumer group.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub store: StoreSettings,
    pub broker: BrokerSettings,
    pub consumer: ConsumerSettings,
    pub log: LogSettings,
}

/// Configuration settings for the server.
///
/// Defines the host and port the WebSocket adapter will bind to.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Where the sled database lives.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreSettings {
    pub path: String,
    /// Open sled in temporary mode; the database is removed on drop.
    pub temporary: bool,
}

/// Where a consumer group starts reading when it has no committed offset.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

/// Configuration settings for the broker.
///
/// Controls the topic layout and the consumer-side polling behaviour.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub topic: String,
    pub partitions: u32,
    pub offset_reset: OffsetReset,
    pub max_poll_records: usize,
    pub poll_timeout_ms: u64,
    /// Forward malformed records to `<topic>.DLQ` before skipping them.
    pub dead_letter: bool,
}

impl BrokerSettings {
    pub fn dead_letter_topic(&self) -> String {
        format!("{}.DLQ", self.topic)
    }
}

/// One competing consumer inside the group.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub name: String,
    /// Simulated per-message processing latency.
    #[serde(default)]
    pub processing_delay_ms: u64,
}

impl WorkerSettings {
    pub fn new(name: impl Into<String>, processing_delay_ms: u64) -> Self {
        Self {
            name: name.into(),
            processing_delay_ms,
        }
    }
}

/// Configuration settings for the consumer group.
#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerSettings {
    pub group_id: String,
    pub workers: Vec<WorkerSettings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub store: Option<PartialStoreSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub consumer: Option<PartialConsumerSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialStoreSettings {
    pub path: Option<String>,
    pub temporary: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub topic: Option<String>,
    pub partitions: Option<u32>,
    pub offset_reset: Option<OffsetReset>,
    pub max_poll_records: Option<usize>,
    pub poll_timeout_ms: Option<u64>,
    pub dead_letter: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PartialConsumerSettings {
    pub group_id: Option<String>,
    pub workers: Option<Vec<WorkerSettings>>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

/// Provides default values for `Settings`.
///
/// The three workers mirror the competing consumers of the reference
/// deployment, each with its own simulated latency.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            store: StoreSettings {
                path: "pubstash_db".to_string(),
                temporary: false,
            },
            broker: BrokerSettings {
                topic: "messages".to_string(),
                partitions: 3,
                offset_reset: OffsetReset::Earliest,
                max_poll_records: 100,
                poll_timeout_ms: 1000,
                dead_letter: true,
            },
            consumer: ConsumerSettings {
                group_id: "message-consumer-group".to_string(),
                workers: vec![
                    WorkerSettings::new("consumer-a", 1000),
                    WorkerSettings::new("consumer-b", 1500),
                    WorkerSettings::new("consumer-c", 800),
                ],
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}
