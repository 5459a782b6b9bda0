mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, ConsumerSettings, LogSettings, OffsetReset, ServerSettings, Settings,
    StoreSettings, WorkerSettings,
};

/// Environment variables look like `PUBSTASH__BROKER__POLL_TIMEOUT_MS`.
pub const ENV_PREFIX: &str = "PUBSTASH";

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
/// Returns a `Settings` struct with every section populated
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(merge(partial, Settings::default()))
}

fn merge(partial: PartialSettings, default: Settings) -> Settings {
    let server = partial.server;
    let store = partial.store;
    let broker = partial.broker;
    let consumer = partial.consumer;
    let log = partial.log;

    Settings {
        server: ServerSettings {
            host: server
                .as_ref()
                .and_then(|s| s.host.clone())
                .unwrap_or(default.server.host),
            port: server
                .as_ref()
                .and_then(|s| s.port)
                .unwrap_or(default.server.port),
        },
        store: StoreSettings {
            path: store
                .as_ref()
                .and_then(|s| s.path.clone())
                .unwrap_or(default.store.path),
            temporary: store
                .as_ref()
                .and_then(|s| s.temporary)
                .unwrap_or(default.store.temporary),
        },
        broker: BrokerSettings {
            topic: broker
                .as_ref()
                .and_then(|b| b.topic.clone())
                .unwrap_or(default.broker.topic),
            partitions: broker
                .as_ref()
                .and_then(|b| b.partitions)
                .filter(|p| *p > 0)
                .unwrap_or(default.broker.partitions),
            offset_reset: broker
                .as_ref()
                .and_then(|b| b.offset_reset)
                .unwrap_or(default.broker.offset_reset),
            max_poll_records: broker
                .as_ref()
                .and_then(|b| b.max_poll_records)
                .filter(|m| *m > 0)
                .unwrap_or(default.broker.max_poll_records),
            poll_timeout_ms: broker
                .as_ref()
                .and_then(|b| b.poll_timeout_ms)
                .unwrap_or(default.broker.poll_timeout_ms),
            dead_letter: broker
                .as_ref()
                .and_then(|b| b.dead_letter)
                .unwrap_or(default.broker.dead_letter),
        },
        consumer: ConsumerSettings {
            group_id: consumer
                .as_ref()
                .and_then(|c| c.group_id.clone())
                .unwrap_or(default.consumer.group_id),
            workers: consumer
                .and_then(|c| c.workers)
                .filter(|w| !w.is_empty())
                .unwrap_or(default.consumer.workers),
        },
        log: LogSettings {
            level: log
                .and_then(|l| l.level)
                .unwrap_or(default.log.level),
        },
    }
}
