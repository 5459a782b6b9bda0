//! CLI for PubStash
//!
//! Subcommands:
//! - `server`: run the consumer group and the WebSocket facade
//! - `demo`: push a batch through the three producers and print the totals
//! - `stress`: publish at a fixed rate for a while and print the totals

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use pubstash::broker::Broker;
use pubstash::config::{Settings, load_config};
use pubstash::messaging::{ConsumerGroup, GroupHandle, GroupSettings, Publisher};
use pubstash::persistence::IndexedStore;
use pubstash::service::MessageService;
use pubstash::transport::websocket::start_websocket_server;
use pubstash::utils::logging;
use tokio::time::{Instant, sleep};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "pubstash")]
enum Command {
    /// Start the consumer group and the WebSocket server
    Server,
    /// Send a batch from three producers and report what the consumers stored
    Demo {
        /// Number of messages to send
        #[arg(long, default_value_t = 9)]
        count: usize,
        /// How long to wait for the consumers, in seconds
        #[arg(long, default_value_t = 30)]
        wait_secs: u64,
    },
    /// Publish continuously from three rotating producers, then report
    Stress {
        /// How long to keep publishing, in seconds
        #[arg(long, default_value_t = 30)]
        duration_secs: u64,
        /// Messages per second
        #[arg(long, default_value_t = 10)]
        rate_per_second: u32,
        /// How long to wait for the consumers afterwards, in seconds
        #[arg(long, default_value_t = 30)]
        wait_secs: u64,
    },
}

struct App {
    service: MessageService,
    group: GroupSettings,
    broker: Arc<Broker>,
    store: Arc<IndexedStore>,
}

impl App {
    fn build(config: &Settings) -> Result<Self, Box<dyn std::error::Error>> {
        let broker = Arc::new(Broker::from_settings(&config.broker));
        let store = Arc::new(IndexedStore::from_settings(&config.store)?);
        let publisher = Publisher::new(broker.clone(), config.broker.topic.clone());
        Ok(Self {
            service: MessageService::new(store.clone(), publisher),
            group: GroupSettings::from_settings(config),
            broker,
            store,
        })
    }

    fn consumers(&self) -> ConsumerGroup {
        ConsumerGroup::new(self.broker.clone(), self.store.clone(), self.group.clone())
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            return;
        }
    };
    logging::init(&config.log.level);

    match cmd {
        Command::Server => {
            if let Err(e) = run_server(config).await {
                error!("Server failed: {}", e);
            }
        }
        Command::Demo { count, wait_secs } => {
            if let Err(e) = run_demo(config, count, Duration::from_secs(wait_secs)).await {
                error!("Demo failed: {}", e);
            }
        }
        Command::Stress {
            duration_secs,
            rate_per_second,
            wait_secs,
        } => {
            let run = run_stress(
                config,
                Duration::from_secs(duration_secs),
                rate_per_second,
                Duration::from_secs(wait_secs),
            );
            if let Err(e) = run.await {
                error!("Stress test failed: {}", e);
            }
        }
    }
}

async fn run_server(config: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let app = App::build(&config)?;
    let group = app.consumers().start()?;

    tokio::select! {
        result = start_websocket_server(&addr, app.service.clone()) => {
            match result {
                Ok(()) => error!("WebSocket server exited unexpectedly."),
                Err(e) => error!("WebSocket server failed: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    group.shutdown().await;
    app.store.flush()?;
    app.broker.close();
    Ok(())
}

async fn run_demo(
    config: Settings,
    count: usize,
    wait: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = App::build(&config)?;
    let group = app.consumers().start()?;

    let before = app.store.len();
    let report = app.service.send_batch(count);
    info!(sent = report.sent, failed = report.failed, "Batch handed to the broker");

    report_when_drained(app, group, before + report.sent, wait).await
}

async fn run_stress(
    config: Settings,
    duration: Duration,
    rate_per_second: u32,
    wait: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = App::build(&config)?;
    let group = app.consumers().start()?;

    let before = app.store.len();
    let (started, task) = app.service.stress_test(duration, rate_per_second)?;
    info!(
        duration_secs = started.duration_secs,
        rate_per_second = started.rate_per_second,
        "Stress test running"
    );
    let report = task.await?;
    info!(sent = report.sent, failed = report.failed, "Stress test handed to the broker");

    report_when_drained(app, group, before + report.sent, wait).await
}

/// Waits until the store holds `expected` messages or `wait` runs out, stops
/// the consumers and prints the consumer status.
async fn report_when_drained(
    app: App,
    group: GroupHandle,
    expected: usize,
    wait: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let deadline = Instant::now() + wait;
    while app.store.len() < expected && Instant::now() < deadline {
        sleep(Duration::from_millis(200)).await;
    }
    if app.store.len() < expected {
        warn!("Consumers did not catch up before the deadline");
    }

    for (name, stats) in group.shutdown().await {
        info!(
            worker = %name,
            processed = stats.processed,
            skipped = stats.skipped,
            failed = stats.failed,
            "Worker summary"
        );
    }

    let status = app.service.consumer_status()?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    app.store.flush()?;
    Ok(())
}
