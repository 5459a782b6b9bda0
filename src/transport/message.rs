use serde::{Deserialize, Serialize};

use crate::model::MessageEnvelope;
use crate::service::{BatchReport, ConsumerStatus, StressTestStarted};

fn default_batch_size() -> usize {
    9
}

fn default_stress_duration() -> u64 {
    30
}

fn default_stress_rate() -> u32 {
    10
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    Create {
        content: String,
        sender: String,
        message_type: String,
    },
    Get {
        id: String,
    },
    BySender {
        sender: String,
    },
    All,
    Urgent,
    Delete {
        id: String,
    },
    Cleanup {
        minutes: i64,
    },
    SendBatch {
        #[serde(default = "default_batch_size")]
        count: usize,
    },
    StressTest {
        #[serde(default = "default_stress_duration")]
        duration_secs: u64,
        #[serde(default = "default_stress_rate")]
        rate_per_second: u32,
    },
    Status,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerResponse {
    /// `message` is null when the id is unknown.
    Message {
        message: Option<MessageEnvelope>,
    },
    Messages {
        messages: Vec<MessageEnvelope>,
    },
    Deleted {
        id: String,
        deleted: bool,
    },
    Cleaned {
        removed: usize,
    },
    BatchSent {
        #[serde(flatten)]
        report: BatchReport,
    },
    StressStarted {
        #[serde(flatten)]
        started: StressTestStarted,
    },
    Status {
        #[serde(flatten)]
        status: ConsumerStatus,
    },
    Error {
        message: String,
    },
}
