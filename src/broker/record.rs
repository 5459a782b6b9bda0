use serde::{Deserialize, Serialize};

/// A single entry of a partition log as handed to a consumer.
///
/// # Fields
///
/// - `topic` - The name of the topic the record was appended to.
/// - `partition` - The partition index inside that topic.
/// - `offset` - Position of the record inside its partition, starting at 0.
/// - `key` - The partitioning key supplied by the producer.
/// - `payload` - The record body, a JSON-encoded envelope for this crate.
/// - `timestamp` - Append time in milliseconds since the UNIX epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub payload: String,
    pub timestamp: i64,
}

/// Acknowledgement returned to a producer once a record is appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}
