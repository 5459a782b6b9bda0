use crate::broker::record::{Record, RecordMetadata};

/// Represents a topic in the broker system
/// A topic is a fixed set of append-only partitions
/// Records with the same key always land in the same partition, so total
/// order only holds between records that share a partition
#[derive(Debug)]
pub struct Topic {
    pub name: String,
    partitions: Vec<Vec<Record>>,
}

impl Topic {
    /// Creates a new topic with `partitions` empty logs (at least one)
    pub fn new(name: &str, partitions: u32) -> Self {
        Self {
            name: name.to_string(),
            partitions: (0..partitions.max(1)).map(|_| Vec::new()).collect(),
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    /// Routes a key to a partition with 32-bit FNV-1a, stable across runs
    pub fn partition_for(&self, key: &str) -> u32 {
        let mut hash: u32 = 0x811c_9dc5;
        for byte in key.as_bytes() {
            hash ^= u32::from(*byte);
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash % self.partition_count()
    }

    /// Appends a record to the partition chosen by its key
    pub fn append(&mut self, key: &str, payload: String) -> RecordMetadata {
        let partition = self.partition_for(key);
        let log = &mut self.partitions[partition as usize];
        let offset = log.len() as u64;
        log.push(Record {
            topic: self.name.clone(),
            partition,
            offset,
            key: key.to_string(),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        });
        RecordMetadata {
            topic: self.name.clone(),
            partition,
            offset,
        }
    }

    /// Reads up to `max` records of one partition starting at `from`
    /// Unknown partitions and offsets past the end yield nothing
    pub fn read(&self, partition: u32, from: u64, max: usize) -> Vec<Record> {
        self.partitions
            .get(partition as usize)
            .and_then(|log| log.get(usize::try_from(from).ok()?..))
            .map(|tail| tail.iter().take(max).cloned().collect())
            .unwrap_or_default()
    }

    /// Offset the next appended record of `partition` will get
    pub fn end_offset(&self, partition: u32) -> u64 {
        self.partitions
            .get(partition as usize)
            .map_or(0, |log| log.len() as u64)
    }
}
