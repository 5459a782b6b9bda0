//! Application facade over the publisher and the indexed store.

pub mod message_service;

pub use message_service::{
    BatchReport, ConsumerStatus, MessageService, PRODUCERS, StressTestStarted,
};
