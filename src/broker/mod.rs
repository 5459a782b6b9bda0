//! The `broker` module is the partitioned log that sits between the
//! publisher and the consumer group.
//!
//! - `transport`: the `BrokerTransport` contract the rest of the crate codes
//!   against, plus the partition-ownership callbacks.
//! - `engine`: `Broker`, an in-process implementation of that contract.
//! - `topic`: append-only partitions and key-to-partition routing.
//! - `group`: consumer-group membership, assignment, positions and commits.

pub mod engine;
pub mod group;
pub mod record;
pub mod topic;
pub mod transport;

pub use engine::Broker;
pub use record::{Record, RecordMetadata};
pub use transport::{BrokerTransport, DeliveryFuture, RebalanceListener, Subscription};

#[cfg(test)]
mod tests;
