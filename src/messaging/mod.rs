//! The `messaging` module connects the model and the store to the broker.
//!
//! - `publisher`: turns a `Message` into an envelope and sends it,
//!   fire-and-forget, keyed by the message id.
//! - `worker`: one competing consumer; receive, decode, save, commit.
//! - `group`: starts a set of parameterized workers under one group id and
//!   stops them gracefully.

pub mod group;
pub mod publisher;
pub mod worker;

pub use group::{ConsumerGroup, GroupHandle, GroupSettings};
pub use publisher::Publisher;
pub use worker::{ConsumerWorker, WorkerState, WorkerStats, WorkerStatsSnapshot};
