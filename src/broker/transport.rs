//! Broker transport contract
//!
//! The publisher and the consumer workers only ever talk to the log through
//! [`BrokerTransport`]. Partition ownership belongs to the transport: a
//! worker learns which partitions it owns through [`RebalanceListener`]
//! callbacks or by asking [`BrokerTransport::assigned_partitions`], and never
//! assumes that set is stable between two polls.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::broker::record::{Record, RecordMetadata};
use crate::utils::Result;

/// Resolves once the broker acknowledged (or refused) an appended record.
pub type DeliveryFuture = Pin<Box<dyn Future<Output = Result<RecordMetadata>> + Send>>;

/// Handle identifying one group member's subscription to a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub topic: String,
    pub group_id: String,
    pub member_id: String,
}

/// Receives partition ownership changes for one group member.
///
/// Revocations are reported before the new owner can fetch, so a listener
/// sees them while its last batch may still be in flight. Anything it has
/// not committed by then is redelivered to the next owner.
pub trait RebalanceListener: Send + Sync {
    fn on_partitions_revoked(&self, member_id: &str, partitions: &[u32]);
    fn on_partitions_assigned(&self, member_id: &str, partitions: &[u32]);
}

#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Appends `payload` to the partition chosen by `key`.
    ///
    /// Returns as soon as the send is accepted; the future carries the
    /// acknowledgement or a [`crate::utils::Error::Delivery`].
    fn send(&self, topic: &str, key: &str, payload: String) -> DeliveryFuture;

    /// Joins `group_id` on `topic` as `member_id`, triggering a rebalance.
    fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        member_id: &str,
        listener: Option<Arc<dyn RebalanceListener>>,
    ) -> Result<Subscription>;

    /// Fetches up to `max_records` from the member's partitions, waiting at
    /// most `timeout` for something to arrive. An empty batch means the wait
    /// timed out.
    async fn poll(
        &self,
        subscription: &Subscription,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<Record>>;

    /// Marks the record at `offset` as processed; the group resumes after it.
    /// Rejected once the member no longer owns `partition`.
    fn commit(&self, subscription: &Subscription, partition: u32, offset: u64) -> Result<()>;

    /// Rewinds the member's fetch position so `offset` is fetched again.
    fn seek(&self, subscription: &Subscription, partition: u32, offset: u64) -> Result<()>;

    fn assigned_partitions(&self, subscription: &Subscription) -> Vec<u32>;

    /// Leaves the group; its partitions move to the remaining members.
    fn unsubscribe(&self, subscription: &Subscription);
}
