use std::sync::Arc;

use futures::FutureExt;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

use crate::broker::{BrokerTransport, DeliveryFuture, RecordMetadata};
use crate::model::{Message, MessageEnvelope};
use crate::utils::Result;

/// Sends messages to one topic of a broker transport.
///
/// The message id is the partitioning key, so records that reuse an id keep
/// their relative order. Retrying failed sends is left to the transport.
#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn BrokerTransport>,
    topic: String,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("topic", &self.topic)
            .finish()
    }
}

impl Publisher {
    pub fn new(transport: Arc<dyn BrokerTransport>, topic: impl Into<String>) -> Self {
        Self {
            transport,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Hands `message` to the transport and returns without waiting for the
    /// acknowledgement, which is only logged when it arrives.
    ///
    /// Fails synchronously only when the envelope cannot be encoded.
    pub fn publish(&self, message: &Message) -> Result<()> {
        let ack = self.submit(message)?;
        let id = message.id().to_string();
        let topic = self.topic.clone();

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { log_ack(&id, &topic, &ack.await) });
            }
            // outside a runtime we can only report acks that are already settled
            Err(_) => match ack.now_or_never() {
                Some(result) => log_ack(&id, &topic, &result),
                None => warn!(id = %id, topic = %topic, "No runtime to await the acknowledgement"),
            },
        }
        Ok(())
    }

    /// Like [`Publisher::publish`] but waits for the acknowledgement, so a
    /// transport failure comes back as [`crate::utils::Error::Delivery`].
    pub async fn publish_and_wait(&self, message: &Message) -> Result<RecordMetadata> {
        let result = self.submit(message)?.await;
        log_ack(message.id(), &self.topic, &result);
        result
    }

    fn submit(&self, message: &Message) -> Result<DeliveryFuture> {
        let payload = MessageEnvelope::from(message)
            .to_json()
            .inspect_err(|e| error!(id = message.id(), error = %e, "Failed to serialize message"))?;
        Ok(self.transport.send(&self.topic, message.id(), payload))
    }
}

fn log_ack(id: &str, topic: &str, result: &Result<RecordMetadata>) {
    match result {
        Ok(meta) => info!(
            id,
            topic,
            partition = meta.partition,
            offset = meta.offset,
            "Message sent successfully"
        ),
        Err(e) => error!(id, topic, error = %e, "Failed to send message"),
    }
}
