//! The transport envelope
//!
//! Every field is plain text: the timestamp is an ISO-8601 local date-time
//! without a zone and the type is the enum name. Fields are optional on the
//! way in so that a record with a missing field maps to
//! [`Error::InvalidArgument`] instead of a generic decode failure.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::model::message::{Message, MessageType};
use crate::utils::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default, rename = "type")]
    pub message_type: Option<String>,
}

impl MessageEnvelope {
    /// Encodes the envelope to the JSON text carried as the record payload.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Decodes a record payload straight into a validated message.
    pub fn decode(payload: &str) -> Result<Message> {
        Self::from_json(payload)?.into_message()
    }

    pub fn into_message(self) -> Result<Message> {
        let id = present("id", self.id)?;
        let content = present("content", self.content)?;
        let sender = present("sender", self.sender)?;
        let timestamp = present("timestamp", self.timestamp)?;
        let message_type = present("type", self.message_type)?;

        let timestamp = timestamp
            .parse::<NaiveDateTime>()
            .map_err(|e| Error::Serialization(format!("bad timestamp '{timestamp}': {e}")))?;
        let message_type = message_type.parse::<MessageType>()?;

        Message::new(id, content, sender, timestamp, message_type)
    }
}

impl From<&Message> for MessageEnvelope {
    fn from(message: &Message) -> Self {
        Self {
            id: Some(message.id().to_string()),
            content: Some(message.content().to_string()),
            sender: Some(message.sender().to_string()),
            timestamp: Some(message.timestamp().format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            message_type: Some(message.message_type().as_str().to_string()),
        }
    }
}

impl TryFrom<MessageEnvelope> for Message {
    type Error = Error;

    fn try_from(envelope: MessageEnvelope) -> Result<Self> {
        envelope.into_message()
    }
}

fn present(field: &str, value: Option<String>) -> Result<String> {
    value.ok_or_else(|| Error::InvalidArgument(format!("envelope is missing '{field}'")))
}
