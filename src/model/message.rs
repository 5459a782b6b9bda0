//! Message definitions
//!
//! `Message` is immutable once built: every field is private and only the
//! factory, the validated constructor and the decoders can produce one.
//!
//! Notes on fields:
//! - `id`: opaque unique id, a v4 UUID when created by the factory
//! - `sender`: free text, used as the key of the secondary index
//! - `timestamp`: local wall-clock date-time without a zone, stamped once
//! - `message_type`: one of the fixed [`MessageType`] variants

use std::fmt;
use std::str::FromStr;

use chrono::{Local, NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::utils::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Info,
    Warning,
    Error,
    Success,
    Order,
    Notification,
    Event,
}

impl MessageType {
    pub const ALL: [MessageType; 7] = [
        MessageType::Info,
        MessageType::Warning,
        MessageType::Error,
        MessageType::Success,
        MessageType::Order,
        MessageType::Notification,
        MessageType::Event,
    ];

    /// The enum name as it travels on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Info => "INFO",
            MessageType::Warning => "WARNING",
            MessageType::Error => "ERROR",
            MessageType::Success => "SUCCESS",
            MessageType::Order => "ORDER",
            MessageType::Notification => "NOTIFICATION",
            MessageType::Event => "EVENT",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = Error;

    /// Exact enum names only; anything else is an unrecognized type.
    fn from_str(s: &str) -> Result<Self> {
        MessageType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Serialization(format!("unrecognized message type '{s}'")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: String,
    content: String,
    sender: String,
    timestamp: NaiveDateTime,
    #[serde(rename = "type")]
    message_type: MessageType,
}

impl Message {
    /// Builds a new message with a fresh id and the current local time.
    ///
    /// Blank `content` or `sender` count as absent and are rejected with
    /// [`Error::InvalidArgument`].
    pub fn create(
        content: impl Into<String>,
        sender: impl Into<String>,
        message_type: MessageType,
    ) -> Result<Self> {
        Self::new(
            Uuid::new_v4().to_string(),
            content,
            sender,
            Local::now().naive_local(),
            message_type,
        )
    }

    /// Rebuilds a message from known parts, e.g. a decoded envelope or a
    /// backdated fixture.
    pub fn new(
        id: impl Into<String>,
        content: impl Into<String>,
        sender: impl Into<String>,
        timestamp: NaiveDateTime,
        message_type: MessageType,
    ) -> Result<Self> {
        let message = Self {
            id: id.into(),
            content: content.into(),
            sender: sender.into(),
            timestamp,
            message_type,
        };
        message.validate()?;
        Ok(message)
    }

    /// Checks the presence invariant. Decoders call this after serde has
    /// filled the struct, since serde alone accepts empty strings.
    pub(crate) fn validate(&self) -> Result<()> {
        require("id", &self.id)?;
        require("content", &self.content)?;
        require("sender", &self.sender)?;
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn is_urgent(&self) -> bool {
        matches!(self.message_type, MessageType::Error | MessageType::Warning)
    }

    /// Age relative to the current local time.
    pub fn age(&self) -> TimeDelta {
        Local::now().naive_local() - self.timestamp
    }

    pub fn is_older_than(&self, max_age: TimeDelta) -> bool {
        self.age() > max_age
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidArgument(format!(
            "message {field} cannot be empty"
        )));
    }
    Ok(())
}
