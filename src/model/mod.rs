//! The `model` module holds the `Message` value object that flows through the
//! whole pipeline, together with the textual envelope used on the wire.

pub mod envelope;
pub mod message;

pub use envelope::MessageEnvelope;
pub use message::{Message, MessageType};
