//! The `transport` module exposes the message facade to WebSocket clients.
//!
//! It defines the JSON request/response protocol and the server loop that
//! turns each request into a `MessageService` call.

pub mod message;
pub mod websocket;
