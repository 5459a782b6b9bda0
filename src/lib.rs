//! # PubStash
//!
//! `pubstash` moves messages through a partitioned, consumer-group balanced
//! log and keeps what the consumers receive in an indexed sled store.
//!
//! ## Core Modules
//!
//! The library is structured into several modules, each with a distinct responsibility:
//!
//! - `broker`: The in-process partitioned log, consumer-group coordination and
//!   the `BrokerTransport` contract the rest of the crate talks to.
//! - `config`: Handles loading and managing configuration.
//! - `messaging`: The fire-and-forget publisher and the competing consumer workers.
//! - `model`: The immutable `Message` and its textual wire envelope.
//! - `persistence`: The sled-backed store with its global and per-sender indexes.
//! - `service`: The application facade (create, query, delete, cleanup, demo batches).
//! - `transport`: The WebSocket adapter in front of the facade.
//! - `utils`: Shared utilities, such as error handling and logging.

pub mod broker;
pub mod config;
pub mod messaging;
pub mod model;
pub mod persistence;
pub mod service;
pub mod transport;
pub mod utils;
