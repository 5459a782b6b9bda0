//! The `persistence` module provides the indexed message store.
//!
//! Messages live in an embedded `sled` database next to two kinds of id
//! sets: one holding every known id and one per sender. The three are only
//! ever written together inside a single sled transaction.

pub mod sled_store;

pub use sled_store::{IndexReport, IndexedStore};
