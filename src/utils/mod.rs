//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `pubstash` crate.
//!
//! It centralizes the crate-wide error type and the logging bootstrap so that
//! every layer reports failures and diagnostics the same way.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
