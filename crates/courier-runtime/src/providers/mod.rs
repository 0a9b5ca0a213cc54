//! Queue client implementations.
//!
//! This module contains concrete implementations of the `QueueConnector` and
//! `QueueSession` traits.

pub mod memory;

pub use memory::{InMemoryBroker, InMemorySession};
