//! # Courier Transport
//!
//! Transactional message delivery on top of [`courier_runtime`].
//!
//! This library provides:
//! - Workers that receive from an input queue and hand each message to the
//!   application, optionally inside one transaction per receive cycle
//! - Per-message retry accounting with dead-lettering to an error queue
//! - Immediate dead-lettering of messages whose body cannot be decoded
//! - Optional forwarding of every received message to an audit queue
//! - Receive back-off for workers whose receives fail
//! - Layered configuration from files and `COURIER__` environment variables
//!
//! ## Module Organization
//!
//! - [`config`] - Transport configuration and alias resolution
//! - [`error`] - Transport error type
//! - [`backoff`] - Receive back-off sequence
//! - [`retry_ledger`] - Failure counts per message
//! - [`serializer`] - Message body serialization
//! - [`transport`] - Delivery pipeline, workers and lifecycle

pub mod backoff;
pub mod config;
pub mod error;
pub mod retry_ledger;
pub mod serializer;
pub mod transport;

pub use backoff::ReceiveBackoff;
pub use config::TransportConfig;
pub use error::TransportError;
pub use retry_ledger::RetryLedger;
pub use serializer::{JsonMessageSerializer, MessageSerializer};
pub use transport::{CycleOutcome, ProcessingContext, Transport, TransportObserver};
