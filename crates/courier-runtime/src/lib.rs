//! # Courier Runtime
//!
//! Pooled, transaction-aware queue connections.
//!
//! This library provides:
//! - A bounded pool of connected sessions per destination, backed by an
//!   expiring LIFO store that disconnects sessions idle past their time to live
//! - Automatic discarding of sessions whose operations failed, without leaking
//!   pool capacity
//! - An explicit transaction handle with two-phase commit over enlisted sessions
//! - Producers that commit per call or defer to the transaction they are
//!   enlisted in, shared by every send of that transaction to a destination
//! - Consumers whose receives are undone when their transaction does not commit
//! - An in-memory broker for tests and development
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for queue, pool and transaction operations
//! - [`clock`] - Overridable time source
//! - [`pooling`] - Bounded pool and expiring store
//! - [`message`] - Destinations, wire messages and application messages
//! - [`codec`] - Header mapping between application and wire messages
//! - [`client`] - Queue client capability traits
//! - [`providers`] - Queue client implementations
//! - [`transaction`] - Transaction coordinator
//! - [`sessions`] - Pooled sessions and transactional wrappers
//! - [`provider`] - Producer and consumer providers

// Module declarations
pub mod client;
pub mod clock;
pub mod codec;
pub mod error;
pub mod message;
pub mod pooling;
pub mod provider;
pub mod providers;
pub mod sessions;
pub mod transaction;

// Re-export commonly used types at crate root for convenience
pub use client::{
    purge, MessageConsumer, MessageProducer, QueueConnector, QueueSession, SessionMode,
};
pub use clock::Clock;
pub use error::{
    ConfigurationError, QueueError, SerializationError, TransactionError, ValidationError,
};
pub use message::{
    DeliveryMode, Destination, HeaderInfo, MessageId, MessageIntent, PropertyValue,
    QueueMessage, TransportMessage,
};
pub use pooling::{Expirable, Pool, PoolLease, ResourceFactory, StackStore};
pub use provider::{ConsumerProvider, PoolSettings, ProducerProvider, SessionPool};
pub use providers::InMemoryBroker;
pub use transaction::{
    run_in_transaction, EnlistmentNotification, IsolationLevel, Transaction, TransactionId,
    TransactionOptions, TransactionOutcome, TransactionStatus, Vote,
};
