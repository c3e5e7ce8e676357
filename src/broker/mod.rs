// src/broker/mod.rs
pub mod amqp;
pub mod client;
pub mod connection;
pub mod consumer;
pub mod errors;
#[cfg(any(test, feature = "memory-broker"))]
pub mod memory;
pub mod publisher;
pub mod session;
pub mod topology;

pub use client::{BrokerBackend, BrokerClient};
pub use connection::{Backoff, ConnectionManager, RetryPolicy};
pub use consumer::{
    ConsumerDispatcher, ConsumerHandle, ConsumerState, DispatcherOptions, HandlerRetry,
    MessageHandler,
};
pub use errors::{BrokerError, HandlerError, Result};
#[cfg(any(test, feature = "memory-broker"))]
pub use memory::{topic_matches, MemoryBroker, PublishedRecord};
pub use publisher::Publisher;
pub use session::{
    AckMode, Binding, DeliveryMetadata, ExchangeKind, ExchangeSpec, OutgoingProperties, QueueSpec,
};
pub use topology::{Topology, TopologyManager};
