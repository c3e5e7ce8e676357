// src/broker/session.rs
//
// Backend-neutral seam between the broker components and a concrete client
// library. `Connector` opens sessions, a `Session` is one connection plus
// its channel.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::errors::Result;

/// Exchange routing behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Topic,
    Direct,
    Fanout,
    Headers,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn topic(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ExchangeKind::Topic,
            durable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// Exchange receiving rejected messages, if dead-lettering is enabled.
    pub dead_letter_exchange: Option<String>,
}

impl QueueSpec {
    pub fn durable(name: &str) -> Self {
        Self {
            name: name.to_string(),
            durable: true,
            dead_letter_exchange: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// When the broker may forget a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Broker considers the message settled on delivery (at-most-once).
    Auto,
    /// Settled only after the handler succeeds (at-least-once).
    Manual,
}

/// Properties attached to an outgoing message.
#[derive(Debug, Clone)]
pub struct OutgoingProperties {
    pub message_id: String,
    pub correlation_id: Option<String>,
    pub content_type: String,
    pub persistent: bool,
    pub timestamp: DateTime<Utc>,
}

impl OutgoingProperties {
    pub fn json(message_id: String, correlation_id: Option<String>) -> Self {
        Self {
            message_id,
            correlation_id,
            content_type: "application/json".to_string(),
            persistent: true,
            timestamp: Utc::now(),
        }
    }
}

/// Everything about a delivery except its body.
#[derive(Debug, Clone, Default)]
pub struct DeliveryMetadata {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
    async fn reject(&self, requeue: bool) -> Result<()>;
}

pub struct Delivery {
    pub metadata: DeliveryMetadata,
    pub body: Vec<u8>,
    pub acker: Box<dyn Acknowledger>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("metadata", &self.metadata)
            .field("body_len", &self.body.len())
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// One open connection and channel to a broker.
#[async_trait]
pub trait Session: Send + Sync {
    /// Connection open AND channel open.
    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()>;

    async fn bind(&self, binding: &Binding) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &OutgoingProperties,
    ) -> Result<()>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        ack_mode: AckMode,
        prefetch: u16,
    ) -> Result<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Opens sessions against a broker URL.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn Session>>;

    /// Name used in logs.
    fn backend(&self) -> &'static str;
}
