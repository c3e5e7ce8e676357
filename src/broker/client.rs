use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use super::amqp::AmqpConnector;
use super::connection::{redact_url, ConnectionManager};
use super::consumer::{ConsumerDispatcher, DispatcherOptions};
use super::errors::Result;
#[cfg(any(test, feature = "memory-broker"))]
use super::memory::MemoryBroker;
use super::publisher::Publisher;
use super::session::Connector;
use super::topology::{Topology, TopologyManager};
use crate::config::{BackendKind, PipelineConfig};

/// Broker implementation behind a [`BrokerClient`].
#[derive(Clone)]
pub enum BrokerBackend {
    Amqp,
    #[cfg(any(test, feature = "memory-broker"))]
    Memory(MemoryBroker),
}

impl BrokerBackend {
    /// The in-process broker only exists in builds with the `memory-broker`
    /// feature.
    pub fn for_kind(kind: BackendKind) -> Result<Self> {
        match kind {
            BackendKind::Amqp => Ok(BrokerBackend::Amqp),
            #[cfg(any(test, feature = "memory-broker"))]
            BackendKind::Memory => Ok(BrokerBackend::Memory(MemoryBroker::new())),
            #[cfg(not(any(test, feature = "memory-broker")))]
            BackendKind::Memory => Err(super::errors::BrokerError::Connection(
                "the memory broker backend needs the 'memory-broker' feature".into(),
            )),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        match self {
            BrokerBackend::Amqp => Arc::new(AmqpConnector::default()),
            #[cfg(any(test, feature = "memory-broker"))]
            BrokerBackend::Memory(broker) => broker.connector(),
        }
    }
}

/// One process's view of the broker: the shared connection plus the
/// topology, publish and consume operations built on it.
#[derive(Clone)]
pub struct BrokerClient {
    connection: Arc<ConnectionManager>,
    topology: TopologyManager,
    publisher: Publisher,
    options: DispatcherOptions,
}

impl BrokerClient {
    pub fn new(connection: Arc<ConnectionManager>, options: DispatcherOptions) -> Self {
        Self {
            topology: TopologyManager::new(connection.clone()),
            publisher: Publisher::new(connection.clone()),
            connection,
            options,
        }
    }

    pub fn from_config(config: &PipelineConfig, backend: &BrokerBackend) -> Self {
        let connection = ConnectionManager::new(&config.rabbitmq_uri, backend.connector())
            .with_retry_policy(config.retry_policy());
        info!(
            backend = connection.backend(),
            uri = %redact_url(&config.rabbitmq_uri),
            "Broker client configured"
        );
        Self::new(Arc::new(connection), config.dispatcher_options())
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub async fn connect(&self) -> bool {
        self.connection.connect().await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub async fn setup_topology(&self, topology: &Topology) -> Result<()> {
        self.topology.setup_topology(topology).await
    }

    pub fn topology_manager(&self) -> &TopologyManager {
        &self.topology
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
    ) -> bool {
        self.publisher.publish(exchange, routing_key, message).await
    }

    /// Dispatcher whose consumers re-declare `topology` after reconnecting.
    pub fn dispatcher(&self, topology: Option<Topology>) -> ConsumerDispatcher {
        let dispatcher = ConsumerDispatcher::new(self.connection.clone(), self.options.clone());
        match topology {
            Some(topology) => dispatcher.with_topology(topology),
            None => dispatcher,
        }
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }

    /// Cancels any in-flight connection retries, then closes.
    pub async fn shutdown(&self) {
        self.connection.shutdown().await;
    }
}
