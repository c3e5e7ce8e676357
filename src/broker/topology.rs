use std::sync::Arc;

use tracing::{error, info};

use super::connection::ConnectionManager;
use super::errors::{BrokerError, Result};
use super::session::{Binding, ExchangeKind, ExchangeSpec, QueueSpec};

/// A fixed set of exchanges, queues and bindings a service relies on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<Binding>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a durable topic exchange.
    pub fn exchange(mut self, name: &str) -> Self {
        if !self.exchanges.iter().any(|e| e.name == name) {
            self.exchanges.push(ExchangeSpec::topic(name));
        }
        self
    }

    /// Adds a durable queue.
    pub fn queue(mut self, name: &str) -> Self {
        if !self.queues.iter().any(|q| q.name == name) {
            self.queues.push(QueueSpec::durable(name));
        }
        self
    }

    pub fn bind(mut self, queue: &str, exchange: &str, routing_key: &str) -> Self {
        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
        self
    }

    /// Routes rejected messages of every queue to `exchange`, collected in
    /// a `<exchange>.messages` queue.
    pub fn with_dead_letter(mut self, exchange: &str) -> Self {
        for queue in &mut self.queues {
            queue.dead_letter_exchange = Some(exchange.to_string());
        }
        let parking = format!("{}.messages", exchange);
        self.exchange(exchange)
            .queue(&parking)
            .bind(&parking, exchange, "#")
    }

    pub fn has_binding(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.routing_key == routing_key)
    }
}

/// Declares topology through the shared connection, connecting lazily.
#[derive(Clone)]
pub struct TopologyManager {
    connection: Arc<ConnectionManager>,
}

impl TopologyManager {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    pub async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        self.declare_exchange_spec(&ExchangeSpec {
            name: name.to_string(),
            kind,
            durable,
        })
        .await
    }

    pub async fn declare_queue(&self, name: &str, durable: bool) -> Result<()> {
        self.declare_queue_spec(&QueueSpec {
            name: name.to_string(),
            durable,
            dead_letter_exchange: None,
        })
        .await
    }

    pub async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        let session = self.connection.session().await?;
        session.bind(&binding).await.map_err(|e| {
            e.into_topology(&format!(
                "binding '{}' to '{}' with '{}'",
                queue, exchange, routing_key
            ))
        })?;
        info!(
            "Queue '{}' bound to exchange '{}' with routing key '{}'",
            queue, exchange, routing_key
        );
        Ok(())
    }

    pub async fn declare_exchange_spec(&self, spec: &ExchangeSpec) -> Result<()> {
        let session = self.connection.session().await?;
        session
            .declare_exchange(spec)
            .await
            .map_err(|e| e.into_topology(&format!("exchange '{}'", spec.name)))?;
        info!("Exchange '{}' ({}) declared", spec.name, spec.kind);
        Ok(())
    }

    pub async fn declare_queue_spec(&self, spec: &QueueSpec) -> Result<()> {
        let session = self.connection.session().await?;
        session
            .declare_queue(spec)
            .await
            .map_err(|e| e.into_topology(&format!("queue '{}'", spec.name)))?;
        info!("Queue '{}' declared", spec.name);
        Ok(())
    }

    /// Declares every exchange, then every queue, then every binding.
    /// Safe to run repeatedly.
    pub async fn setup_topology(&self, topology: &Topology) -> Result<()> {
        let result = self.declare_all(topology).await;
        if let Err(err) = &result {
            error!("Failed to set up broker topology: {}", err);
            if matches!(err, BrokerError::Topology(_)) {
                // A refused declaration closes the channel on a real broker.
                self.connection.mark_disconnected().await;
            }
        }
        result
    }

    async fn declare_all(&self, topology: &Topology) -> Result<()> {
        for exchange in &topology.exchanges {
            self.declare_exchange_spec(exchange).await?;
        }
        for queue in &topology.queues {
            self.declare_queue_spec(queue).await?;
        }
        for binding in &topology.bindings {
            self.bind(&binding.queue, &binding.exchange, &binding.routing_key)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use std::time::Duration;

    fn manager(broker: &MemoryBroker) -> TopologyManager {
        let connection = ConnectionManager::new("memory://local", broker.connector())
            .with_reconnect_policy(1, Duration::from_millis(1));
        TopologyManager::new(Arc::new(connection))
    }

    #[test]
    fn test_builder_deduplicates() {
        let topology = Topology::new()
            .exchange("ingredients")
            .exchange("ingredients")
            .queue("detected_ingredients")
            .bind("detected_ingredients", "ingredients", "ingredient.detected")
            .bind("detected_ingredients", "ingredients", "ingredient.detected");
        assert_eq!(topology.exchanges.len(), 1);
        assert_eq!(topology.queues.len(), 1);
        assert_eq!(topology.bindings.len(), 1);
    }

    #[test]
    fn test_dead_letter_applies_to_existing_queues() {
        let topology = Topology::new().queue("a").queue("b").with_dead_letter("dlx");
        assert!(topology
            .queues
            .iter()
            .filter(|q| q.name != "dlx.messages")
            .all(|q| q.dead_letter_exchange.as_deref() == Some("dlx")));
        assert!(topology.has_binding("dlx.messages", "dlx", "#"));
    }

    #[tokio::test]
    async fn test_declarations_connect_lazily() {
        let broker = MemoryBroker::new();
        let topology = manager(&broker);
        topology
            .declare_exchange("meal_plans", ExchangeKind::Topic, true)
            .await
            .unwrap();
        assert_eq!(broker.connections_opened(), 1);
        assert_eq!(
            broker.exchange("meal_plans").map(|e| e.kind),
            Some(ExchangeKind::Topic)
        );
    }

    #[tokio::test]
    async fn test_bind_to_missing_exchange_is_topology_error() {
        let broker = MemoryBroker::new();
        let topology = manager(&broker);
        topology.declare_queue("orphan", true).await.unwrap();
        let err = topology.bind("orphan", "nowhere", "x.y").await.unwrap_err();
        assert!(matches!(err, BrokerError::Topology(_)));
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_connection_error() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let topology = manager(&broker);
        let err = topology
            .setup_topology(&Topology::new().exchange("ingredients"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Connection(_)));
    }
}
