use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};
use uuid::Uuid;

use super::connection::ConnectionManager;
use super::errors::Result;
use super::session::OutgoingProperties;
use crate::telemetry;

/// Fire-and-forget JSON publisher over the shared connection.
#[derive(Clone)]
pub struct Publisher {
    connection: Arc<ConnectionManager>,
}

impl Publisher {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    /// Publishes `message` as persistent JSON. Returns `false` instead of
    /// failing; the caller decides whether that matters.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
    ) -> bool {
        match self.try_publish(exchange, routing_key, message).await {
            Ok(()) => true,
            Err(err) => {
                error!(
                    exchange,
                    routing_key,
                    "Failed to publish message: {}",
                    err
                );
                false
            }
        }
    }

    /// Same as [`Publisher::publish`] with the failure reason.
    pub async fn try_publish<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
    ) -> Result<()> {
        let result = self.send(exchange, routing_key, message).await;
        telemetry::record_publish(exchange, routing_key, result.is_ok());
        result
    }

    async fn send<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
    ) -> Result<()> {
        let value = serde_json::to_value(message)?;
        let correlation_id = value
            .get("correlation_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let payload = serde_json::to_vec(&value)?;

        let session = self.connection.session().await?;
        let properties = OutgoingProperties::json(Uuid::new_v4().to_string(), correlation_id);

        if let Err(err) = session
            .publish(exchange, routing_key, &payload, &properties)
            .await
        {
            if err.is_disconnect() {
                self.connection.mark_disconnected().await;
            }
            return Err(err);
        }

        info!(
            correlation_id = properties.correlation_id.as_deref().unwrap_or("-"),
            "Published message to exchange '{}' with routing key '{}'",
            exchange,
            routing_key
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::topology::{Topology, TopologyManager};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;

    async fn setup(broker: &MemoryBroker) -> Publisher {
        let connection = Arc::new(
            ConnectionManager::new("memory://local", broker.connector())
                .with_reconnect_policy(2, Duration::from_millis(1)),
        );
        TopologyManager::new(connection.clone())
            .setup_topology(
                &Topology::new()
                    .exchange("ingredients")
                    .queue("detected_ingredients")
                    .bind("detected_ingredients", "ingredients", "ingredient.detected"),
            )
            .await
            .unwrap();
        Publisher::new(connection)
    }

    #[tokio::test]
    async fn test_publish_marks_message_persistent_json() {
        let broker = MemoryBroker::new();
        let publisher = setup(&broker).await;

        let message = json!({"correlation_id": "s1", "scan_id": "s1"});
        assert!(publisher.publish("ingredients", "ingredient.detected", &message).await);

        let published = broker.published_with_key("ingredient.detected");
        assert_eq!(published.len(), 1);
        assert!(published[0].persistent);
        assert_eq!(published[0].content_type, "application/json");
        assert_eq!(published[0].correlation_id.as_deref(), Some("s1"));
        assert_eq!(broker.queue_depth("detected_ingredients"), 1);
    }

    #[tokio::test]
    async fn test_publish_reconnects_after_connection_loss() {
        let broker = MemoryBroker::new();
        let publisher = setup(&broker).await;
        broker.drop_connections();

        assert!(publisher.publish("ingredients", "ingredient.detected", &json!({})).await);
        assert_eq!(broker.connections_opened(), 2);
    }

    #[tokio::test]
    async fn test_publish_returns_false_when_unreachable() {
        let broker = MemoryBroker::new();
        let publisher = setup(&broker).await;
        broker.set_reachable(false);

        assert!(!publisher.publish("ingredients", "ingredient.detected", &json!({})).await);
    }

    #[tokio::test]
    async fn test_publish_returns_false_for_unknown_exchange() {
        let broker = MemoryBroker::new();
        let publisher = setup(&broker).await;

        assert!(!publisher.publish("nowhere", "ingredient.detected", &json!({})).await);
    }

    #[tokio::test]
    async fn test_unserializable_message_is_rejected() {
        let broker = MemoryBroker::new();
        let publisher = setup(&broker).await;
        let mut message = BTreeMap::new();
        message.insert((1u8, 2u8), "tuple keys are not JSON");

        assert!(!publisher.publish("ingredients", "ingredient.detected", &message).await);
        assert!(broker.published().is_empty());
    }
}
