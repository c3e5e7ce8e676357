// src/pipeline/scanner.rs
use chrono::Utc;
use tracing::{info, warn};

use super::events::IngredientsDetected;
use super::{IngredientRef, INGREDIENTS_EXCHANGE, INGREDIENT_DETECTED};
use crate::broker::client::BrokerClient;

/// Announces finished ingredient scans.
#[derive(Clone)]
pub struct ScanNotifier {
    broker: BrokerClient,
}

impl ScanNotifier {
    pub fn new(broker: BrokerClient) -> Self {
        Self { broker }
    }

    /// Publishes `ingredient.detected` for the scan. The scan result is
    /// already stored, so a failed publish only gets logged.
    pub async fn publish_scan_result(
        &self,
        scan_id: &str,
        user_id: &str,
        ingredients: &[IngredientRef],
    ) -> bool {
        let event = IngredientsDetected {
            scan_id: scan_id.to_string(),
            correlation_id: scan_id.to_string(),
            user_id: user_id.to_string(),
            ingredients: ingredients.to_vec(),
            producer_event: INGREDIENT_DETECTED.to_string(),
            timestamp: Utc::now(),
        };

        let published = self
            .broker
            .publish(INGREDIENTS_EXCHANGE, INGREDIENT_DETECTED, &event)
            .await;
        if published {
            info!(
                correlation_id = scan_id,
                ingredient_count = ingredients.len(),
                "Scan result published"
            );
        } else {
            warn!(correlation_id = scan_id, "Scan result stored but not announced");
        }
        published
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::connection::ConnectionManager;
    use crate::broker::consumer::DispatcherOptions;
    use crate::broker::memory::MemoryBroker;
    use crate::pipeline::topology::scanner_topology;
    use std::sync::Arc;
    use std::time::Duration;

    fn notifier(broker: &MemoryBroker) -> (ScanNotifier, BrokerClient) {
        let connection = Arc::new(
            ConnectionManager::new("memory://local", broker.connector())
                .with_reconnect_policy(1, Duration::from_millis(1)),
        );
        let client = BrokerClient::new(connection, DispatcherOptions::default());
        (ScanNotifier::new(client.clone()), client)
    }

    #[tokio::test]
    async fn test_scan_result_lands_in_detected_ingredients() {
        let broker = MemoryBroker::new();
        let (notifier, client) = notifier(&broker);
        client.setup_topology(&scanner_topology(None)).await.unwrap();

        let ingredients = vec![IngredientRef::from("egg"), IngredientRef::Name("milk".into())];
        assert!(notifier.publish_scan_result("s1", "u1", &ingredients).await);

        let published = broker.published_with_key(INGREDIENT_DETECTED);
        assert_eq!(published.len(), 1);
        let body = &published[0].body;
        assert_eq!(body["scan_id"], "s1");
        assert_eq!(body["correlation_id"], "s1");
        assert_eq!(body["user_id"], "u1");
        assert_eq!(body["producer_event"], INGREDIENT_DETECTED);
        assert_eq!(body["ingredients"][0]["name"], "egg");
        assert_eq!(body["ingredients"][1], "milk");
        assert_eq!(published[0].correlation_id.as_deref(), Some("s1"));
        assert_eq!(broker.queue_depth("detected_ingredients"), 1);
    }

    #[tokio::test]
    async fn test_broker_outage_is_not_an_error() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let (notifier, _) = notifier(&broker);

        assert!(!notifier.publish_scan_result("s1", "u1", &[]).await);
    }
}
