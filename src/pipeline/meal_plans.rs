// src/pipeline/meal_plans.rs
use chrono::Utc;
use tracing::{info, warn};

use super::events::MealPlanCreated;
use super::{IngredientRef, MEAL_PLANS_EXCHANGE, MEAL_PLAN_CREATED};
use crate::broker::client::BrokerClient;

/// Announces meal plans after the meal-planning service stored them.
#[derive(Clone)]
pub struct MealPlanNotifier {
    broker: BrokerClient,
}

impl MealPlanNotifier {
    pub fn new(broker: BrokerClient) -> Self {
        Self { broker }
    }

    pub async fn announce_created(
        &self,
        meal_plan_id: &str,
        user_id: Option<&str>,
        available_ingredients: &[IngredientRef],
    ) -> bool {
        let event = MealPlanCreated {
            meal_plan_id: meal_plan_id.to_string(),
            correlation_id: meal_plan_id.to_string(),
            user_id: user_id.map(str::to_string),
            available_ingredients: available_ingredients.to_vec(),
            producer_event: MEAL_PLAN_CREATED.to_string(),
            timestamp: Utc::now(),
        };

        let published = self
            .broker
            .publish(MEAL_PLANS_EXCHANGE, MEAL_PLAN_CREATED, &event)
            .await;
        if published {
            info!(correlation_id = meal_plan_id, "Meal plan creation announced");
        } else {
            warn!(correlation_id = meal_plan_id, "Meal plan stored but not announced");
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
    use crate::pipeline::topology::meal_planning_topology;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_announcement_routes_to_meal_plans_created() {
        let broker = MemoryBroker::new();
        let client = BrokerClient::new(
            Arc::new(ConnectionManager::new("memory://local", broker.connector())),
            DispatcherOptions::default(),
        );
        client.setup_topology(&meal_planning_topology(None)).await.unwrap();

        let notifier = MealPlanNotifier::new(client);
        assert!(notifier.announce_created("mp1", Some("u1"), &["egg".into()]).await);

        assert_eq!(broker.queue_depth("meal_plans_created"), 1);
        assert_eq!(broker.queue_depth("recipe_suggestions"), 0);
        let published = broker.published_with_key(MEAL_PLAN_CREATED);
        let body = &published[0].body;
        assert_eq!(body["meal_plan_id"], "mp1");
        assert_eq!(body["user_id"], "u1");
        assert_eq!(body["available_ingredients"][0]["name"], "egg");
    }
}
