// src/pipeline/shopping_list.rs
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::events::{decode, ingredient_key, required, ShoppingListCreated};
use super::{
    IngredientRef, SHOPPING_LISTS_COLLECTION, SHOPPING_LISTS_EXCHANGE, SHOPPING_LIST_CREATED,
};
use crate::broker::client::BrokerClient;
use crate::broker::consumer::MessageHandler;
use crate::broker::errors::HandlerError;
use crate::broker::session::DeliveryMetadata;
use crate::collaborators::{MealPlan, MealPlanSource};
use crate::store::{DocumentStore, StoreError, StoredDocument};
use crate::telemetry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShoppingItem {
    pub ingredient: String,
    pub quantity: Option<Value>,
    pub checked: bool,
}

#[derive(Debug, Deserialize)]
struct PlanCreatedPayload {
    #[serde(default)]
    meal_plan_id: Option<String>,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    available_ingredients: Vec<IngredientRef>,
}

/// Everything the plan's recipes need minus what is already at hand.
/// Names are compared trimmed and case-insensitively; the first spelling
/// and its quantity are kept.
pub fn shopping_items(plan: &MealPlan, available: &[IngredientRef]) -> Vec<ShoppingItem> {
    let mut seen: HashSet<String> = available.iter().map(IngredientRef::key).collect();
    plan.recipes
        .iter()
        .flat_map(|recipe| recipe.ingredients.iter())
        .filter(|ingredient| !ingredient.name().trim().is_empty())
        .filter(|ingredient| seen.insert(ingredient.key()))
        .map(|ingredient| ShoppingItem {
            ingredient: ingredient.name().trim().to_string(),
            quantity: match ingredient {
                IngredientRef::Detailed { quantity, .. } => quantity.clone(),
                IngredientRef::Name(_) => None,
            },
            checked: false,
        })
        .collect()
}

/// Consumer of the `meal_plans_created` queue.
pub struct ShoppingListHandler {
    store: Arc<dyn DocumentStore>,
    meal_plans: Arc<dyn MealPlanSource>,
    broker: BrokerClient,
}

impl ShoppingListHandler {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        meal_plans: Arc<dyn MealPlanSource>,
        broker: BrokerClient,
    ) -> Self {
        Self {
            store,
            meal_plans,
            broker,
        }
    }

    async fn build_document(
        &self,
        meal_plan_id: &str,
        correlation_id: &str,
        user_id: Option<String>,
        available: &[IngredientRef],
    ) -> Result<Value, HandlerError> {
        let plan = self
            .meal_plans
            .fetch_meal_plan(meal_plan_id)
            .await
            .map_err(|err| HandlerError::Collaborator {
                correlation_id: correlation_id.to_string(),
                reason: err.to_string(),
            })?;

        let (name, user_id, items, error) = match plan {
            Some(plan) => {
                let items = shopping_items(&plan, available);
                let name = plan
                    .name
                    .clone()
                    .map(|n| format!("Shopping list for {}", n))
                    .unwrap_or_else(|| format!("Shopping list for meal plan {}", meal_plan_id));
                (name, user_id.or(plan.user_id), items, None)
            }
            None => {
                warn!(correlation_id, "Meal plan not found, storing empty shopping list");
                (
                    format!("Shopping list for meal plan {}", meal_plan_id),
                    user_id,
                    Vec::new(),
                    Some(format!("Meal plan {} not found", meal_plan_id)),
                )
            }
        };

        let mut document = json!({
            "meal_plan_id": meal_plan_id,
            "correlation_id": correlation_id,
            "name": name,
            "item_count": items.len(),
            "items": items,
            "created_at": Utc::now().to_rfc3339(),
        });
        if let Some(fields) = document.as_object_mut() {
            if let Some(user_id) = user_id {
                fields.insert("user_id".into(), Value::String(user_id));
            }
            if let Some(error) = error {
                fields.insert("error".into(), Value::String(error));
            }
        }
        Ok(document)
    }

    async fn notify(
        &self,
        stored: &StoredDocument,
        meal_plan_id: &str,
        correlation_id: &str,
    ) -> Result<(), HandlerError> {
        let item_count = stored.document["item_count"].as_u64().unwrap_or(0) as usize;
        let event = ShoppingListCreated {
            meal_plan_id: meal_plan_id.to_string(),
            correlation_id: correlation_id.to_string(),
            user_id: stored.document["user_id"].as_str().map(str::to_string),
            shopping_list_id: stored.id.clone(),
            item_count,
            producer_event: SHOPPING_LIST_CREATED.to_string(),
            timestamp: Utc::now(),
        };
        if !self
            .broker
            .publish(SHOPPING_LISTS_EXCHANGE, SHOPPING_LIST_CREATED, &event)
            .await
        {
            return Err(HandlerError::Publish {
                correlation_id: correlation_id.to_string(),
            });
        }
        info!(
            correlation_id,
            shopping_list_id = %stored.id,
            item_count,
            "Shopping list announced"
        );
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for ShoppingListHandler {
    async fn handle(&self, metadata: &DeliveryMetadata, body: &[u8]) -> Result<(), HandlerError> {
        let payload: PlanCreatedPayload = decode(body)?;
        let meal_plan_id = required("meal_plan_id", payload.meal_plan_id)?;
        let correlation_id = payload
            .correlation_id
            .or_else(|| metadata.correlation_id.clone())
            .unwrap_or_else(|| meal_plan_id.clone());
        let store_error = |err: StoreError| HandlerError::Store {
            correlation_id: correlation_id.clone(),
            reason: err.to_string(),
        };

        let existing = self
            .store
            .find(SHOPPING_LISTS_COLLECTION, &meal_plan_id)
            .await
            .map_err(store_error)?;
        let stored = match existing {
            Some(existing) => {
                debug!(correlation_id = %correlation_id, "Shopping list already exists, re-announcing");
                existing
            }
            None => {
                let document = self
                    .build_document(
                        &meal_plan_id,
                        &correlation_id,
                        payload.user_id,
                        &payload.available_ingredients,
                    )
                    .await?;
                let stored = self
                    .store
                    .insert_if_absent(SHOPPING_LISTS_COLLECTION, &meal_plan_id, document)
                    .await
                    .map_err(store_error)?;
                if stored.created {
                    telemetry::record_shopping_list(
                        stored.document.get("error").is_none(),
                        stored.document["item_count"].as_u64().unwrap_or(0) as usize,
                    );
                    info!(
                        correlation_id = %correlation_id,
                        shopping_list_id = %stored.id,
                        "Shopping list persisted"
                    );
                }
                stored
            }
        };

        self.notify(&stored, &meal_plan_id, &correlation_id).await
    }
}
