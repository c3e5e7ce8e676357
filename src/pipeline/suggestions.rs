// src/pipeline/suggestions.rs
//
// Meal-planning side of `ingredient.detected`: look up recipes for the
// scanned ingredients, persist a suggestion, announce it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::events::{decode, dedup_ingredient_names, required, RecipeSuggested};
use super::{IngredientRef, MEAL_PLANS_EXCHANGE, RECIPE_SUGGESTION, SUGGESTIONS_COLLECTION};
use crate::broker::client::BrokerClient;
use crate::broker::consumer::MessageHandler;
use crate::broker::errors::HandlerError;
use crate::broker::session::DeliveryMetadata;
use crate::collaborators::RecipeLookup;
use crate::store::{DocumentStore, StoredDocument};
use crate::telemetry;

const NO_RECIPES_FOUND: &str = "No recipes found for the detected ingredients";

#[derive(Debug, Deserialize)]
struct DetectedPayload {
    #[serde(default)]
    scan_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    ingredients: Vec<IngredientRef>,
}

/// Consumer of the `detected_ingredients` queue.
pub struct SuggestionHandler {
    store: Arc<dyn DocumentStore>,
    recipes: Arc<dyn RecipeLookup>,
    broker: BrokerClient,
}

fn lookup_status(document: &Value) -> &'static str {
    match document.get("error").and_then(Value::as_str) {
        None => "found",
        Some(NO_RECIPES_FOUND) => "empty",
        Some(_) => "lookup_failed",
    }
}

/// Suggestions are unique per user and scan.
pub fn suggestion_key(user_id: &str, scan_id: &str) -> String {
    format!("{}:{}", user_id, scan_id)
}

impl SuggestionHandler {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        recipes: Arc<dyn RecipeLookup>,
        broker: BrokerClient,
    ) -> Self {
        Self {
            store,
            recipes,
            broker,
        }
    }

    async fn build_document(
        &self,
        scan_id: &str,
        user_id: &str,
        correlation_id: &str,
        ingredients: &[String],
    ) -> Value {
        let (recipes, error) = match self.recipes.find_by_ingredients(ingredients).await {
            Ok(recipes) if recipes.is_empty() => (Vec::new(), Some(NO_RECIPES_FOUND.to_string())),
            Ok(recipes) => (recipes, None),
            Err(err) => {
                warn!(correlation_id, "Recipe lookup failed: {}", err);
                (Vec::new(), Some(format!("Recipe lookup failed: {}", err)))
            }
        };

        let mut document = json!({
            "scan_id": scan_id,
            "user_id": user_id,
            "correlation_id": correlation_id,
            "ingredients": ingredients,
            "recipe_count": recipes.len(),
            "suggested_recipes": recipes,
            "created_at": Utc::now().to_rfc3339(),
        });
        if let (Some(error), Some(fields)) = (error, document.as_object_mut()) {
            fields.insert("error".into(), Value::String(error));
        }
        document
    }

    /// Publishes `recipe.suggestion` for a stored suggestion that has recipes.
    async fn notify(
        &self,
        stored: &StoredDocument,
        scan_id: &str,
        user_id: &str,
        correlation_id: &str,
    ) -> Result<(), HandlerError> {
        let recipe_count = stored.document["recipe_count"].as_u64().unwrap_or(0) as usize;
        if recipe_count == 0 {
            info!(correlation_id, "Suggestion stored without recipes, nothing to announce");
            return Ok(());
        }

        let event = RecipeSuggested {
            scan_id: scan_id.to_string(),
            correlation_id: correlation_id.to_string(),
            user_id: user_id.to_string(),
            suggestion_id: stored.id.clone(),
            recipe_count,
            producer_event: RECIPE_SUGGESTION.to_string(),
            timestamp: Utc::now(),
        };
        if !self
            .broker
            .publish(MEAL_PLANS_EXCHANGE, RECIPE_SUGGESTION, &event)
            .await
        {
            return Err(HandlerError::Publish {
                correlation_id: correlation_id.to_string(),
            });
        }
        info!(
            correlation_id,
            suggestion_id = %stored.id,
            recipe_count,
            "Recipe suggestion announced"
        );
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for SuggestionHandler {
    async fn handle(&self, metadata: &DeliveryMetadata, body: &[u8]) -> Result<(), HandlerError> {
        let payload: DetectedPayload = decode(body)?;
        let scan_id = required("scan_id", payload.scan_id)?;
        let user_id = required("user_id", payload.user_id)?;
        let ingredients = dedup_ingredient_names(&payload.ingredients);
        if ingredients.is_empty() {
            return Err(HandlerError::Malformed(format!(
                "scan {} carries no ingredients",
                scan_id
            )));
        }
        let correlation_id = payload
            .correlation_id
            .or_else(|| metadata.correlation_id.clone())
            .unwrap_or_else(|| scan_id.clone());

        let key = suggestion_key(&user_id, &scan_id);
        let store_error = |err: crate::store::StoreError| HandlerError::Store {
            correlation_id: correlation_id.clone(),
            reason: err.to_string(),
        };

        let stored = match self
            .store
            .find(SUGGESTIONS_COLLECTION, &key)
            .await
            .map_err(store_error)?
        {
            Some(existing) => {
                debug!(correlation_id = %correlation_id, "Suggestion already exists, re-announcing");
                existing
            }
            None => {
                debug!(correlation_id = %correlation_id, ?ingredients, "Looking up recipes");
                let document = self
                    .build_document(&scan_id, &user_id, &correlation_id, &ingredients)
                    .await;
                let stored = self
                    .store
                    .insert_if_absent(SUGGESTIONS_COLLECTION, &key, document)
                    .await
                    .map_err(store_error)?;
                if stored.created {
                    telemetry::record_recommendation(lookup_status(&stored.document));
                    info!(
                        correlation_id = %correlation_id,
                        suggestion_id = %stored.id,
                        "Suggestion persisted"
                    );
                }
                stored
            }
        };

        self.notify(&stored, &scan_id, &user_id, &correlation_id).await
    }
}
