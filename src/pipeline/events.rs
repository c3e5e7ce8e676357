// src/pipeline/events.rs
//
// Event payloads exchanged between the scanner, meal-planning and
// shopping-list services.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::errors::HandlerError;

/// An ingredient as producers send it: either a bare name or an object
/// with optional quantity and unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IngredientRef {
    Name(String),
    Detailed {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        quantity: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
    },
}

impl IngredientRef {
    pub fn name(&self) -> &str {
        match self {
            IngredientRef::Name(name) => name,
            IngredientRef::Detailed { name, .. } => name,
        }
    }

    /// Comparison key: trimmed, lower-cased name.
    pub fn key(&self) -> String {
        ingredient_key(self.name())
    }
}

impl From<&str> for IngredientRef {
    fn from(name: &str) -> Self {
        IngredientRef::Detailed {
            name: name.to_string(),
            quantity: None,
            unit: None,
        }
    }
}

pub fn ingredient_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Unique ingredient names in first-seen order. The first spelling wins and
/// blank names are dropped.
pub fn dedup_ingredient_names<'a, I>(ingredients: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a IngredientRef>,
{
    let mut seen = HashSet::new();
    ingredients
        .into_iter()
        .map(|ingredient| ingredient.name().trim())
        .filter(|name| !name.is_empty())
        .filter(|name| seen.insert(name.to_lowercase()))
        .map(str::to_string)
        .collect()
}

/// Published on `ingredient.detected` once a scan produced ingredients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngredientsDetected {
    pub scan_id: String,
    pub correlation_id: String,
    pub user_id: String,
    pub ingredients: Vec<IngredientRef>,
    pub producer_event: String,
    pub timestamp: DateTime<Utc>,
}

/// Published on `recipe.suggestion` after a suggestion was persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeSuggested {
    pub scan_id: String,
    pub correlation_id: String,
    pub user_id: String,
    pub suggestion_id: String,
    pub recipe_count: usize,
    pub producer_event: String,
    pub timestamp: DateTime<Utc>,
}

/// Published on `meal_plan.created` after a meal plan was persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealPlanCreated {
    pub meal_plan_id: String,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub available_ingredients: Vec<IngredientRef>,
    pub producer_event: String,
    pub timestamp: DateTime<Utc>,
}

/// Published on `shopping_list.created` after a shopping list was persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShoppingListCreated {
    pub meal_plan_id: String,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub shopping_list_id: String,
    pub item_count: usize,
    pub producer_event: String,
    pub timestamp: DateTime<Utc>,
}

/// Decodes a message body; anything that is not the expected JSON shape is
/// malformed and will not be retried.
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, HandlerError> {
    serde_json::from_slice(body).map_err(|e| HandlerError::Malformed(e.to_string()))
}

/// A required, non-blank string field.
pub fn required(field: &str, value: Option<String>) -> Result<String, HandlerError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(HandlerError::Malformed(format!(
            "missing required field '{}'",
            field
        ))),
    }
}
