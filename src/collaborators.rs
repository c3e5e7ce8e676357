// src/collaborators.rs
//
// Services the pipeline calls but does not own: recipe lookup and the
// meal-plan API. HTTP clients talk to the real services; the in-memory
// versions back tests and local runs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::pipeline::events::{ingredient_key, IngredientRef};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollaboratorError {
    #[error("{service} request failed: {reason}")]
    Transport { service: String, reason: String },

    #[error("{service} returned HTTP {status}")]
    Status { service: String, status: u16 },

    #[error("{service} returned an unreadable response: {reason}")]
    Decode { service: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    #[serde(default, alias = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(alias = "name")]
    pub title: String,
    #[serde(default)]
    pub ingredients: Vec<IngredientRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealPlan {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub recipes: Vec<Recipe>,
}

#[async_trait]
pub trait RecipeLookup: Send + Sync {
    /// Recipes using the given ingredient names.
    async fn find_by_ingredients(&self, ingredients: &[String])
        -> Result<Vec<Recipe>, CollaboratorError>;
}

#[async_trait]
pub trait MealPlanSource: Send + Sync {
    /// `Ok(None)` when the plan does not exist.
    async fn fetch_meal_plan(&self, meal_plan_id: &str)
        -> Result<Option<MealPlan>, CollaboratorError>;
}

fn http_client(service: &str, timeout: Duration) -> Result<reqwest::Client, CollaboratorError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| CollaboratorError::Transport {
            service: service.to_string(),
            reason: format!("failed to build HTTP client: {}", e),
        })
}

/// `GET {base}/recipes?ingredients=a,b` against the recipe service.
pub struct HttpRecipeLookup {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRecipeLookup {
    const SERVICE: &'static str = "recipe-service";

    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CollaboratorError> {
        Ok(Self {
            client: http_client(Self::SERVICE, timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RecipeLookup for HttpRecipeLookup {
    async fn find_by_ingredients(
        &self,
        ingredients: &[String],
    ) -> Result<Vec<Recipe>, CollaboratorError> {
        let url = format!("{}/recipes", self.base_url);
        debug!(%url, ?ingredients, "Fetching recipes");

        let response = self
            .client
            .get(&url)
            .query(&[("ingredients", ingredients.join(","))])
            .send()
            .await
            .map_err(|e| CollaboratorError::Transport {
                service: Self::SERVICE.into(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            error!(%url, status = status.as_u16(), "Error fetching recipes");
            return Err(CollaboratorError::Status {
                service: Self::SERVICE.into(),
                status: status.as_u16(),
            });
        }
        response
            .json::<Vec<Recipe>>()
            .await
            .map_err(|e| CollaboratorError::Decode {
                service: Self::SERVICE.into(),
                reason: e.to_string(),
            })
    }
}

/// `GET {base}/meal-plans/{id}` against the meal-planning service.
pub struct HttpMealPlanSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMealPlanSource {
    const SERVICE: &'static str = "meal-planning-service";

    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CollaboratorError> {
        Ok(Self {
            client: http_client(Self::SERVICE, timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MealPlanSource for HttpMealPlanSource {
    async fn fetch_meal_plan(
        &self,
        meal_plan_id: &str,
    ) -> Result<Option<MealPlan>, CollaboratorError> {
        let url = format!("{}/meal-plans/{}", self.base_url, meal_plan_id);
        let response =
            self.client
                .get(&url)
                .send()
                .await
                .map_err(|e| CollaboratorError::Transport {
                    service: Self::SERVICE.into(),
                    reason: e.to_string(),
                })?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST => {
                debug!(meal_plan_id, "Meal plan not found");
                Ok(None)
            }
            status if status.is_success() => response
                .json::<MealPlan>()
                .await
                .map(Some)
                .map_err(|e| CollaboratorError::Decode {
                    service: Self::SERVICE.into(),
                    reason: e.to_string(),
                }),
            status => {
                error!(meal_plan_id, status = status.as_u16(), "Error fetching meal plan");
                Err(CollaboratorError::Status {
                    service: Self::SERVICE.into(),
                    status: status.as_u16(),
                })
            }
        }
    }
}

/// Recipe catalogue held in memory. A recipe matches when it uses at least
/// one of the requested ingredients.
#[derive(Default)]
pub struct StaticRecipeLookup {
    recipes: Vec<Recipe>,
    failure: Option<String>,
    requests: Mutex<Vec<Vec<String>>>,
}

impl StaticRecipeLookup {
    pub fn new(recipes: Vec<Recipe>) -> Self {
        Self {
            recipes,
            ..Self::default()
        }
    }

    /// A lookup whose every call fails with a transport error.
    pub fn failing(reason: &str) -> Self {
        Self {
            failure: Some(reason.to_string()),
            ..Self::default()
        }
    }

    /// Ingredient lists this lookup was called with, in call order.
    pub fn requests(&self) -> Vec<Vec<String>> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RecipeLookup for StaticRecipeLookup {
    async fn find_by_ingredients(
        &self,
        ingredients: &[String],
    ) -> Result<Vec<Recipe>, CollaboratorError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(ingredients.to_vec());
        }
        if let Some(reason) = &self.failure {
            return Err(CollaboratorError::Transport {
                service: "recipe-lookup".into(),
                reason: reason.clone(),
            });
        }
        let wanted: Vec<String> = ingredients.iter().map(|i| ingredient_key(i)).collect();
        Ok(self
            .recipes
            .iter()
            .filter(|recipe| recipe.ingredients.iter().any(|i| wanted.contains(&i.key())))
            .cloned()
            .collect())
    }
}

/// Meal plans held in memory.
#[derive(Default)]
pub struct MemoryMealPlans {
    plans: Mutex<HashMap<String, MealPlan>>,
}

impl MemoryMealPlans {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, plan: MealPlan) {
        if let Ok(mut plans) = self.plans.lock() {
            plans.insert(plan.id.clone(), plan);
        }
    }
}

#[async_trait]
impl MealPlanSource for MemoryMealPlans {
    async fn fetch_meal_plan(
        &self,
        meal_plan_id: &str,
    ) -> Result<Option<MealPlan>, CollaboratorError> {
        Ok(self
            .plans
            .lock()
            .ok()
            .and_then(|plans| plans.get(meal_plan_id).cloned()))
    }
}
