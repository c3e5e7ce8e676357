// src/pipeline/mod.rs
//
// The scan -> suggestion -> shopping list choreography.

pub mod events;
pub mod meal_plans;
pub mod scanner;
pub mod shopping_list;
pub mod suggestions;
pub mod topology;

pub const INGREDIENTS_EXCHANGE: &str = "ingredients";
pub const MEAL_PLANS_EXCHANGE: &str = "meal_plans";
pub const SHOPPING_LISTS_EXCHANGE: &str = "shopping_lists";

pub const INGREDIENT_DETECTED: &str = "ingredient.detected";
pub const INGREDIENT_PLANNING: &str = "ingredient.planning";
pub const RECIPE_SUGGESTION: &str = "recipe.suggestion";
pub const MEAL_PLAN_CREATED: &str = "meal_plan.created";
pub const SHOPPING_LIST_CREATED: &str = "shopping_list.created";

pub const DETECTED_INGREDIENTS_QUEUE: &str = "detected_ingredients";
pub const MEAL_PLANNING_REQUESTS_QUEUE: &str = "meal_planning_requests";
pub const MEAL_PLANS_CREATED_QUEUE: &str = "meal_plans_created";
pub const RECIPE_SUGGESTIONS_QUEUE: &str = "recipe_suggestions";
pub const SHOPPING_LISTS_CREATED_QUEUE: &str = "shopping_lists_created";

/// Durable queues declared for downstream consumers outside this crate
/// (notification and planning front ends). None of the services here drains
/// them; a deployment either attaches a consumer or caps them with a
/// broker-side max-length policy.
pub const EXTERNAL_QUEUES: [&str; 3] = [
    MEAL_PLANNING_REQUESTS_QUEUE,
    RECIPE_SUGGESTIONS_QUEUE,
    SHOPPING_LISTS_CREATED_QUEUE,
];

pub const SUGGESTIONS_COLLECTION: &str = "suggestions";
pub const SHOPPING_LISTS_COLLECTION: &str = "shopping_lists";

pub use events::{
    dedup_ingredient_names, IngredientRef, IngredientsDetected, MealPlanCreated, RecipeSuggested,
    ShoppingListCreated,
};
pub use meal_plans::MealPlanNotifier;
pub use scanner::ScanNotifier;
pub use shopping_list::ShoppingListHandler;
pub use suggestions::SuggestionHandler;
