// src/pipeline/topology.rs
//
// Fixed exchanges, queues and bindings of each service.

use super::*;
use crate::broker::topology::Topology;

fn dead_lettered(topology: Topology, dead_letter_exchange: Option<&str>) -> Topology {
    match dead_letter_exchange {
        Some(exchange) => topology.with_dead_letter(exchange),
        None => topology,
    }
}

pub fn scanner_topology(dead_letter_exchange: Option<&str>) -> Topology {
    let topology = Topology::new()
        .exchange(INGREDIENTS_EXCHANGE)
        .queue(DETECTED_INGREDIENTS_QUEUE)
        .bind(DETECTED_INGREDIENTS_QUEUE, INGREDIENTS_EXCHANGE, INGREDIENT_DETECTED);
    dead_lettered(topology, dead_letter_exchange)
}

/// Also declares `meal_planning_requests` and `recipe_suggestions`, which
/// belong to [`EXTERNAL_QUEUES`].
pub fn meal_planning_topology(dead_letter_exchange: Option<&str>) -> Topology {
    let topology = Topology::new()
        .exchange(INGREDIENTS_EXCHANGE)
        .exchange(MEAL_PLANS_EXCHANGE)
        .queue(DETECTED_INGREDIENTS_QUEUE)
        .queue(MEAL_PLANNING_REQUESTS_QUEUE)
        .queue(MEAL_PLANS_CREATED_QUEUE)
        .queue(RECIPE_SUGGESTIONS_QUEUE)
        .bind(DETECTED_INGREDIENTS_QUEUE, INGREDIENTS_EXCHANGE, INGREDIENT_DETECTED)
        .bind(MEAL_PLANNING_REQUESTS_QUEUE, INGREDIENTS_EXCHANGE, INGREDIENT_PLANNING)
        .bind(MEAL_PLANS_CREATED_QUEUE, MEAL_PLANS_EXCHANGE, MEAL_PLAN_CREATED)
        .bind(RECIPE_SUGGESTIONS_QUEUE, MEAL_PLANS_EXCHANGE, RECIPE_SUGGESTION);
    dead_lettered(topology, dead_letter_exchange)
}

pub fn shopping_list_topology(dead_letter_exchange: Option<&str>) -> Topology {
    let topology = Topology::new()
        .exchange(MEAL_PLANS_EXCHANGE)
        .exchange(SHOPPING_LISTS_EXCHANGE)
        .queue(MEAL_PLANS_CREATED_QUEUE)
        .queue(SHOPPING_LISTS_CREATED_QUEUE)
        .bind(MEAL_PLANS_CREATED_QUEUE, MEAL_PLANS_EXCHANGE, MEAL_PLAN_CREATED)
        .bind(SHOPPING_LISTS_CREATED_QUEUE, SHOPPING_LISTS_EXCHANGE, SHOPPING_LIST_CREATED);
    dead_lettered(topology, dead_letter_exchange)
}
