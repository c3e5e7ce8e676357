// tests/pipeline_flow.rs
//
// End-to-end runs of the three services against one in-memory broker.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::sleep;

use pantry_pipeline::broker::connection::ConnectionManager;
use pantry_pipeline::broker::consumer::{
    ConsumerState, DispatcherOptions, HandlerRetry, MessageHandler,
};
use pantry_pipeline::broker::memory::MemoryBroker;
use pantry_pipeline::broker::session::{AckMode, DeliveryMetadata};
use pantry_pipeline::broker::{BrokerClient, HandlerError};
use pantry_pipeline::collaborators::{MealPlan, MemoryMealPlans, Recipe, StaticRecipeLookup};
use pantry_pipeline::pipeline::topology::meal_planning_topology;
use pantry_pipeline::pipeline::{
    IngredientRef, DETECTED_INGREDIENTS_QUEUE, RECIPE_SUGGESTION, SHOPPING_LISTS_COLLECTION,
    SHOPPING_LIST_CREATED, SUGGESTIONS_COLLECTION,
};
use pantry_pipeline::store::{DocumentStore, MemoryStore};
use pantry_pipeline::{Collaborators, PipelineConfig, ServiceContext, ServiceKind};

fn client(broker: &MemoryBroker) -> BrokerClient {
    let connection = Arc::new(
        ConnectionManager::new("memory://local", broker.connector())
            .with_reconnect_policy(3, Duration::from_millis(10)),
    );
    BrokerClient::new(
        connection,
        DispatcherOptions {
            prefetch: 1,
            reconnect_delay: Duration::from_millis(20),
            stop_timeout: Duration::from_secs(1),
            retry: HandlerRetry {
                max_attempts: 3,
                delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
            },
        },
    )
}

async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    condition()
}

async fn eventually_count(store: &MemoryStore, collection: &str, expected: usize) -> bool {
    for _ in 0..400 {
        if store.count(collection).await.unwrap_or(0) == expected {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    false
}

fn omelette() -> Recipe {
    Recipe {
        id: Some("r1".into()),
        title: "Omelette".into(),
        ingredients: vec!["egg".into(), "butter".into(), "chives".into()],
    }
}

struct Services {
    broker: MemoryBroker,
    scanner: ServiceContext,
    planning: ServiceContext,
    shopping: ServiceContext,
    planning_store: Arc<MemoryStore>,
    shopping_store: Arc<MemoryStore>,
}

async fn start_services(config: PipelineConfig) -> Services {
    let broker = MemoryBroker::new();
    let planning_store = Arc::new(MemoryStore::new());
    let shopping_store = Arc::new(MemoryStore::new());

    let plans = Arc::new(MemoryMealPlans::new());
    plans.insert(MealPlan {
        id: "mp1".into(),
        name: Some("Breakfasts".into()),
        user_id: Some("u1".into()),
        recipes: vec![omelette()],
    });

    let scanner = ServiceContext::new(
        ServiceKind::Scanner,
        &config,
        client(&broker),
        Collaborators {
            store: None,
            recipes: Arc::new(StaticRecipeLookup::default()),
            meal_plans: Arc::new(MemoryMealPlans::new()),
        },
    );
    let planning = ServiceContext::new(
        ServiceKind::MealPlanning,
        &config,
        client(&broker),
        Collaborators {
            store: Some(planning_store.clone()),
            recipes: Arc::new(StaticRecipeLookup::new(vec![omelette()])),
            meal_plans: Arc::new(MemoryMealPlans::new()),
        },
    );
    let shopping = ServiceContext::new(
        ServiceKind::ShoppingList,
        &config,
        client(&broker),
        Collaborators {
            store: Some(shopping_store.clone()),
            recipes: Arc::new(StaticRecipeLookup::default()),
            meal_plans: plans,
        },
    );

    scanner.start().await.unwrap();
    planning.start().await.unwrap();
    shopping.start().await.unwrap();

    Services {
        broker,
        scanner,
        planning,
        shopping,
        planning_store,
        shopping_store,
    }
}

impl Services {
    async fn shutdown(&self) {
        self.scanner.shutdown().await;
        self.planning.shutdown().await;
        self.shopping.shutdown().await;
    }

    async fn wait_until_consuming(&self) {
        for ctx in [&self.planning, &self.shopping] {
            let ready = eventually_states(ctx).await;
            assert!(ready, "{} consumers never started", ctx.kind());
        }
    }
}

async fn eventually_states(ctx: &ServiceContext) -> bool {
    for _ in 0..400 {
        let states = ctx.consumer_states().await;
        if states.iter().all(|(_, s)| *s == ConsumerState::Consuming) {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test]
async fn test_scan_to_shopping_list() {
    let services = start_services(PipelineConfig::default()).await;
    services.wait_until_consuming().await;

    let ingredients: Vec<IngredientRef> = vec!["egg".into(), "Egg".into(), "butter".into()];
    assert!(services
        .scanner
        .scan_notifier()
        .publish_scan_result("s1", "u1", &ingredients)
        .await);

    assert!(eventually_count(&services.planning_store, SUGGESTIONS_COLLECTION, 1).await);
    let suggestion = services
        .planning_store
        .find(SUGGESTIONS_COLLECTION, "u1:s1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(suggestion.document["recipe_count"], 1);
    assert_eq!(suggestion.document["ingredients"], json!(["egg", "butter"]));
    assert!(eventually(|| services.broker.queue_depth("recipe_suggestions") == 1).await);
    let announced = services.broker.published_with_key(RECIPE_SUGGESTION);
    assert_eq!(announced[0].body["suggestion_id"], suggestion.id.as_str());
    assert_eq!(announced[0].correlation_id.as_deref(), Some("s1"));

    assert!(services
        .planning
        .meal_plan_notifier()
        .announce_created("mp1", Some("u1"), &["butter".into()])
        .await);

    assert!(eventually_count(&services.shopping_store, SHOPPING_LISTS_COLLECTION, 1).await);
    let list = services
        .shopping_store
        .find(SHOPPING_LISTS_COLLECTION, "mp1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(list.document["item_count"], 2);
    assert_eq!(list.document["items"][0]["ingredient"], "egg");
    assert_eq!(list.document["items"][1]["ingredient"], "chives");
    assert!(eventually(|| services.broker.queue_depth("shopping_lists_created") == 1).await);
    assert_eq!(
        services.broker.published_with_key(SHOPPING_LIST_CREATED)[0].body["shopping_list_id"],
        list.id.as_str()
    );

    assert!(eventually(|| services.broker.unacked_count(DETECTED_INGREDIENTS_QUEUE) == 0).await);
    services.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_scan_event_creates_one_suggestion() {
    let services = start_services(PipelineConfig::default()).await;
    services.wait_until_consuming().await;
    let notifier = services.scanner.scan_notifier();

    assert!(notifier.publish_scan_result("s1", "u1", &["egg".into()]).await);
    assert!(notifier.publish_scan_result("s1", "u1", &["egg".into()]).await);

    assert!(eventually(|| services.broker.published_with_key(RECIPE_SUGGESTION).len() == 2).await);
    assert_eq!(services.planning_store.count(SUGGESTIONS_COLLECTION).await.unwrap(), 1);
    let announced = services.broker.published_with_key(RECIPE_SUGGESTION);
    assert_eq!(announced[0].body["suggestion_id"], announced[1].body["suggestion_id"]);
    services.shutdown().await;
}

#[tokio::test]
async fn test_malformed_event_does_not_stop_consumer() {
    let services = start_services(PipelineConfig::default()).await;
    services.wait_until_consuming().await;
    let publisher = services.scanner.broker();

    assert!(publisher
        .publish("ingredients", "ingredient.detected", &json!({"user_id": "u1", "ingredients": ["egg"]}))
        .await);
    assert!(publisher
        .publish("ingredients", "ingredient.detected", &json!({"scan_id": "s2", "user_id": "u2", "ingredients": []}))
        .await);
    assert!(services
        .scanner
        .scan_notifier()
        .publish_scan_result("s3", "u3", &["egg".into()])
        .await);

    assert!(eventually_count(&services.planning_store, SUGGESTIONS_COLLECTION, 1).await);
    assert!(services
        .planning_store
        .find(SUGGESTIONS_COLLECTION, "u3:s3")
        .await
        .unwrap()
        .is_some());
    assert!(eventually(|| services.broker.queue_depth(DETECTED_INGREDIENTS_QUEUE) == 0).await);
    assert!(eventually_states(&services.planning).await);
    services.shutdown().await;
}

#[tokio::test]
async fn test_malformed_event_is_dead_lettered() {
    let config = PipelineConfig {
        dead_letter_exchange: Some("pipeline.dlx".into()),
        ..PipelineConfig::default()
    };
    let services = start_services(config).await;
    services.wait_until_consuming().await;

    assert!(services
        .scanner
        .broker()
        .publish("ingredients", "ingredient.detected", &json!({"scan_id": "s9"}))
        .await);

    assert!(eventually(|| services.broker.queue_depth("pipeline.dlx.messages") == 1).await);
    assert_eq!(services.planning_store.count(SUGGESTIONS_COLLECTION).await.unwrap(), 0);
    services.shutdown().await;
}

#[tokio::test]
async fn test_topology_setup_is_idempotent() {
    let broker = MemoryBroker::new();
    let client = client(&broker);
    let topology = meal_planning_topology(None);

    client.setup_topology(&topology).await.unwrap();
    let first = broker.bindings();
    client.setup_topology(&topology).await.unwrap();

    assert_eq!(broker.bindings(), first);
    assert_eq!(first.len(), 4);
    for exchange in &topology.exchanges {
        assert_eq!(broker.exchange(&exchange.name).as_ref(), Some(exchange));
    }
}

struct Capture(Mutex<Vec<DeliveryMetadata>>);

#[async_trait]
impl MessageHandler for Capture {
    async fn handle(&self, metadata: &DeliveryMetadata, _: &[u8]) -> Result<(), HandlerError> {
        if let Ok(mut seen) = self.0.lock() {
            seen.push(metadata.clone());
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_correlation_id_survives_round_trip() {
    let broker = MemoryBroker::new();
    let client = client(&broker);
    client.setup_topology(&meal_planning_topology(None)).await.unwrap();

    let capture = Arc::new(Capture(Mutex::new(Vec::new())));
    let handle = client
        .dispatcher(None)
        .start_consuming("meal_planning_requests", capture.clone(), AckMode::Manual);
    assert!(handle.wait_for_state(ConsumerState::Consuming, Duration::from_secs(2)).await);

    assert!(client
        .publish("ingredients", "ingredient.planning", &json!({"correlation_id": "c-42"}))
        .await);

    assert!(eventually(|| capture.0.lock().map(|s| s.len()).unwrap_or(0) == 1).await);
    let seen = capture.0.lock().unwrap()[0].clone();
    assert_eq!(seen.correlation_id.as_deref(), Some("c-42"));
    assert_eq!(seen.routing_key, "ingredient.planning");
    assert_eq!(seen.content_type.as_deref(), Some("application/json"));
    handle.stop_consuming().await;
}

#[tokio::test]
async fn test_services_recover_after_connection_loss() {
    let services = start_services(PipelineConfig::default()).await;
    services.wait_until_consuming().await;

    services.broker.drop_connections();
    sleep(Duration::from_millis(50)).await;
    services.wait_until_consuming().await;

    assert!(services
        .scanner
        .scan_notifier()
        .publish_scan_result("s5", "u5", &["egg".into()])
        .await);
    assert!(eventually_count(&services.planning_store, SUGGESTIONS_COLLECTION, 1).await);
    services.shutdown().await;
}

#[tokio::test]
async fn test_store_outage_delays_but_keeps_scan_event() {
    let services = start_services(PipelineConfig::default()).await;
    services.wait_until_consuming().await;

    services.planning_store.set_available(false);
    assert!(services
        .scanner
        .scan_notifier()
        .publish_scan_result("s9", "u9", &["egg".into()])
        .await);
    sleep(Duration::from_millis(300)).await;
    let pending = services.broker.queue_depth(DETECTED_INGREDIENTS_QUEUE)
        + services.broker.unacked_count(DETECTED_INGREDIENTS_QUEUE);
    assert_eq!(pending, 1);
    services.planning_store.set_available(true);

    assert!(eventually_count(&services.planning_store, SUGGESTIONS_COLLECTION, 1).await);
    assert!(eventually(|| services.broker.published_with_key(RECIPE_SUGGESTION).len() == 1).await);
    assert!(eventually(|| services.broker.unacked_count(DETECTED_INGREDIENTS_QUEUE) == 0).await);
    assert_eq!(services.broker.queue_depth(DETECTED_INGREDIENTS_QUEUE), 0);
    services.shutdown().await;
}
