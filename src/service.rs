// src/service.rs
//
// Per-process wiring: which topology a service declares, which consumers it
// runs, and how it starts and stops.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::broker::client::BrokerClient;
use crate::broker::consumer::{ConsumerHandle, ConsumerState};
use crate::broker::errors::BrokerError;
use crate::broker::session::AckMode;
use crate::broker::topology::Topology;
use crate::collaborators::{
    CollaboratorError, HttpMealPlanSource, HttpRecipeLookup, MealPlanSource, RecipeLookup,
};
use crate::broker::connection::redact_url;
use crate::config::{PipelineConfig, StoreKind};
use crate::pipeline::topology::{meal_planning_topology, scanner_topology, shopping_list_topology};
use crate::pipeline::{
    MealPlanNotifier, ScanNotifier, ShoppingListHandler, SuggestionHandler,
    DETECTED_INGREDIENTS_QUEUE, MEAL_PLANS_CREATED_QUEUE, SHOPPING_LISTS_COLLECTION,
    SUGGESTIONS_COLLECTION,
};
use crate::store::{DocumentStore, MemoryStore, MongoStore};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("broker topology could not be declared: {0}")]
    Topology(#[from] BrokerError),

    #[error("{0} consumers need a document store, but none is initialized")]
    StoreNotInitialized(ServiceKind),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ServiceKind {
    Scanner,
    MealPlanning,
    ShoppingList,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKind::Scanner => write!(f, "scanner"),
            ServiceKind::MealPlanning => write!(f, "meal-planning"),
            ServiceKind::ShoppingList => write!(f, "shopping-list"),
        }
    }
}

impl ServiceKind {
    pub fn topology(&self, dead_letter_exchange: Option<&str>) -> Topology {
        match self {
            ServiceKind::Scanner => scanner_topology(dead_letter_exchange),
            ServiceKind::MealPlanning => meal_planning_topology(dead_letter_exchange),
            ServiceKind::ShoppingList => shopping_list_topology(dead_letter_exchange),
        }
    }
}

/// Whether the service can currently confirm dispatches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Readiness {
    Ready,
    Degraded { reason: String },
}

/// External dependencies of a service.
pub struct Collaborators {
    pub store: Option<Arc<dyn DocumentStore>>,
    pub recipes: Arc<dyn RecipeLookup>,
    pub meal_plans: Arc<dyn MealPlanSource>,
}

impl Collaborators {
    /// HTTP clients for the recipe and meal-planning services plus the
    /// configured document store. An unreachable MongoDB leaves the store
    /// uninitialized.
    pub async fn from_config(config: &PipelineConfig) -> Result<Self, CollaboratorError> {
        Ok(Self {
            store: connect_store(config).await,
            recipes: Arc::new(HttpRecipeLookup::new(
                &config.recipe_service_url,
                config.http_timeout(),
            )?),
            meal_plans: Arc::new(HttpMealPlanSource::new(
                &config.meal_planning_service_url,
                config.http_timeout(),
            )?),
        })
    }
}

async fn connect_store(config: &PipelineConfig) -> Option<Arc<dyn DocumentStore>> {
    match config.store_backend {
        StoreKind::Memory => Some(Arc::new(MemoryStore::new())),
        StoreKind::Mongo => {
            let collections = [SUGGESTIONS_COLLECTION, SHOPPING_LISTS_COLLECTION];
            match MongoStore::connect(&config.mongo_uri, &config.db_name, &collections).await {
                Ok(store) => Some(Arc::new(store)),
                Err(err) => {
                    error!(uri = %redact_url(&config.mongo_uri), "MongoDB unavailable: {}", err);
                    None
                }
            }
        }
    }
}

/// Everything one service process owns, passed around explicitly.
pub struct ServiceContext {
    kind: ServiceKind,
    broker: BrokerClient,
    topology: Topology,
    collaborators: Collaborators,
    consumers: Mutex<Vec<ConsumerHandle>>,
}

impl ServiceContext {
    pub fn new(
        kind: ServiceKind,
        config: &PipelineConfig,
        broker: BrokerClient,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            kind,
            topology: kind.topology(config.dead_letter_exchange.as_deref()),
            broker,
            collaborators,
            consumers: Mutex::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn broker(&self) -> &BrokerClient {
        &self.broker
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn store(&self) -> Option<&Arc<dyn DocumentStore>> {
        self.collaborators.store.as_ref()
    }

    pub fn is_store_initialized(&self) -> bool {
        self.collaborators.store.is_some()
    }

    pub fn readiness(&self) -> Readiness {
        if !self.is_store_initialized() {
            return Readiness::Degraded {
                reason: "document store not initialized".into(),
            };
        }
        if !self.broker.is_connected() {
            return Readiness::Degraded {
                reason: "message broker not connected".into(),
            };
        }
        Readiness::Ready
    }

    pub fn scan_notifier(&self) -> ScanNotifier {
        ScanNotifier::new(self.broker.clone())
    }

    pub fn meal_plan_notifier(&self) -> MealPlanNotifier {
        MealPlanNotifier::new(self.broker.clone())
    }

    /// Connects, declares the service topology and starts its consumers.
    ///
    /// An unreachable broker leaves the service running degraded; consumers
    /// keep retrying in the background. A refused declaration is fatal.
    pub async fn start(&self) -> Result<(), ServiceError> {
        info!(service = %self.kind, "Starting service");

        if self.broker.connect().await {
            self.broker.setup_topology(&self.topology).await?;
        } else {
            warn!(service = %self.kind, "Broker unreachable, starting degraded");
        }

        let dispatcher = self.broker.dispatcher(Some(self.topology.clone()));
        let mut consumers = self.consumers.lock().await;
        match self.kind {
            ServiceKind::Scanner => {}
            ServiceKind::MealPlanning => {
                let store = self.require_store()?;
                let handler = SuggestionHandler::new(
                    store,
                    self.collaborators.recipes.clone(),
                    self.broker.clone(),
                );
                consumers.push(dispatcher.start_consuming(
                    DETECTED_INGREDIENTS_QUEUE,
                    Arc::new(handler),
                    AckMode::Manual,
                ));
            }
            ServiceKind::ShoppingList => {
                let store = self.require_store()?;
                let handler = ShoppingListHandler::new(
                    store,
                    self.collaborators.meal_plans.clone(),
                    self.broker.clone(),
                );
                consumers.push(dispatcher.start_consuming(
                    MEAL_PLANS_CREATED_QUEUE,
                    Arc::new(handler),
                    AckMode::Manual,
                ));
            }
        }

        info!(
            service = %self.kind,
            consumers = consumers.len(),
            readiness = ?self.readiness(),
            "Service started"
        );
        Ok(())
    }

    fn require_store(&self) -> Result<Arc<dyn DocumentStore>, ServiceError> {
        self.collaborators.store.clone().ok_or_else(|| {
            error!(service = %self.kind, "Document store not initialized");
            ServiceError::StoreNotInitialized(self.kind)
        })
    }

    pub async fn consumer_states(&self) -> Vec<(String, ConsumerState)> {
        self.consumers
            .lock()
            .await
            .iter()
            .map(|c| (c.queue().to_string(), c.state()))
            .collect()
    }

    /// Stops every consumer, then the broker connection. Idempotent.
    pub async fn shutdown(&self) {
        let consumers: Vec<ConsumerHandle> = self.consumers.lock().await.drain(..).collect();
        for consumer in &consumers {
            consumer.stop_consuming().await;
        }
        self.broker.shutdown().await;
        info!(service = %self.kind, "Service stopped");
    }
}
