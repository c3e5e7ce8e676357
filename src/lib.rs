// src/lib.rs
//
// Event pipeline shared by the scanner, meal-planning and shopping-list
// services: broker client, topology, publish/consume, the three pipeline
// stages and their metrics.

pub mod broker;
pub mod collaborators;
pub mod config;
pub mod pipeline;
pub mod service;
pub mod store;
pub mod telemetry;

pub use broker::{BrokerBackend, BrokerClient, BrokerError, HandlerError};
pub use config::PipelineConfig;
pub use service::{Collaborators, Readiness, ServiceContext, ServiceKind};
