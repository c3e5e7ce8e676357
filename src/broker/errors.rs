// src/broker/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker channel error: {0}")]
    Channel(String),

    #[error("topology declaration failed: {0}")]
    Topology(String),

    #[error("message serialization error: {0}")]
    Serialization(#[from] SerdeError),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("consume failed: {0}")]
    Consume(String),

    #[error("acknowledge failed: {0}")]
    Ack(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("operation cancelled by shutdown")]
    Cancelled,
}

/// Result type for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

impl BrokerError {
    /// Whether the error means the session is no longer usable.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_) | BrokerError::Channel(_) | BrokerError::Timeout(_)
        )
    }

    /// Re-tags an error raised while declaring topology.
    pub fn into_topology(self, context: &str) -> BrokerError {
        match self {
            BrokerError::Topology(msg) => BrokerError::Topology(msg),
            other => BrokerError::Topology(format!("{}: {}", context, other)),
        }
    }
}

// Converting from lapin errors
impl From<LapinError> for BrokerError {
    fn from(error: LapinError) -> Self {
        match &error {
            LapinError::InvalidConnectionState(_) | LapinError::IOError(_) => {
                BrokerError::Connection(error.to_string())
            }
            LapinError::InvalidChannelState(_) | LapinError::InvalidChannel(_) => {
                BrokerError::Channel(error.to_string())
            }
            _ => BrokerError::Channel(error.to_string()),
        }
    }
}

impl From<Elapsed> for BrokerError {
    fn from(_: Elapsed) -> Self {
        BrokerError::Timeout("broker did not answer in time".to_string())
    }
}

/// Why a delivered message could not be processed.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Envelope is not JSON or lacks a required field. Never retried.
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("document store failure for {correlation_id}: {reason}")]
    Store {
        correlation_id: String,
        reason: String,
    },

    #[error("collaborator failure for {correlation_id}: {reason}")]
    Collaborator {
        correlation_id: String,
        reason: String,
    },

    #[error("notification for {correlation_id} could not be published")]
    Publish { correlation_id: String },
}

impl HandlerError {
    pub fn is_malformed(&self) -> bool {
        matches!(self, HandlerError::Malformed(_))
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            HandlerError::Malformed(_) => None,
            HandlerError::Store { correlation_id, .. }
            | HandlerError::Collaborator { correlation_id, .. }
            | HandlerError::Publish { correlation_id } => Some(correlation_id),
        }
    }
}

impl From<SerdeError> for HandlerError {
    fn from(error: SerdeError) -> Self {
        HandlerError::Malformed(error.to_string())
    }
}
