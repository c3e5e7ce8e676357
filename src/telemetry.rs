// src/telemetry.rs
//
// Prometheus metrics emitted by the consumers and pipeline stages, plus the
// exporter the binary installs.

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use thiserror::Error;
use tracing::info;

pub const CONSUMER_MESSAGES_TOTAL: &str = "consumer_messages_total";
pub const HANDLER_DURATION_SECONDS: &str = "message_handler_duration_seconds";
pub const MESSAGES_PUBLISHED_TOTAL: &str = "messages_published_total";
pub const RECIPE_RECOMMENDATIONS_TOTAL: &str = "recipe_recommendations_total";
pub const SHOPPING_LIST_OPERATIONS_TOTAL: &str = "shopping_list_operations_total";
pub const ITEMS_PER_LIST: &str = "items_per_list";
pub const DB_OPERATIONS_TOTAL: &str = "db_operations_total";

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("invalid metrics address '{0}'")]
    Address(String),

    #[error("failed to install Prometheus exporter: {0}")]
    Install(String),
}

/// How a consumer settled one handler attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Malformed,
    Retried,
    Requeued,
    DeadLettered,
}

impl DeliveryOutcome {
    fn label(self) -> &'static str {
        match self {
            DeliveryOutcome::Acked => "acked",
            DeliveryOutcome::Malformed => "malformed",
            DeliveryOutcome::Retried => "retried",
            DeliveryOutcome::Requeued => "requeued",
            DeliveryOutcome::DeadLettered => "dead_lettered",
        }
    }
}

fn status(ok: bool) -> &'static str {
    if ok {
        "success"
    } else {
        "failure"
    }
}

pub fn describe_metrics() {
    describe_counter!(
        CONSUMER_MESSAGES_TOTAL,
        "Deliveries handled by consumers, by queue and outcome"
    );
    describe_histogram!(
        HANDLER_DURATION_SECONDS,
        Unit::Seconds,
        "Time spent in one message handler attempt"
    );
    describe_counter!(MESSAGES_PUBLISHED_TOTAL, "Published pipeline events");
    describe_counter!(
        RECIPE_RECOMMENDATIONS_TOTAL,
        "Recipe suggestion documents created, by lookup result"
    );
    describe_counter!(SHOPPING_LIST_OPERATIONS_TOTAL, "Total shopping list operations");
    describe_histogram!(ITEMS_PER_LIST, "Number of items in shopping lists");
    describe_counter!(DB_OPERATIONS_TOTAL, "Total database operations");
}

/// Serves `/metrics` on `address`. Must run inside a tokio runtime.
pub fn install_exporter(address: &str) -> Result<(), MetricsError> {
    let addr: SocketAddr = address
        .parse()
        .map_err(|_| MetricsError::Address(address.to_string()))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricsError::Install(e.to_string()))?;
    describe_metrics();
    info!(%addr, "Prometheus metrics available at http://{}/metrics", addr);
    Ok(())
}

pub fn record_delivery(queue: &str, outcome: DeliveryOutcome) {
    counter!(
        CONSUMER_MESSAGES_TOTAL,
        "queue" => queue.to_string(),
        "outcome" => outcome.label()
    )
    .increment(1);
}

pub fn record_handler_duration(queue: &str, elapsed: Duration) {
    histogram!(HANDLER_DURATION_SECONDS, "queue" => queue.to_string())
        .record(elapsed.as_secs_f64());
}

pub fn record_publish(exchange: &str, routing_key: &str, ok: bool) {
    counter!(
        MESSAGES_PUBLISHED_TOTAL,
        "exchange" => exchange.to_string(),
        "routing_key" => routing_key.to_string(),
        "status" => status(ok)
    )
    .increment(1);
}

/// `result` is one of `found`, `empty` or `lookup_failed`.
pub fn record_recommendation(result: &'static str) {
    counter!(RECIPE_RECOMMENDATIONS_TOTAL, "status" => result).increment(1);
}

pub fn record_shopping_list(found: bool, items: usize) {
    counter!(
        SHOPPING_LIST_OPERATIONS_TOTAL,
        "operation" => "create",
        "status" => if found { "success" } else { "plan_not_found" }
    )
    .increment(1);
    histogram!(ITEMS_PER_LIST).record(items as f64);
}

pub fn record_db_operation(operation: &'static str, ok: bool) {
    counter!(DB_OPERATIONS_TOTAL, "operation" => operation, "status" => status(ok)).increment(1);
}
