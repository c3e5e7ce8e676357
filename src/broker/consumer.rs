use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::connection::ConnectionManager;
use super::errors::{HandlerError, Result};
use super::session::{AckMode, Delivery, DeliveryMetadata, DeliveryStream, Session};
use super::topology::{Topology, TopologyManager};
use crate::telemetry::{self, DeliveryOutcome};

/// Business logic invoked for every delivered message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        metadata: &DeliveryMetadata,
        body: &[u8],
    ) -> std::result::Result<(), HandlerError>;
}

/// Lifecycle of one consumer:
/// `Stopped -> Connecting -> Consuming -> (error) -> Connecting -> ... -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Stopped,
    Connecting,
    Consuming,
}

/// Attempts a failing handler gets per delivery. The message stays
/// unacknowledged while the delay doubles between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerRetry {
    pub max_attempts: u32,
    pub delay: Duration,
    pub max_delay: Duration,
}

impl Default for HandlerRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl HandlerRetry {
    /// Delay after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.delay.saturating_mul(1u32 << exponent).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Unacknowledged deliveries allowed in flight (0 = unlimited).
    pub prefetch: u16,
    /// Pause before resubscribing after the stream broke.
    pub reconnect_delay: Duration,
    /// Upper bound for `stop_consuming`.
    pub stop_timeout: Duration,
    pub retry: HandlerRetry,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            prefetch: 1,
            reconnect_delay: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            retry: HandlerRetry::default(),
        }
    }
}

/// Starts consumers that share the process connection.
#[derive(Clone)]
pub struct ConsumerDispatcher {
    connection: Arc<ConnectionManager>,
    options: DispatcherOptions,
    topology: Option<Arc<Topology>>,
}

impl ConsumerDispatcher {
    pub fn new(connection: Arc<ConnectionManager>, options: DispatcherOptions) -> Self {
        Self {
            connection,
            options,
            topology: None,
        }
    }

    /// Topology re-declared after every reconnect, before subscribing.
    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = Some(Arc::new(topology));
        self
    }

    /// Spawns a consumer task for `queue`. Must be called inside a tokio
    /// runtime. Dropping the returned handle stops the consumer.
    pub fn start_consuming(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        ack_mode: AckMode,
    ) -> ConsumerHandle {
        let consumer_tag = format!("consumer-{}-{}", queue, &Uuid::new_v4().to_string()[..8]);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, _) = watch::channel(ConsumerState::Stopped);
        let state = Arc::new(state_tx);
        let dead_lettered = self.topology.as_ref().is_some_and(|topology| {
            topology
                .queues
                .iter()
                .any(|q| q.name == queue && q.dead_letter_exchange.is_some())
        });

        let consumer = ConsumerLoop {
            queue: queue.to_string(),
            consumer_tag: consumer_tag.clone(),
            connection: self.connection.clone(),
            options: self.options.clone(),
            topology: self.topology.clone(),
            dead_lettered,
            handler,
            ack_mode,
            state: state.clone(),
        };
        info!(queue, consumer_tag = %consumer_tag, ?ack_mode, dead_lettered, "Starting consumer");
        let task = tokio::spawn(consumer.run(stop_rx));

        ConsumerHandle {
            queue: queue.to_string(),
            consumer_tag,
            state,
            stop: stop_tx,
            task: Mutex::new(Some(task)),
            stop_timeout: self.options.stop_timeout,
        }
    }
}

/// Control handle of a running consumer.
pub struct ConsumerHandle {
    queue: String,
    consumer_tag: String,
    state: Arc<watch::Sender<ConsumerState>>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    stop_timeout: Duration,
}

impl ConsumerHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Waits until the consumer reaches `target`, up to `limit`.
    pub async fn wait_for_state(&self, target: ConsumerState, limit: Duration) -> bool {
        let mut state = self.state.subscribe();
        let reached = tokio::time::timeout(limit, state.wait_for(|s| *s == target))
            .await
            .is_ok_and(|waited| waited.is_ok());
        reached
    }

    /// Stops the consumer. Idempotent; returns within the stop timeout even
    /// if a handler is stuck, aborting the task and its handler in that case.
    pub async fn stop_consuming(&self) {
        self.stop.send_replace(true);
        let task = self.task.lock().await.take();
        let Some(mut task) = task else {
            return;
        };

        match tokio::time::timeout(self.stop_timeout, &mut task).await {
            Ok(Ok(())) => info!(queue = %self.queue, "Stopped consuming messages"),
            Ok(Err(err)) => warn!(queue = %self.queue, "Consumer task ended abnormally: {}", err),
            Err(_) => {
                warn!(
                    queue = %self.queue,
                    "Consumer did not stop within {:?}, aborting",
                    self.stop_timeout
                );
                task.abort();
            }
        }
        self.state.send_replace(ConsumerState::Stopped);
    }
}

enum Settlement {
    Ack,
    Requeue,
    Reject,
}

/// Why a handler attempt did not succeed.
enum Failure {
    Malformed,
    Retryable,
}

/// Spawned handler run. Dropping it aborts the task, so aborting the
/// consumer loop never leaves a detached handler behind.
struct HandlerTask(JoinHandle<std::result::Result<(), HandlerError>>);

impl Drop for HandlerTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct ConsumerLoop {
    queue: String,
    consumer_tag: String,
    connection: Arc<ConnectionManager>,
    options: DispatcherOptions,
    topology: Option<Arc<Topology>>,
    /// Whether the queue was declared with a dead-letter exchange.
    dead_lettered: bool,
    handler: Arc<dyn MessageHandler>,
    ack_mode: AckMode,
    state: Arc<watch::Sender<ConsumerState>>,
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    // A dropped handle counts as a stop request.
    let _ = stop.wait_for(|requested| *requested).await;
}

/// Sleeps unless a stop arrives first. Returns whether to keep going.
async fn pause(stop: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = stopped(stop) => false,
        _ = sleep(delay) => true,
    }
}

impl ConsumerLoop {
    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }

    async fn open_stream(&self) -> Result<(Arc<dyn Session>, DeliveryStream)> {
        let session = self.connection.session().await?;
        if let Some(topology) = &self.topology {
            TopologyManager::new(self.connection.clone())
                .setup_topology(topology)
                .await?;
        }
        let stream = session
            .consume(
                &self.queue,
                &self.consumer_tag,
                self.ack_mode,
                self.options.prefetch,
            )
            .await?;
        Ok((session, stream))
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        loop {
            if *stop.borrow() {
                break;
            }
            self.set_state(ConsumerState::Connecting);

            let opened = tokio::select! {
                biased;
                _ = stopped(&mut stop) => break,
                opened = self.open_stream() => opened,
            };
            let (session, mut stream) = match opened {
                Ok(opened) => opened,
                Err(err) => {
                    warn!(queue = %self.queue, "Consumer could not subscribe: {}", err);
                    if pause(&mut stop, self.options.reconnect_delay).await {
                        continue;
                    }
                    break;
                }
            };

            // A stop that raced with the subscription must win.
            if *stop.borrow() {
                self.cancel(&session).await;
                break;
            }
            self.set_state(ConsumerState::Consuming);
            info!(queue = %self.queue, "Started consuming messages");

            let stop_requested = loop {
                let next = tokio::select! {
                    biased;
                    _ = stopped(&mut stop) => None,
                    next = stream.next() => Some(next),
                };
                match next {
                    None => break true,
                    Some(Some(Ok(delivery))) => self.dispatch(delivery, &mut stop).await,
                    Some(Some(Err(err))) => {
                        error!(queue = %self.queue, "Error receiving message: {}", err);
                        break false;
                    }
                    Some(None) => {
                        warn!(queue = %self.queue, "Delivery stream closed by broker");
                        break false;
                    }
                }
            };

            if stop_requested {
                self.cancel(&session).await;
                break;
            }
            if !session.is_open() {
                warn!(queue = %self.queue, "Channel disconnected, attempting to reconnect");
                self.connection.mark_disconnected().await;
            }
            if !pause(&mut stop, self.options.reconnect_delay).await {
                break;
            }
        }

        self.set_state(ConsumerState::Stopped);
        debug!(queue = %self.queue, "Consumer loop exited");
    }

    async fn cancel(&self, session: &Arc<dyn Session>) {
        if let Err(err) = session.cancel(&self.consumer_tag).await {
            debug!(queue = %self.queue, "Ignoring consumer cancel failure: {}", err);
        }
    }

    /// One handler run on its own task, so a panic only fails this attempt.
    async fn attempt(
        &self,
        metadata: &DeliveryMetadata,
        body: &Arc<Vec<u8>>,
        attempt: u32,
    ) -> std::result::Result<(), Failure> {
        let handler = self.handler.clone();
        let task_metadata = metadata.clone();
        let task_body = body.clone();
        let started = Instant::now();
        let mut task = HandlerTask(tokio::spawn(async move {
            handler.handle(&task_metadata, &task_body).await
        }));
        let outcome = (&mut task.0).await;
        telemetry::record_handler_duration(&self.queue, started.elapsed());

        let correlation_id = metadata.correlation_id.as_deref().unwrap_or("-");
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) if err.is_malformed() => {
                warn!(
                    queue = %self.queue,
                    delivery_tag = metadata.delivery_tag,
                    "Dropping malformed message: {}",
                    err
                );
                Err(Failure::Malformed)
            }
            Ok(Err(err)) => {
                error!(
                    queue = %self.queue,
                    delivery_tag = metadata.delivery_tag,
                    correlation_id = err.correlation_id().unwrap_or(correlation_id),
                    redelivered = metadata.redelivered,
                    attempt,
                    "Error processing message: {}",
                    err
                );
                Err(Failure::Retryable)
            }
            Err(join_error) => {
                error!(
                    queue = %self.queue,
                    delivery_tag = metadata.delivery_tag,
                    correlation_id,
                    attempt,
                    "Message handler panicked: {}",
                    join_error
                );
                Err(Failure::Retryable)
            }
        }
    }

    /// Settlement once the retry budget is spent: dead-letter when the queue
    /// has a DLX, otherwise hand the message back to the broker.
    fn exhausted(&self, metadata: &DeliveryMetadata) -> Settlement {
        if self.dead_lettered {
            warn!(
                queue = %self.queue,
                delivery_tag = metadata.delivery_tag,
                attempts = self.options.retry.max_attempts,
                "Retries exhausted, dead-lettering message"
            );
            Settlement::Reject
        } else {
            warn!(
                queue = %self.queue,
                delivery_tag = metadata.delivery_tag,
                attempts = self.options.retry.max_attempts,
                "Retries exhausted and no dead-letter exchange, requeueing message"
            );
            Settlement::Requeue
        }
    }

    async fn dispatch(&self, delivery: Delivery, stop: &mut watch::Receiver<bool>) {
        let Delivery {
            metadata,
            body,
            acker,
        } = delivery;
        let body = Arc::new(body);
        let retry = self.options.retry;

        let mut attempt = 1;
        let (settlement, outcome) = loop {
            match self.attempt(&metadata, &body, attempt).await {
                Ok(()) => {
                    debug!(
                        queue = %self.queue,
                        delivery_tag = metadata.delivery_tag,
                        correlation_id = metadata.correlation_id.as_deref().unwrap_or("-"),
                        attempt,
                        "Message processed"
                    );
                    break (Settlement::Ack, DeliveryOutcome::Acked);
                }
                Err(Failure::Malformed) => break (Settlement::Reject, DeliveryOutcome::Malformed),
                Err(Failure::Retryable) if attempt >= retry.max_attempts => {
                    break match self.exhausted(&metadata) {
                        Settlement::Reject => (Settlement::Reject, DeliveryOutcome::DeadLettered),
                        settlement => (settlement, DeliveryOutcome::Requeued),
                    };
                }
                Err(Failure::Retryable) => {
                    telemetry::record_delivery(&self.queue, DeliveryOutcome::Retried);
                    let delay = retry.delay_after(attempt);
                    debug!(queue = %self.queue, attempt, ?delay, "Retrying message");
                    if !pause(stop, delay).await {
                        debug!(queue = %self.queue, "Stop requested during retry, requeueing message");
                        break (Settlement::Requeue, DeliveryOutcome::Requeued);
                    }
                    attempt += 1;
                }
            }
        };
        telemetry::record_delivery(&self.queue, outcome);

        if self.ack_mode == AckMode::Auto {
            return;
        }
        let settled = match settlement {
            Settlement::Ack => acker.ack().await,
            Settlement::Requeue => acker.nack(true).await,
            Settlement::Reject => acker.reject(false).await,
        };
        if let Err(err) = settled {
            error!(
                queue = %self.queue,
                delivery_tag = metadata.delivery_tag,
                "Failed to acknowledge message: {}",
                err
            );
        }
    }
}
