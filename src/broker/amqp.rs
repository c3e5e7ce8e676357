// src/broker/amqp.rs
//
// RabbitMQ backend built on lapin.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::*,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::errors::{BrokerError, Result};
use super::session::{
    AckMode, Acknowledger, Binding, Connector, Delivery, DeliveryMetadata, DeliveryStream,
    ExchangeKind, ExchangeSpec, OutgoingProperties, QueueSpec, Session,
};

const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections, one channel each.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    /// Enable publisher confirms on the channel.
    pub confirm_mode: bool,
}

impl Default for AmqpConnector {
    fn default() -> Self {
        Self { confirm_mode: true }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn open(&self, url: &str) -> Result<Box<dyn Session>> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to create channel: {}", e)))?;

        if self.confirm_mode {
            debug!("Enabling confirm mode for channel {}", channel.id());
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| BrokerError::Channel(format!("Failed to enable confirm mode: {}", e)))?;
        }

        info!("Channel {} created and configured successfully", channel.id());
        Ok(Box::new(AmqpSession {
            connection,
            channel,
            op_lock: Mutex::new(()),
        }))
    }

    fn backend(&self) -> &'static str {
        "amqp"
    }
}

/// A lapin connection with its single channel. Channel RPCs are serialized
/// through `op_lock`.
pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
    op_lock: Mutex<()>,
}

fn lapin_kind(kind: &ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

fn properties_for(outgoing: &OutgoingProperties) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_message_id(outgoing.message_id.clone().into())
        .with_content_type(outgoing.content_type.clone().into())
        .with_timestamp(outgoing.timestamp.timestamp().max(0) as u64);
    if outgoing.persistent {
        properties = properties.with_delivery_mode(2);
    }
    if let Some(correlation_id) = &outgoing.correlation_id {
        properties = properties.with_correlation_id(correlation_id.clone().into());
    }
    properties
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;
    let metadata = DeliveryMetadata {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        message_id: properties.message_id().as_ref().map(|s| s.as_str().to_string()),
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|s| s.as_str().to_string()),
        content_type: properties.content_type().as_ref().map(|s| s.as_str().to_string()),
    };
    Delivery {
        metadata,
        body: delivery.data,
        acker: Box::new(AmqpAcker {
            acker: delivery.acker,
        }),
    }
}

#[async_trait]
impl Session for AmqpSession {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.channel
            .exchange_declare(
                &spec.name,
                lapin_kind(&spec.kind),
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        let _op = self.op_lock.lock().await;
        let mut arguments = FieldTable::default();
        if let Some(dlx) = &spec.dead_letter_exchange {
            arguments.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(dlx.clone().into()),
            );
        }
        let queue = self
            .channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    ..QueueDeclareOptions::default()
                },
                arguments,
            )
            .await?;
        debug!(
            "Queue '{}' declared with {} messages",
            spec.name,
            queue.message_count()
        );
        Ok(())
    }

    async fn bind(&self, binding: &Binding) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &OutgoingProperties,
    ) -> Result<()> {
        let _op = self.op_lock.lock().await;
        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties_for(properties),
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(BrokerError::Publish(format!(
                "broker refused message for '{}' on '{}'",
                routing_key, exchange
            )));
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        ack_mode: AckMode,
        prefetch: u16,
    ) -> Result<DeliveryStream> {
        let _op = self.op_lock.lock().await;
        if prefetch > 0 {
            debug!("Setting channel QoS to {}", prefetch);
            self.channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(|e| BrokerError::Channel(format!("Failed to set QoS: {}", e)))?;
        }

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: ack_mode == AckMode::Auto,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;

        Ok(consumer
            .map(|delivery| delivery.map(into_delivery).map_err(BrokerError::from))
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let _op = self.op_lock.lock().await;
        if self.channel.status().connected() {
            self.channel
                .basic_cancel(consumer_tag, BasicCancelOptions::default())
                .await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel.close(REPLY_SUCCESS, "Closing channel").await?;
        }
        if self.connection.status().connected() {
            self.connection
                .close(REPLY_SUCCESS, "Closing connection")
                .await?;
        }
        Ok(())
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_properties_mark_json_persistent() {
        let mut outgoing = OutgoingProperties::json("msg-1".into(), Some("scan-1".into()));
        outgoing.timestamp = chrono::Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let properties = properties_for(&outgoing);

        assert_eq!(*properties.delivery_mode(), Some(2));
        assert_eq!(
            properties.content_type().as_ref().map(|s| s.as_str()),
            Some("application/json")
        );
        assert_eq!(
            properties.correlation_id().as_ref().map(|s| s.as_str()),
            Some("scan-1")
        );
        assert_eq!(*properties.timestamp(), Some(1_700_000_000));
    }

    #[test]
    fn test_exchange_kind_mapping() {
        assert!(matches!(lapin_kind(&ExchangeKind::Topic), lapin::ExchangeKind::Topic));
        assert!(matches!(lapin_kind(&ExchangeKind::Fanout), lapin::ExchangeKind::Fanout));
    }
}
