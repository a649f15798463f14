//! AMQP 0.9.1 backend (lapin)
//!
//! Maps the wire contract onto a real broker: confirm-select channels,
//! `basic_publish` publisher confirms, `basic_consume` delivery streams,
//! per-tag ack/nack. Enabled with the `amqp` cargo feature.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Connection, ConnectionProperties};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use cv_common::{BrokerConfig, QueueOptions};

use crate::{
    BrokerChannel, BrokerConnection, BrokerError, BrokerTransport, Confirm, ConfirmHandle,
    RawDelivery, Result,
};

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Dials AMQP connections with lapin.
#[derive(Debug, Default, Clone)]
pub struct AmqpTransport;

impl AmqpTransport {
    pub fn new() -> Self {
        Self
    }

    fn uri(config: &BrokerConfig) -> String {
        format!(
            "amqp://{}:{}@{}:{}/%2f",
            config.username, config.password, config.host, config.port
        )
    }
}

fn map_connect_error(err: lapin::Error, config: &BrokerConfig) -> BrokerError {
    let text = err.to_string();
    if text.contains("ACCESS_REFUSED") || text.contains("ACCESS-REFUSED") {
        BrokerError::AccessRefused(config.username.clone())
    } else {
        BrokerError::Unreachable(text)
    }
}

fn map_channel_error(err: lapin::Error) -> BrokerError {
    BrokerError::Protocol(err.to_string())
}

#[async_trait]
impl BrokerTransport for AmqpTransport {
    async fn connect(&self, config: &BrokerConfig) -> Result<Box<dyn BrokerConnection>> {
        let properties =
            ConnectionProperties::default().with_connection_name(config.connection_name.clone().into());

        let connection = Connection::connect(&Self::uri(config), properties)
            .await
            .map_err(|e| map_connect_error(e, config))?;

        debug!(host = %config.host, port = config.port, "AMQP connection established");
        Ok(Box::new(AmqpConnection { inner: connection }))
    }
}

struct AmqpConnection {
    inner: Connection,
}

impl std::fmt::Debug for AmqpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpConnection").finish_non_exhaustive()
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|_| BrokerError::ConnectionClosed)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(map_channel_error)?;

        Ok(Box::new(AmqpChannel {
            inner: channel,
            next_publish_seq: AtomicU64::new(0),
        }))
    }

    async fn closed(&self) {
        while self.inner.status().connected() {
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        }
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) {
        if let Err(e) = self.inner.close(200, "client shutdown").await {
            debug!(error = %e, "error closing AMQP connection");
        }
    }
}

struct AmqpChannel {
    inner: lapin::Channel,
    next_publish_seq: AtomicU64,
}

/// Redeliveries as reported by the broker. Quorum queues carry an exact
/// `x-delivery-count`; classic queues only flag `redelivered`, which still
/// trips the first ceiling check.
fn redelivery_count(delivery: &Delivery) -> u32 {
    if let Some(headers) = delivery.properties.headers() {
        let count = headers
            .inner()
            .iter()
            .find(|(key, _)| key.as_str() == "x-delivery-count")
            .map(|(_, value)| value);
        if let Some(value) = count {
            return match value {
                AMQPValue::LongLongInt(v) => *v as u32,
                AMQPValue::LongInt(v) => *v as u32,
                AMQPValue::LongUInt(v) => *v,
                _ => 0,
            };
        }
    }
    if delivery.redelivered {
        1
    } else {
        0
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, options: &QueueOptions) -> Result<()> {
        let declare = QueueDeclareOptions {
            durable: options.durable,
            ..QueueDeclareOptions::default()
        };

        self.inner
            .queue_declare(&options.name, declare, FieldTable::default())
            .await
            .map_err(|e| {
                let text = e.to_string();
                if text.contains("PRECONDITION") {
                    BrokerError::DeclareConflict {
                        queue: options.name.clone(),
                        existing: !options.durable,
                    }
                } else {
                    map_channel_error(e)
                }
            })?;

        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        content_type: &str,
    ) -> Result<ConfirmHandle> {
        let sequence = self.next_publish_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let properties = BasicProperties::default().with_content_type(content_type.into());

        let pending = self
            .inner
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|_| BrokerError::ChannelClosed)?;

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            match pending.await {
                Ok(Confirmation::Ack(_)) | Ok(Confirmation::NotRequested) => {
                    let _ = tx.send(Confirm::Ack);
                }
                Ok(Confirmation::Nack(_)) => {
                    let _ = tx.send(Confirm::Nack);
                }
                Err(e) => {
                    // Dropping tx reports the channel as closed to the waiter.
                    warn!(error = %e, "publisher confirm failed");
                }
            }
        });

        Ok(ConfirmHandle::new(sequence, rx))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<mpsc::Receiver<RawDelivery>> {
        self.inner
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(map_channel_error)?;

        let mut consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_channel_error)?;

        let capacity = prefetch.max(1) as usize;
        let (tx, rx) = mpsc::channel(capacity);

        tokio::spawn(async move {
            while let Some(item) = consumer.next().await {
                match item {
                    Ok(delivery) => {
                        let raw = RawDelivery {
                            delivery_tag: delivery.delivery_tag,
                            redelivery_count: redelivery_count(&delivery),
                            content_type: delivery
                                .properties
                                .content_type()
                                .clone()
                                .map(|s| s.to_string())
                                .unwrap_or_else(|| "application/octet-stream".to_string()),
                            payload: delivery.data,
                        };
                        if tx.send(raw).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "consumer stream error");
                        break;
                    }
                }
            }
            debug!("consumer stream ended");
        });

        Ok(rx)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|_| BrokerError::ChannelClosed)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.inner
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|_| BrokerError::ChannelClosed)
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) {
        if let Err(e) = self.inner.close(200, "client shutdown").await {
            debug!(error = %e, "error closing AMQP channel");
        }
    }
}
