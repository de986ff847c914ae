//! RabbitMQ broker backend (feature `amqp-broker`).
//!
//! One durable queue of `{job_id}` payloads. Receive uses basic.get so the
//! worker keeps its poll-driven shape; unacked messages return to the queue
//! if the worker dies.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;

use super::{Broker, BrokerError, BrokerResult, Delivery, DeliveryTag};

const QUEUE_NAME: &str = "remocr.jobs";

pub struct AmqpBroker {
    channel: Channel,
    attempts: Mutex<HashMap<String, u32>>,
}

impl AmqpBroker {
    pub async fn connect(url: &str) -> BrokerResult<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        channel
            .queue_declare(
                QUEUE_NAME,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        Ok(Self {
            channel,
            attempts: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn publish(&self, job_id: &str) -> BrokerResult<()> {
        self.channel
            .basic_publish(
                "",
                QUEUE_NAME,
                BasicPublishOptions::default(),
                job_id.as_bytes(),
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> BrokerResult<Option<Delivery>> {
        let message = self
            .channel
            .basic_get(QUEUE_NAME, BasicGetOptions { no_ack: false })
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        let Some(message) = message else {
            tokio::time::sleep(wait).await;
            return Ok(None);
        };

        let job_id = String::from_utf8_lossy(&message.data).to_string();
        let mut attempts = self.attempts.lock().await;
        let attempt = attempts.entry(job_id.clone()).or_insert(0);
        *attempt += 1;
        Ok(Some(Delivery {
            job_id,
            attempt: *attempt,
            tag: DeliveryTag::Amqp(message.delivery_tag),
        }))
    }

    fn claims_on_receive(&self) -> bool {
        false
    }

    async fn ack(&self, delivery: Delivery) -> BrokerResult<()> {
        let DeliveryTag::Amqp(tag) = delivery.tag else {
            return Ok(());
        };
        self.attempts.lock().await.remove(&delivery.job_id);
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn nack(&self, delivery: Delivery, requeue: bool) -> BrokerResult<()> {
        let DeliveryTag::Amqp(tag) = delivery.tag else {
            return Ok(());
        };
        if !requeue {
            self.attempts.lock().await.remove(&delivery.job_id);
        }
        self.channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        Ok(())
    }
}
