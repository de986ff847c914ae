//! Broker abstraction for job arrival notifications.
//!
//! The queue is the only inter-process notification channel; the metadata
//! store stays authoritative for job state. Two backends, selected by URL:
//!
//! - no broker URL: DB polling. "Publish" is implicit in the queued row;
//!   receive atomically claims the oldest queued job.
//! - `amqp://`: RabbitMQ via lapin (behind the `amqp-broker` feature), with
//!   per-message acks and requeue on nack.
//!
//! Delivery is at-least-once either way; side effects downstream are
//! idempotent.

#[cfg(feature = "amqp-broker")]
pub mod amqp;
pub mod db;

pub use db::DbBroker;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::Settings;
use crate::repository::Repositories;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Repository(#[from] crate::repository::RepositoryError),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Backend-specific delivery handle.
#[derive(Debug)]
pub enum DeliveryTag {
    /// The DB claim already moved the job to `processing`; ack is a no-op.
    Claimed,
    /// AMQP delivery tag for ack/nack.
    #[cfg(feature = "amqp-broker")]
    Amqp(u64),
}

/// A received job notification. Must be acked or nacked exactly once.
#[derive(Debug)]
pub struct Delivery {
    pub job_id: String,
    /// How many times this job has been delivered to this process (1-based).
    pub attempt: u32,
    pub tag: DeliveryTag,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Announce a queued job to the workers.
    async fn publish(&self, job_id: &str) -> BrokerResult<()>;

    /// Wait up to `wait` for the next job. Returns `None` on idle timeout.
    async fn receive(&self, wait: Duration) -> BrokerResult<Option<Delivery>>;

    /// Whether `receive` already claimed the job (DB backend) or the worker
    /// still has to win the queued -> processing CAS (message backends).
    fn claims_on_receive(&self) -> bool;

    async fn ack(&self, delivery: Delivery) -> BrokerResult<()>;

    /// Negative acknowledgement; `requeue` requests redelivery.
    async fn nack(&self, delivery: Delivery, requeue: bool) -> BrokerResult<()>;
}

/// Build the configured broker backend.
pub async fn from_settings(
    settings: &Settings,
    repos: Repositories,
) -> BrokerResult<Arc<dyn Broker>> {
    match settings.broker_url.as_deref() {
        None | Some("") => Ok(Arc::new(DbBroker::new(
            repos,
            settings.max_concurrent_jobs,
        ))),
        Some(url) if url.starts_with("amqp://") || url.starts_with("amqps://") => {
            #[cfg(feature = "amqp-broker")]
            {
                Ok(Arc::new(amqp::AmqpBroker::connect(url).await?))
            }
            #[cfg(not(feature = "amqp-broker"))]
            {
                Err(BrokerError::Unavailable(
                    "amqp broker URL given but the `amqp-broker` feature is not enabled"
                        .to_string(),
                ))
            }
        }
        Some(other) => Err(BrokerError::Unavailable(format!(
            "unsupported broker URL: {}",
            other
        ))),
    }
}
