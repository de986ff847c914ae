//! DB-polling broker: the queued rows are the queue.
//!
//! Receive atomically claims the oldest queued job through the metadata
//! store. A process-local `Notify` gives the colocated server+worker setup a
//! fast path past the idle poll interval; cross-process wakeups still ride
//! the poll.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::models::JobEvent;
use crate::repository::Repositories;

use super::{Broker, BrokerResult, Delivery, DeliveryTag};

pub struct DbBroker {
    repos: Repositories,
    max_concurrent: usize,
    wakeup: Notify,
    attempts: Mutex<HashMap<String, u32>>,
}

impl DbBroker {
    pub fn new(repos: Repositories, max_concurrent: usize) -> Self {
        Self {
            repos,
            max_concurrent,
            wakeup: Notify::new(),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    async fn try_claim(&self) -> BrokerResult<Option<Delivery>> {
        let Some(job) = self
            .repos
            .jobs
            .claim_next_queued(self.max_concurrent)
            .await?
        else {
            return Ok(None);
        };
        let mut attempts = self.attempts.lock().await;
        let attempt = attempts.entry(job.id.clone()).or_insert(0);
        *attempt += 1;
        Ok(Some(Delivery {
            job_id: job.id,
            attempt: *attempt,
            tag: DeliveryTag::Claimed,
        }))
    }

    async fn clear_attempts(&self, job_id: &str) {
        self.attempts.lock().await.remove(job_id);
    }
}

#[async_trait]
impl Broker for DbBroker {
    async fn publish(&self, _job_id: &str) -> BrokerResult<()> {
        // The queued row is already visible to every worker; just short-cut
        // the local poll loop.
        self.wakeup.notify_one();
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> BrokerResult<Option<Delivery>> {
        if let Some(delivery) = self.try_claim().await? {
            return Ok(Some(delivery));
        }
        let _ = tokio::time::timeout(wait, self.wakeup.notified()).await;
        self.try_claim().await
    }

    fn claims_on_receive(&self) -> bool {
        true
    }

    async fn ack(&self, delivery: Delivery) -> BrokerResult<()> {
        self.clear_attempts(&delivery.job_id).await;
        Ok(())
    }

    async fn nack(&self, delivery: Delivery, requeue: bool) -> BrokerResult<()> {
        if requeue {
            // Put the claim back; the next receive will pick it up again.
            self.repos
                .jobs
                .apply_event(&delivery.job_id, JobEvent::Restart)
                .await?;
            self.wakeup.notify_one();
        } else {
            self.clear_attempts(&delivery.job_id).await;
        }
        Ok(())
    }
}
