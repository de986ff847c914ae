//! Worker runtime: the long-running broker consumer.
//!
//! Receives `{job_id}` notifications, claims jobs, and drives the pipeline
//! under a per-host executor semaphore and a hard per-job time limit.
//! Transient failures requeue through the broker (at most three deliveries);
//! deterministic failures mark the job `error` on the first try.

use std::sync::Arc;

use tokio::sync::{watch, Semaphore};

use crate::broker::{Broker, Delivery};
use crate::models::{JobEvent, JobSettings, JobStatus};
use crate::pipeline::{ExecOutcome, JobExecutor, PipelineDeps};
use crate::progress::JobUpdate;
use crate::repository::RepositoryError;

const MAX_DELIVERIES: u32 = 3;

pub struct WorkerRuntime {
    deps: Arc<PipelineDeps>,
    broker: Arc<dyn Broker>,
    slots: Arc<Semaphore>,
    identity: String,
}

impl WorkerRuntime {
    pub fn new(deps: Arc<PipelineDeps>, broker: Arc<dyn Broker>) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown-host".to_string());
        let slots = deps.settings.max_concurrent_jobs.max(1);
        Self {
            deps,
            broker,
            slots: Arc::new(Semaphore::new(slots)),
            identity: format!("{}-{}", host, std::process::id()),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Consume the broker until shutdown, then wait for in-flight jobs.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker = %self.identity, "worker started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = self.broker.receive(self.deps.settings.poll_interval) => {
                    match received {
                        Ok(Some(delivery)) => self.dispatch(delivery).await,
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(worker = %self.identity, "broker receive failed: {}", e);
                            tokio::time::sleep(self.deps.settings.poll_interval).await;
                        }
                    }
                }
            }
        }

        // Drain: every executor slot idle means every job finished.
        let total = self.deps.settings.max_concurrent_jobs.max(1) as u32;
        let _ = self.slots.acquire_many(total).await;
        tracing::info!(worker = %self.identity, "worker stopped");
    }

    /// Claim (when the broker did not) and spawn an executor for a delivery.
    async fn dispatch(&self, delivery: Delivery) {
        if !self.broker.claims_on_receive() {
            match self
                .deps
                .repos
                .jobs
                .apply_event(&delivery.job_id, JobEvent::Claim)
                .await
            {
                Ok(_) => {}
                Err(RepositoryError::InvalidTransition { .. })
                | Err(RepositoryError::NotFound(_)) => {
                    // Stale message: paused, cancelled, or already claimed.
                    tracing::debug!(job_id = %delivery.job_id, "discarding stale delivery");
                    let _ = self.broker.ack(delivery).await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(job_id = %delivery.job_id, "claim failed: {}", e);
                    let _ = self.broker.nack(delivery, true).await;
                    return;
                }
            }
        }

        let permit = match self.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let deps = Arc::clone(&self.deps);
        let broker = Arc::clone(&self.broker);
        let identity = self.identity.clone();
        tokio::spawn(async move {
            let _permit = permit;
            run_job(deps, broker, delivery, &identity).await;
        });
    }
}

/// Execute one claimed job end to end and settle its delivery.
async fn run_job(
    deps: Arc<PipelineDeps>,
    broker: Arc<dyn Broker>,
    delivery: Delivery,
    worker: &str,
) {
    let job_id = delivery.job_id.clone();

    let job = match deps.repos.jobs.get(&job_id).await {
        Ok(Some(job)) if job.status == JobStatus::Processing => job,
        Ok(_) => {
            tracing::debug!(job_id = %job_id, "job not in processing state; discarding");
            let _ = broker.ack(delivery).await;
            return;
        }
        Err(e) => {
            tracing::warn!(job_id = %job_id, "failed to load job: {}", e);
            let _ = broker.nack(delivery, true).await;
            return;
        }
    };

    let job_settings = match deps.repos.jobs.get_settings(&job_id).await {
        Ok(Some(settings)) => settings,
        Ok(None) => JobSettings::new(&job_id),
        Err(e) => {
            tracing::warn!(job_id = %job_id, "failed to load settings: {}", e);
            let _ = broker.nack(delivery, true).await;
            return;
        }
    };

    tracing::info!(job_id = %job_id, worker = %worker, attempt = delivery.attempt, "executing job");
    let executor = JobExecutor::new(Arc::clone(&deps), job, job_settings);
    let outcome = tokio::time::timeout(deps.settings.task_time_limit, executor.execute()).await;

    match outcome {
        Err(_) => {
            // Hard time limit: terminal, not retried.
            tracing::warn!(job_id = %job_id, "job exceeded the task time limit");
            finish_error(&deps, &job_id, "job exceeded the task time limit").await;
            let _ = broker.ack(delivery).await;
        }
        Ok(Ok(ExecOutcome::Completed)) => {
            finish_done(&deps, &job_id).await;
            let _ = broker.ack(delivery).await;
        }
        Ok(Ok(ExecOutcome::Paused)) => {
            // The API already set the row to paused; progress stays frozen
            // at its last durable value. Buffered snapshots are discarded.
            tracing::info!(job_id = %job_id, "job paused at checkpoint");
            deps.reporter.forget(&job_id).await;
            let _ = broker.ack(delivery).await;
        }
        Ok(Ok(ExecOutcome::Cancelled)) => {
            tracing::info!(job_id = %job_id, "job cancelled during execution");
            deps.reporter.forget(&job_id).await;
            let _ = broker.ack(delivery).await;
        }
        Ok(Err(e)) => {
            if e.is_transient() && delivery.attempt < MAX_DELIVERIES {
                tracing::warn!(
                    job_id = %job_id,
                    attempt = delivery.attempt,
                    "transient failure, requeueing: {}", e
                );
                deps.reporter.forget(&job_id).await;
                let _ = broker.nack(delivery, true).await;
            } else {
                tracing::error!(job_id = %job_id, "job failed: {}", e);
                finish_error(&deps, &job_id, &e.to_string()).await;
                let _ = broker.ack(delivery).await;
            }
        }
    }
}

async fn finish_done(deps: &PipelineDeps, job_id: &str) {
    match deps
        .repos
        .jobs
        .apply_event(job_id, JobEvent::Complete)
        .await
    {
        Ok(_) => {
            let update = JobUpdate::new(JobStatus::Done, 1.0).with_message("complete");
            if let Err(e) = deps.reporter.update(job_id, update).await {
                tracing::warn!(job_id = %job_id, "final progress write failed: {}", e);
            }
        }
        Err(e) => {
            // Cancelled or restarted between the last checkpoint and now.
            tracing::debug!(job_id = %job_id, "completion transition rejected: {}", e);
        }
    }
    deps.reporter.forget(job_id).await;
}

async fn finish_error(deps: &PipelineDeps, job_id: &str, message: &str) {
    match deps.repos.jobs.apply_event(job_id, JobEvent::Fail).await {
        Ok(job) => {
            let update = JobUpdate::new(JobStatus::Error, job.progress)
                .with_message("failed")
                .with_error(message.chars().take(512).collect::<String>());
            if let Err(e) = deps.reporter.update(job_id, update).await {
                tracing::warn!(job_id = %job_id, "error status write failed: {}", e);
            }
        }
        Err(e) => {
            tracing::debug!(job_id = %job_id, "failure transition rejected: {}", e);
        }
    }
    deps.reporter.forget(job_id).await;
}
