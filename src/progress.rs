//! Debounced job status updater.
//!
//! Pipelines report progress far more often than the metadata store should
//! be written. This component coalesces high-frequency updates into durable
//! snapshots: at most one write per `debounce_interval` per job, except that
//! status changes and terminal transitions (`done`, `error`, `paused`) flush
//! synchronously. A background ticker flushes whatever is still pending once
//! its interval has passed, and shutdown drains everything.
//!
//! Guarantee: no status-changing update is ever dropped; intermediate
//! progress values may be.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::models::JobStatus;
use crate::repository::{JobRepository, RepoResult};

/// One status/progress snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub progress: f64,
    pub status_message: Option<String>,
    pub error_message: Option<String>,
}

impl JobUpdate {
    pub fn new(status: JobStatus, progress: f64) -> Self {
        Self {
            status,
            progress,
            status_message: None,
            error_message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.status_message = Some(message.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }
}

#[derive(Default)]
struct Entry {
    pending: Option<JobUpdate>,
    last_flush: Option<Instant>,
    last_status: Option<JobStatus>,
}

pub struct ProgressReporter {
    repo: JobRepository,
    interval: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl ProgressReporter {
    pub fn new(repo: JobRepository, interval: Duration) -> Self {
        Self {
            repo,
            interval,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Report a snapshot. Buffered unless the debounce window has passed,
    /// the status changed, or the status is terminal.
    pub async fn update(&self, job_id: &str, update: JobUpdate) -> RepoResult<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(job_id.to_string()).or_default();

        let status_changed = entry.last_status != Some(update.status);
        let within_window = entry
            .last_flush
            .map(|t| t.elapsed() < self.interval)
            .unwrap_or(false);

        if within_window && !status_changed && !update.status.is_terminal() {
            entry.pending = Some(update);
            return Ok(());
        }

        self.write(job_id, &update).await?;
        entry.pending = None;
        entry.last_flush = Some(Instant::now());
        entry.last_status = Some(update.status);
        Ok(())
    }

    /// Flush a job's pending snapshot immediately, if any.
    pub async fn flush(&self, job_id: &str) -> RepoResult<()> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(job_id) {
            if let Some(update) = entry.pending.take() {
                self.write(job_id, &update).await?;
                entry.last_flush = Some(Instant::now());
                entry.last_status = Some(update.status);
            }
        }
        Ok(())
    }

    /// Drop tracking state for a finished job.
    pub async fn forget(&self, job_id: &str) {
        self.entries.lock().await.remove(job_id);
    }

    /// Flush every pending snapshot whose debounce window has passed.
    pub async fn tick(&self) {
        let mut entries = self.entries.lock().await;
        for (job_id, entry) in entries.iter_mut() {
            let due = entry
                .last_flush
                .map(|t| t.elapsed() >= self.interval)
                .unwrap_or(true);
            if !due {
                continue;
            }
            if let Some(update) = entry.pending.take() {
                if let Err(e) = self.write(job_id, &update).await {
                    tracing::warn!(job_id = %job_id, "debounced flush failed: {}", e);
                    entry.pending = Some(update);
                    continue;
                }
                entry.last_flush = Some(Instant::now());
                entry.last_status = Some(update.status);
            }
        }
    }

    /// Flush everything, regardless of intervals. Called on shutdown.
    pub async fn drain(&self) {
        let mut entries = self.entries.lock().await;
        for (job_id, entry) in entries.iter_mut() {
            if let Some(update) = entry.pending.take() {
                if let Err(e) = self.write(job_id, &update).await {
                    tracing::warn!(job_id = %job_id, "drain flush failed: {}", e);
                }
            }
        }
    }

    async fn write(&self, job_id: &str, update: &JobUpdate) -> RepoResult<()> {
        // In-flight progress snapshots must not resurrect a job that was
        // paused or cancelled between report and flush; terminal writes land
        // unconditionally (their transition was validated upstream).
        if update.status == JobStatus::Processing {
            let landed = self
                .repo
                .update_progress_if_processing(
                    job_id,
                    update.progress,
                    update.status_message.as_deref(),
                )
                .await?;
            if !landed {
                tracing::debug!(job_id = %job_id, "dropped stale progress snapshot");
            }
            return Ok(());
        }
        self.repo
            .update_progress(
                job_id,
                update.status,
                update.progress,
                update.status_message.as_deref(),
                update.error_message.as_deref(),
            )
            .await
    }

    /// Run the background ticker until the shutdown signal fires, then drain.
    pub fn spawn_ticker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let reporter = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reporter.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => reporter.tick().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            reporter.drain().await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EngineKind, Job, JobStatus};
    use crate::repository::Repositories;
    use tempfile::tempdir;

    async fn setup() -> (Repositories, Job, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let repos = Repositories::connect(&format!("sqlite:{}", db_path.display()))
            .await
            .unwrap();
        let job = Job::new(
            "client-1",
            "hash",
            "doc.pdf",
            "Task",
            EngineKind::Vision,
            JobStatus::Processing,
            None,
        );
        repos.jobs.insert(&job).await.unwrap();
        (repos, job, dir)
    }

    #[tokio::test]
    async fn test_buffers_within_interval() {
        let (repos, job, _dir) = setup().await;
        let reporter = ProgressReporter::new(repos.jobs.clone(), Duration::from_millis(200));

        // First update always flushes (status was unknown).
        reporter
            .update(&job.id, JobUpdate::new(JobStatus::Processing, 0.1))
            .await
            .unwrap();
        // Second within the window buffers.
        reporter
            .update(&job.id, JobUpdate::new(JobStatus::Processing, 0.2))
            .await
            .unwrap();

        let stored = repos.jobs.require(&job.id).await.unwrap();
        assert!((stored.progress - 0.1).abs() < 1e-9);

        // After the window the ticker picks up the pending value.
        tokio::time::sleep(Duration::from_millis(250)).await;
        reporter.tick().await;
        let stored = repos.jobs.require(&job.id).await.unwrap();
        assert!((stored.progress - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_terminal_flushes_immediately() {
        let (repos, job, _dir) = setup().await;
        let reporter = ProgressReporter::new(repos.jobs.clone(), Duration::from_secs(60));

        reporter
            .update(&job.id, JobUpdate::new(JobStatus::Processing, 0.5))
            .await
            .unwrap();
        reporter
            .update(
                &job.id,
                JobUpdate::new(JobStatus::Done, 1.0).with_message("complete"),
            )
            .await
            .unwrap();

        let stored = repos.jobs.require(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Done);
        assert!((stored.progress - 1.0).abs() < 1e-9);
        assert_eq!(stored.status_message.as_deref(), Some("complete"));
    }

    #[tokio::test]
    async fn test_status_change_flushes_despite_window() {
        let (repos, job, _dir) = setup().await;
        let reporter = ProgressReporter::new(repos.jobs.clone(), Duration::from_secs(60));

        reporter
            .update(&job.id, JobUpdate::new(JobStatus::Processing, 0.5))
            .await
            .unwrap();
        // Same tick, but a new status: must not be dropped or delayed.
        reporter
            .update(&job.id, JobUpdate::new(JobStatus::Paused, 0.5))
            .await
            .unwrap();

        let stored = repos.jobs.require(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Paused);
    }

    #[tokio::test]
    async fn test_drain_writes_pending() {
        let (repos, job, _dir) = setup().await;
        let reporter = ProgressReporter::new(repos.jobs.clone(), Duration::from_secs(60));

        reporter
            .update(&job.id, JobUpdate::new(JobStatus::Processing, 0.1))
            .await
            .unwrap();
        reporter
            .update(&job.id, JobUpdate::new(JobStatus::Processing, 0.7))
            .await
            .unwrap();
        reporter.drain().await;

        let stored = repos.jobs.require(&job.id).await.unwrap();
        assert!((stored.progress - 0.7).abs() < 1e-9);
    }
}
