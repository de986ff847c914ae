//! The two-pass OCR pipeline.
//!
//! Rendering a large PDF whole exhausts RAM, and recognizing while rendering
//! back-pressures the vision backend into the renderer. The pipeline
//! decouples the two: Pass 1 streams pages into per-block crop files plus an
//! on-disk manifest, Pass 2 replays the manifest through a bounded pool of
//! backend calls. Verification retries whatever came back missing, and the
//! artifact phase publishes the results.
//!
//! Pause and cancellation are cooperative: the executor re-reads its job row
//! at phase boundaries and every few completions. A deleted row means
//! cancelled; a paused row stops the execution cleanly (a later resume
//! re-runs from Pass 1; executions are stateless between claims).

pub mod artifacts;
pub mod dispatch;
pub mod manifest;
pub mod matcher;
pub mod render;
pub mod strip;
pub mod verify;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::config::Settings;
use crate::models::{parse_blocks, Block, Job, JobSettings, JobStatus, ResultRecord};
use crate::ocr::{Dispatcher, OcrError};
use crate::progress::{JobUpdate, ProgressReporter};
use crate::repository::{Repositories, RepositoryError};
use crate::storage::{ObjectStore, StorageError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Ocr(#[from] OcrError),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{0}")]
    Internal(String),
}

impl PipelineError {
    /// Whether re-running the whole job could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Storage(_) | PipelineError::Repository(_) => true,
            PipelineError::Ocr(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// How an execution ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Completed,
    Paused,
    Cancelled,
}

/// Signal from a checkpoint probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Continue,
    Pause,
    Cancel,
}

/// Shared collaborators, constructed once per process and threaded in.
pub struct PipelineDeps {
    pub repos: Repositories,
    pub store: Arc<dyn ObjectStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub reporter: Arc<ProgressReporter>,
    pub settings: Arc<Settings>,
}

/// One job execution: workspace, inputs, phase sequencing.
pub struct JobExecutor {
    deps: Arc<PipelineDeps>,
    job: Job,
    job_settings: JobSettings,
}

impl JobExecutor {
    pub fn new(deps: Arc<PipelineDeps>, job: Job, job_settings: JobSettings) -> Self {
        Self {
            deps,
            job,
            job_settings,
        }
    }

    /// Probe the job row for pause/cancel.
    pub async fn checkpoint(&self) -> Result<Checkpoint, PipelineError> {
        match self.deps.repos.jobs.get(&self.job.id).await? {
            None => Ok(Checkpoint::Cancel),
            Some(current) => match current.status {
                JobStatus::Paused => Ok(Checkpoint::Pause),
                JobStatus::Processing => Ok(Checkpoint::Continue),
                // Restarted or otherwise reassigned while we ran: this
                // execution is stale.
                _ => Ok(Checkpoint::Cancel),
            },
        }
    }

    pub(crate) async fn report(&self, progress: f64, message: &str) -> Result<(), PipelineError> {
        self.deps
            .reporter
            .update(
                &self.job.id,
                JobUpdate::new(JobStatus::Processing, progress).with_message(message),
            )
            .await?;
        Ok(())
    }

    /// Run the full pipeline. Errors propagate to the worker, which owns the
    /// done/error transition.
    pub async fn execute(&self) -> Result<ExecOutcome, PipelineError> {
        let workspace = tempfile::tempdir()?;
        tracing::info!(job_id = %self.job.id, workspace = %workspace.path().display(), "starting execution");

        // Fetch inputs from the object store.
        self.report(0.0, "downloading inputs").await?;
        let pdf_path = workspace.path().join("document.pdf");
        self.deps
            .store
            .download_to_file(&self.job.object_key("document.pdf"), &pdf_path)
            .await?;
        let blocks_bytes = self
            .deps
            .store
            .download(&self.job.object_key("blocks.json"))
            .await?;
        let blocks: Vec<Block> = parse_blocks(&blocks_bytes)
            .map_err(|e| PipelineError::InvalidInput(format!("blocks.json: {}", e)))?;

        let mut results: HashMap<String, ResultRecord> = HashMap::new();

        if blocks.is_empty() {
            // Empty request: publish empty artifacts and succeed.
            tracing::info!(job_id = %self.job.id, "no blocks requested; producing empty artifacts");
            self.report(0.9, "assembling artifacts").await?;
            artifacts::build_artifacts(
                &self.deps,
                &self.job,
                &blocks,
                &results,
                &pdf_path,
                workspace.path(),
            )
            .await?;
            return Ok(ExecOutcome::Completed);
        }

        // Pass 1: render and crop.
        let pass_one = render::run_pass_one(
            &self.deps,
            self,
            &self.job,
            &blocks,
            &pdf_path,
            workspace.path(),
        )
        .await?;
        let pass_one = match pass_one {
            render::PassOneOutcome::Finished(output) => output,
            render::PassOneOutcome::Stopped(outcome) => return Ok(outcome),
        };
        for block_id in &pass_one.failed {
            results.insert(block_id.clone(), ResultRecord::failed(block_id.clone()));
        }

        // Pass 2: dispatch and collect.
        match dispatch::run_pass_two(
            &self.deps,
            self,
            &self.job,
            &self.job_settings,
            &blocks,
            &pass_one,
            &mut results,
        )
        .await?
        {
            Checkpoint::Continue => {}
            Checkpoint::Pause => return Ok(ExecOutcome::Paused),
            Checkpoint::Cancel => return Ok(ExecOutcome::Cancelled),
        }

        // Verification: retry whatever is missing or failed, one block at a
        // time.
        self.report(0.9, "verifying missing blocks").await?;
        match verify::run_verification(
            &self.deps,
            self,
            &self.job,
            &self.job_settings,
            &blocks,
            &pdf_path,
            workspace.path(),
            &mut results,
        )
        .await?
        {
            Checkpoint::Continue => {}
            Checkpoint::Pause => return Ok(ExecOutcome::Paused),
            Checkpoint::Cancel => return Ok(ExecOutcome::Cancelled),
        }

        // Pass-2 leftovers are gone now; delete the crops and manifest
        // before the artifact phase re-crops what it needs.
        let _ = tokio::fs::remove_file(&pass_one.manifest_path).await;
        let _ = tokio::fs::remove_dir_all(workspace.path().join("crops")).await;

        self.report(0.95, "assembling artifacts").await?;
        artifacts::build_artifacts(
            &self.deps,
            &self.job,
            &blocks,
            &results,
            &pdf_path,
            workspace.path(),
        )
        .await?;

        tracing::info!(job_id = %self.job.id, "execution complete");
        Ok(ExecOutcome::Completed)
    }
}
