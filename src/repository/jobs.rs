//! Job rows: lifecycle transitions, claims, change feed, cascade delete.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};

use crate::models::{EngineKind, Job, JobEvent, JobSettings, JobStatus};
use crate::schema::{job_files, job_settings, jobs};
use crate::with_conn;

use super::pool::DbPool;
use super::records::{now_ts, ts, JobRecord, JobSettingsRecord, NewJob, NewJobSettings};
use super::{RepoResult, RepositoryError};

/// Outcome of a transactional transition attempt.
enum TransitionOutcome {
    Updated(JobRecord),
    Invalid(String),
    Missing,
}

#[derive(Clone)]
pub struct JobRepository {
    pool: DbPool,
}

impl JobRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Persist a freshly created job.
    pub async fn insert(&self, job: &Job) -> RepoResult<()> {
        with_conn!(self.pool, conn, {
            diesel::insert_into(jobs::table)
                .values(NewJob::from_job(job))
                .execute(&mut conn)
                .await?;
            Ok(())
        })
    }

    pub async fn get(&self, id: &str) -> RepoResult<Option<Job>> {
        with_conn!(self.pool, conn, {
            let record: Option<JobRecord> = jobs::table
                .filter(jobs::id.eq(id))
                .first(&mut conn)
                .await
                .optional()?;
            Ok(record.map(Job::from))
        })
    }

    pub async fn require(&self, id: &str) -> RepoResult<Job> {
        self.get(id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("job {}", id)))
    }

    /// List jobs newest first, optionally filtered by owner and document.
    pub async fn list(
        &self,
        client_id: Option<&str>,
        document_id: Option<&str>,
    ) -> RepoResult<Vec<Job>> {
        with_conn!(self.pool, conn, {
            let mut query = jobs::table.order(jobs::created_at.desc()).into_boxed();
            if let Some(client) = client_id {
                query = query.filter(jobs::client_id.eq(client));
            }
            if let Some(doc) = document_id {
                query = query.filter(jobs::document_id.eq(doc));
            }
            let records: Vec<JobRecord> = query.load(&mut conn).await?;
            Ok(records.into_iter().map(Job::from).collect())
        })
    }

    /// Incremental polling feed: jobs with `updated_at > since`.
    pub async fn list_changed_since(&self, since: DateTime<Utc>) -> RepoResult<Vec<Job>> {
        let cutoff = ts(since);
        with_conn!(self.pool, conn, {
            let records: Vec<JobRecord> = jobs::table
                .filter(jobs::updated_at.gt(cutoff))
                .order(jobs::updated_at.asc())
                .load(&mut conn)
                .await?;
            Ok(records.into_iter().map(Job::from).collect())
        })
    }

    /// Number of jobs counting against the admission queue.
    pub async fn count_active(&self) -> RepoResult<u64> {
        let (queued, processing) = self.queue_depth().await?;
        Ok(queued + processing)
    }

    /// (queued, processing) counts.
    pub async fn queue_depth(&self) -> RepoResult<(u64, u64)> {
        with_conn!(self.pool, conn, {
            let queued: i64 = jobs::table
                .filter(jobs::status.eq(JobStatus::Queued.as_str()))
                .count()
                .get_result(&mut conn)
                .await?;
            let processing: i64 = jobs::table
                .filter(jobs::status.eq(JobStatus::Processing.as_str()))
                .count()
                .get_result(&mut conn)
                .await?;
            Ok((queued as u64, processing as u64))
        })
    }

    /// Apply a state-machine event with a compare-and-swap inside a
    /// transaction. Returns the updated job, or `invalid_transition`.
    pub async fn apply_event(&self, id: &str, event: JobEvent) -> RepoResult<Job> {
        let id = id.to_string();
        let outcome = with_conn!(self.pool, conn, {
            conn.transaction::<TransitionOutcome, diesel::result::Error, _>(|conn| {
                let id = id.clone();
                Box::pin(async move {
                    let record: Option<JobRecord> = jobs::table
                        .filter(jobs::id.eq(&id))
                        .first(conn)
                        .await
                        .optional()?;

                    let Some(record) = record else {
                        return Ok(TransitionOutcome::Missing);
                    };

                    let current =
                        JobStatus::from_str(&record.status).unwrap_or(JobStatus::Error);
                    let Some(next) = event.apply(current) else {
                        return Ok(TransitionOutcome::Invalid(record.status));
                    };

                    let now = now_ts();
                    diesel::update(jobs::table.filter(jobs::id.eq(&id)))
                        .set((
                            jobs::status.eq(next.as_str()),
                            jobs::updated_at.eq(&now),
                        ))
                        .execute(conn)
                        .await?;

                    let updated: JobRecord =
                        jobs::table.filter(jobs::id.eq(&id)).first(conn).await?;
                    Ok(TransitionOutcome::Updated(updated))
                })
            })
            .await?
        });

        match outcome {
            TransitionOutcome::Updated(record) => Ok(record.into()),
            TransitionOutcome::Missing => {
                Err(RepositoryError::NotFound(format!("job {}", id)))
            }
            TransitionOutcome::Invalid(from) => Err(RepositoryError::InvalidTransition {
                from,
                event: format!("{:?}", event).to_lowercase(),
            }),
        }
    }

    /// Atomically claim the oldest queued job, keeping at most
    /// `max_concurrent` jobs in `processing`. Returns `None` when nothing is
    /// claimable.
    pub async fn claim_next_queued(&self, max_concurrent: usize) -> RepoResult<Option<Job>> {
        let record = with_conn!(self.pool, conn, {
            conn.transaction::<Option<JobRecord>, diesel::result::Error, _>(|conn| {
                Box::pin(async move {
                    let processing: i64 = jobs::table
                        .filter(jobs::status.eq(JobStatus::Processing.as_str()))
                        .count()
                        .get_result(conn)
                        .await?;
                    if max_concurrent > 0 && processing as usize >= max_concurrent {
                        return Ok(None);
                    }

                    let candidate: Option<JobRecord> = jobs::table
                        .filter(jobs::status.eq(JobStatus::Queued.as_str()))
                        .order(jobs::created_at.asc())
                        .first(conn)
                        .await
                        .optional()?;

                    let Some(candidate) = candidate else {
                        return Ok(None);
                    };

                    let now = now_ts();
                    diesel::update(jobs::table.filter(jobs::id.eq(&candidate.id)))
                        .set((
                            jobs::status.eq(JobStatus::Processing.as_str()),
                            jobs::updated_at.eq(&now),
                        ))
                        .execute(conn)
                        .await?;

                    let updated: JobRecord = jobs::table
                        .filter(jobs::id.eq(&candidate.id))
                        .first(conn)
                        .await?;
                    Ok(Some(updated))
                })
            })
            .await?
        });
        Ok(record.map(Job::from))
    }

    /// Durable status/progress snapshot write. Used by the debounced updater;
    /// does not validate transitions (the state machine already ran).
    pub async fn update_progress(
        &self,
        id: &str,
        status: JobStatus,
        progress: f64,
        status_message: Option<&str>,
        error_message: Option<&str>,
    ) -> RepoResult<()> {
        let progress = progress.clamp(0.0, 1.0);
        with_conn!(self.pool, conn, {
            let changed = diesel::update(jobs::table.filter(jobs::id.eq(id)))
                .set((
                    jobs::status.eq(status.as_str()),
                    jobs::progress.eq(progress),
                    jobs::status_message.eq(status_message),
                    jobs::error_message.eq(error_message),
                    jobs::updated_at.eq(now_ts()),
                ))
                .execute(&mut conn)
                .await?;
            if changed == 0 {
                return Err(RepositoryError::NotFound(format!("job {}", id)));
            }
            Ok(())
        })
    }

    /// Progress write that only lands while the job is still `processing`.
    ///
    /// Debounced snapshots race against pause/cancel from the API; the
    /// status filter keeps a stale snapshot from resurrecting a paused or
    /// deleted job. Returns whether the write landed.
    pub async fn update_progress_if_processing(
        &self,
        id: &str,
        progress: f64,
        status_message: Option<&str>,
    ) -> RepoResult<bool> {
        let progress = progress.clamp(0.0, 1.0);
        with_conn!(self.pool, conn, {
            let changed = diesel::update(
                jobs::table
                    .filter(jobs::id.eq(id))
                    .filter(jobs::status.eq(JobStatus::Processing.as_str())),
            )
            .set((
                jobs::progress.eq(progress),
                jobs::status_message.eq(status_message),
                jobs::updated_at.eq(now_ts()),
            ))
            .execute(&mut conn)
            .await?;
            Ok(changed > 0)
        })
    }

    /// Rename the task. The only mutable descriptive field.
    pub async fn rename(&self, id: &str, task_name: &str) -> RepoResult<Job> {
        with_conn!(self.pool, conn, {
            let changed = diesel::update(jobs::table.filter(jobs::id.eq(id)))
                .set((
                    jobs::task_name.eq(task_name),
                    jobs::updated_at.eq(now_ts()),
                ))
                .execute(&mut conn)
                .await?;
            if changed == 0 {
                return Err(RepositoryError::NotFound(format!("job {}", id)));
            }
            let record: JobRecord = jobs::table.filter(jobs::id.eq(id)).first(&mut conn).await?;
            Ok(record.into())
        })
    }

    /// Update the engine selection (drafts settle theirs at start time).
    pub async fn update_engine(&self, id: &str, engine: EngineKind) -> RepoResult<()> {
        with_conn!(self.pool, conn, {
            diesel::update(jobs::table.filter(jobs::id.eq(id)))
                .set((
                    jobs::engine.eq(engine.as_str()),
                    jobs::updated_at.eq(now_ts()),
                ))
                .execute(&mut conn)
                .await?;
            Ok(())
        })
    }

    /// Delete a job and cascade to its files and settings. Node file
    /// registrations are left untouched. Returns whether a row existed.
    pub async fn delete(&self, id: &str) -> RepoResult<bool> {
        let id = id.to_string();
        let deleted = with_conn!(self.pool, conn, {
            conn.transaction::<usize, diesel::result::Error, _>(|conn| {
                let id = id.clone();
                Box::pin(async move {
                    diesel::delete(job_files::table.filter(job_files::job_id.eq(&id)))
                        .execute(conn)
                        .await?;
                    diesel::delete(job_settings::table.filter(job_settings::job_id.eq(&id)))
                        .execute(conn)
                        .await?;
                    diesel::delete(jobs::table.filter(jobs::id.eq(&id)))
                        .execute(conn)
                        .await
                })
            })
            .await?
        });
        Ok(deleted > 0)
    }

    /// Insert or replace the per-job model selection.
    pub async fn upsert_settings(&self, settings: &JobSettings) -> RepoResult<()> {
        let settings = settings.clone();
        with_conn!(self.pool, conn, {
            conn.transaction::<(), diesel::result::Error, _>(|conn| {
                let settings = settings.clone();
                Box::pin(async move {
                    diesel::delete(
                        job_settings::table.filter(job_settings::job_id.eq(&settings.job_id)),
                    )
                    .execute(conn)
                    .await?;
                    diesel::insert_into(job_settings::table)
                        .values(NewJobSettings::from_settings(&settings))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .await?;
            Ok(())
        })
    }

    pub async fn get_settings(&self, job_id: &str) -> RepoResult<Option<JobSettings>> {
        with_conn!(self.pool, conn, {
            let record: Option<JobSettingsRecord> = job_settings::table
                .filter(job_settings::job_id.eq(job_id))
                .first(&mut conn)
                .await
                .optional()?;
            Ok(record.map(JobSettings::from))
        })
    }
}
