//! Job file rows: typed artifact references owned by a job.

use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};

use crate::models::{FileType, JobFile};
use crate::schema::job_files;
use crate::with_conn;

use super::pool::DbPool;
use super::records::{JobFileRecord, NewJobFile};
use super::RepoResult;

#[derive(Clone)]
pub struct JobFileRepository {
    pool: DbPool,
}

impl JobFileRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Append an artifact reference. Single-valued file types replace any
    /// previous row of the same type for the job.
    pub async fn append(&self, file: &JobFile) -> RepoResult<()> {
        let file = file.clone();
        with_conn!(self.pool, conn, {
            conn.transaction::<(), diesel::result::Error, _>(|conn| {
                let file = file.clone();
                Box::pin(async move {
                    if file.file_type.is_single_valued() {
                        diesel::delete(
                            job_files::table
                                .filter(job_files::job_id.eq(&file.job_id))
                                .filter(job_files::file_type.eq(file.file_type.as_str())),
                        )
                        .execute(conn)
                        .await?;
                    }
                    diesel::insert_into(job_files::table)
                        .values(NewJobFile::from_file(&file))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .await?;
            Ok(())
        })
    }

    pub async fn list_for_job(&self, job_id: &str) -> RepoResult<Vec<JobFile>> {
        with_conn!(self.pool, conn, {
            let records: Vec<JobFileRecord> = job_files::table
                .filter(job_files::job_id.eq(job_id))
                .order(job_files::created_at.asc())
                .load(&mut conn)
                .await?;
            Ok(records.into_iter().map(JobFile::from).collect())
        })
    }

    /// The single row of a given type, if present.
    pub async fn get_by_type(
        &self,
        job_id: &str,
        file_type: FileType,
    ) -> RepoResult<Option<JobFile>> {
        with_conn!(self.pool, conn, {
            let record: Option<JobFileRecord> = job_files::table
                .filter(job_files::job_id.eq(job_id))
                .filter(job_files::file_type.eq(file_type.as_str()))
                .first(&mut conn)
                .await
                .optional()?;
            Ok(record.map(JobFile::from))
        })
    }
}
