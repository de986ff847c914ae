//! Diesel ORM records for the metadata tables.
//!
//! Timestamps are stored as RFC 3339 TEXT (microsecond precision, `Z`
//! suffix) so string ordering matches chronological ordering.

use chrono::{DateTime, SecondsFormat, Utc};
use diesel::prelude::*;

use crate::models::{EngineKind, FileType, Job, JobFile, JobSettings, JobStatus};
use crate::schema;

/// Serialize a timestamp in the canonical column format.
pub fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time in the canonical column format.
pub fn now_ts() -> String {
    ts(Utc::now())
}

/// Parse a stored timestamp, tolerating legacy offsets.
pub fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::jobs)]
pub struct JobRecord {
    pub id: String,
    pub client_id: String,
    pub document_id: String,
    pub document_name: String,
    pub task_name: String,
    pub status: String,
    pub progress: f64,
    pub engine: String,
    pub artifact_prefix: String,
    pub error_message: Option<String>,
    pub status_message: Option<String>,
    pub node_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<JobRecord> for Job {
    fn from(r: JobRecord) -> Self {
        Job {
            id: r.id,
            client_id: r.client_id,
            document_id: r.document_id,
            document_name: r.document_name,
            task_name: r.task_name,
            status: JobStatus::from_str(&r.status).unwrap_or(JobStatus::Error),
            progress: r.progress,
            engine: EngineKind::from_str(&r.engine).unwrap_or_default(),
            artifact_prefix: r.artifact_prefix,
            error_message: r.error_message,
            status_message: r.status_message,
            node_id: r.node_id,
            created_at: parse_ts(&r.created_at),
            updated_at: parse_ts(&r.updated_at),
        }
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = schema::jobs)]
pub struct NewJob<'a> {
    pub id: &'a str,
    pub client_id: &'a str,
    pub document_id: &'a str,
    pub document_name: &'a str,
    pub task_name: &'a str,
    pub status: &'a str,
    pub progress: f64,
    pub engine: &'a str,
    pub artifact_prefix: &'a str,
    pub error_message: Option<&'a str>,
    pub status_message: Option<&'a str>,
    pub node_id: Option<&'a str>,
    pub created_at: String,
    pub updated_at: String,
}

impl<'a> NewJob<'a> {
    pub fn from_job(job: &'a Job) -> Self {
        Self {
            id: &job.id,
            client_id: &job.client_id,
            document_id: &job.document_id,
            document_name: &job.document_name,
            task_name: &job.task_name,
            status: job.status.as_str(),
            progress: job.progress,
            engine: job.engine.as_str(),
            artifact_prefix: &job.artifact_prefix,
            error_message: job.error_message.as_deref(),
            status_message: job.status_message.as_deref(),
            node_id: job.node_id.as_deref(),
            created_at: ts(job.created_at),
            updated_at: ts(job.updated_at),
        }
    }
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::job_files)]
pub struct JobFileRecord {
    pub id: String,
    pub job_id: String,
    pub file_type: String,
    pub object_key: String,
    pub file_name: String,
    pub file_size: i64,
    pub metadata: String,
    pub created_at: String,
}

impl From<JobFileRecord> for JobFile {
    fn from(r: JobFileRecord) -> Self {
        JobFile {
            id: r.id,
            job_id: r.job_id,
            file_type: FileType::from_str(&r.file_type).unwrap_or(FileType::Crop),
            object_key: r.object_key,
            file_name: r.file_name,
            file_size: r.file_size,
            metadata: serde_json::from_str(&r.metadata).unwrap_or(serde_json::Value::Null),
            created_at: parse_ts(&r.created_at),
        }
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = schema::job_files)]
pub struct NewJobFile<'a> {
    pub id: &'a str,
    pub job_id: &'a str,
    pub file_type: &'a str,
    pub object_key: &'a str,
    pub file_name: &'a str,
    pub file_size: i64,
    pub metadata: String,
    pub created_at: String,
}

impl<'a> NewJobFile<'a> {
    pub fn from_file(file: &'a JobFile) -> Self {
        Self {
            id: &file.id,
            job_id: &file.job_id,
            file_type: file.file_type.as_str(),
            object_key: &file.object_key,
            file_name: &file.file_name,
            file_size: file.file_size,
            metadata: file.metadata.to_string(),
            created_at: ts(file.created_at),
        }
    }
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::job_settings)]
#[diesel(primary_key(job_id))]
pub struct JobSettingsRecord {
    pub job_id: String,
    pub text_model: String,
    pub table_model: String,
    pub image_model: String,
    pub stamp_model: String,
    pub is_correction_mode: i32,
}

impl From<JobSettingsRecord> for JobSettings {
    fn from(r: JobSettingsRecord) -> Self {
        JobSettings {
            job_id: r.job_id,
            text_model: r.text_model,
            table_model: r.table_model,
            image_model: r.image_model,
            stamp_model: r.stamp_model,
            is_correction_mode: r.is_correction_mode != 0,
        }
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = schema::job_settings)]
pub struct NewJobSettings<'a> {
    pub job_id: &'a str,
    pub text_model: &'a str,
    pub table_model: &'a str,
    pub image_model: &'a str,
    pub stamp_model: &'a str,
    pub is_correction_mode: i32,
}

impl<'a> NewJobSettings<'a> {
    pub fn from_settings(s: &'a JobSettings) -> Self {
        Self {
            job_id: &s.job_id,
            text_model: &s.text_model,
            table_model: &s.table_model,
            image_model: &s.image_model,
            stamp_model: &s.stamp_model,
            is_correction_mode: s.is_correction_mode as i32,
        }
    }
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::tree_nodes)]
pub struct TreeNodeRecord {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub node_type: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = schema::tree_nodes)]
pub struct NewTreeNode<'a> {
    pub id: &'a str,
    pub parent_id: Option<&'a str>,
    pub name: &'a str,
    pub node_type: &'a str,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::node_files)]
pub struct NodeFileRecord {
    pub id: String,
    pub node_id: String,
    pub object_key: String,
    pub file_name: String,
    pub file_type: String,
    pub created_at: String,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = schema::node_files)]
pub struct NewNodeFile<'a> {
    pub id: &'a str,
    pub node_id: &'a str,
    pub object_key: &'a str,
    pub file_name: &'a str,
    pub file_type: &'a str,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ts_is_lexicographically_ordered() {
        let a = ts("2026-01-01T00:00:00.000001Z".parse().unwrap());
        let b = ts("2026-01-01T00:00:00.000002Z".parse().unwrap());
        let c = ts("2026-01-02T00:00:00Z".parse().unwrap());
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_parse_ts_round_trip() {
        let now = Utc::now();
        let parsed = parse_ts(&ts(now));
        assert_eq!(
            parsed.timestamp_micros(),
            now.timestamp_micros()
        );
    }

    #[test]
    fn test_job_record_round_trip() {
        let job = Job::new(
            "client-1",
            "hash",
            "doc.pdf",
            "Task",
            EngineKind::Segment,
            JobStatus::Queued,
            Some("node-9".to_string()),
        );
        let record = JobRecord {
            id: job.id.clone(),
            client_id: job.client_id.clone(),
            document_id: job.document_id.clone(),
            document_name: job.document_name.clone(),
            task_name: job.task_name.clone(),
            status: job.status.as_str().to_string(),
            progress: job.progress,
            engine: job.engine.as_str().to_string(),
            artifact_prefix: job.artifact_prefix.clone(),
            error_message: None,
            status_message: None,
            node_id: job.node_id.clone(),
            created_at: ts(job.created_at),
            updated_at: ts(job.updated_at),
        };
        let back: Job = record.into();
        assert_eq!(back.id, job.id);
        assert_eq!(back.status, JobStatus::Queued);
        assert_eq!(back.engine, EngineKind::Segment);
        assert_eq!(back.node_id.as_deref(), Some("node-9"));
    }
}
