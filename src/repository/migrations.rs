//! Schema bootstrap.
//!
//! The schema is small and fixed, so startup runs an idempotent
//! `CREATE TABLE IF NOT EXISTS` pass instead of a migration history.

use diesel_async::RunQueryDsl;

use super::pool::{DbPool, DbError};
use crate::with_conn;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        client_id TEXT NOT NULL,
        document_id TEXT NOT NULL,
        document_name TEXT NOT NULL,
        task_name TEXT NOT NULL,
        status TEXT NOT NULL,
        progress DOUBLE PRECISION NOT NULL DEFAULT 0,
        engine TEXT NOT NULL,
        artifact_prefix TEXT NOT NULL,
        error_message TEXT,
        status_message TEXT,
        node_id TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_updated ON jobs (updated_at)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_client ON jobs (client_id, document_id)",
    "CREATE TABLE IF NOT EXISTS job_files (
        id TEXT PRIMARY KEY,
        job_id TEXT NOT NULL,
        file_type TEXT NOT NULL,
        object_key TEXT NOT NULL,
        file_name TEXT NOT NULL,
        file_size BIGINT NOT NULL DEFAULT 0,
        metadata TEXT NOT NULL DEFAULT 'null',
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_job_files_job ON job_files (job_id, file_type)",
    "CREATE TABLE IF NOT EXISTS job_settings (
        job_id TEXT PRIMARY KEY,
        text_model TEXT NOT NULL DEFAULT '',
        table_model TEXT NOT NULL DEFAULT '',
        image_model TEXT NOT NULL DEFAULT '',
        stamp_model TEXT NOT NULL DEFAULT '',
        is_correction_mode INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS tree_nodes (
        id TEXT PRIMARY KEY,
        parent_id TEXT,
        name TEXT NOT NULL,
        node_type TEXT NOT NULL DEFAULT 'folder',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_tree_nodes_parent ON tree_nodes (parent_id)",
    // Deliberately no foreign key to jobs: registrations outlive job deletion.
    "CREATE TABLE IF NOT EXISTS node_files (
        id TEXT PRIMARY KEY,
        node_id TEXT NOT NULL,
        object_key TEXT NOT NULL,
        file_name TEXT NOT NULL,
        file_type TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        UNIQUE (node_id, object_key)
    )",
    "CREATE INDEX IF NOT EXISTS idx_node_files_node ON node_files (node_id)",
];

/// Create any missing tables and indexes.
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    with_conn!(pool, conn, {
        for statement in SCHEMA {
            diesel::sql_query(*statement).execute(&mut conn).await?;
        }
        Ok(())
    })
}
