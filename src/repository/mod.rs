//! Metadata store adapter.
//!
//! Narrow, typed operations over the jobs, job_files, job_settings,
//! tree_nodes and node_files tables. The metadata store is the only
//! authoritative shared state in the system; every cross-component
//! coordination point (claims, status, node registrations) goes through
//! these repositories.

pub mod files;
pub mod jobs;
pub mod migrations;
pub mod nodes;
pub mod pool;
pub mod records;

pub use files::JobFileRepository;
pub use jobs::JobRepository;
pub use nodes::{NodeRepository, TreeNode};
pub use pool::{DbPool, SqlitePool};

use thiserror::Error;

/// Errors from metadata store operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid transition: {event} from {from}")]
    InvalidTransition { from: String, event: String },
}

pub type RepoResult<T> = Result<T, RepositoryError>;

/// Bundled repositories sharing one pool, threaded into every component
/// that needs durable state.
#[derive(Clone)]
pub struct Repositories {
    pub jobs: JobRepository,
    pub files: JobFileRepository,
    pub nodes: NodeRepository,
}

impl Repositories {
    pub fn new(pool: DbPool) -> Self {
        Self {
            jobs: JobRepository::new(pool.clone()),
            files: JobFileRepository::new(pool.clone()),
            nodes: NodeRepository::new(pool),
        }
    }

    /// Open a pool from a database URL and bootstrap the schema.
    pub async fn connect(database_url: &str) -> RepoResult<Self> {
        let pool = DbPool::from_url(database_url)?;
        migrations::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }
}
