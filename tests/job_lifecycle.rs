//! End-to-end lifecycle tests against a temporary SQLite database and a
//! filesystem object store: creation, claiming, transitions, artifact
//! publication, cascade deletion.

use std::collections::HashMap;
use std::sync::Arc;

use remocr::config::Settings;
use remocr::models::{EngineKind, FileType, Job, JobEvent, JobSettings, JobStatus};
use remocr::ocr::Dispatcher;
use remocr::pipeline::{artifacts, PipelineDeps};
use remocr::progress::ProgressReporter;
use remocr::rate_limit::{RatePolicy, RateLimiters};
use remocr::repository::{Repositories, RepositoryError};
use remocr::storage::{FsObjectStore, ObjectStore};

struct Harness {
    repos: Repositories,
    store: Arc<dyn ObjectStore>,
    deps: Arc<PipelineDeps>,
    _dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::load(None).unwrap();
    settings.data_dir = dir.path().to_path_buf();
    settings.database_url = Some(format!("sqlite:{}", dir.path().join("test.db").display()));
    settings.storage_url = format!("file://{}", dir.path().join("objects").display());
    let settings = Arc::new(settings);

    let repos = Repositories::connect(&settings.database_url())
        .await
        .unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(
        FsObjectStore::new(
            dir.path().join("objects").as_path(),
            settings.public_base_url.clone(),
            settings.signing_secret.as_bytes().to_vec(),
        )
        .unwrap(),
    );
    let limiters = Arc::new(RateLimiters::new(
        RatePolicy::unlimited(),
        HashMap::new(),
        8,
    ));
    let deps = Arc::new(PipelineDeps {
        repos: repos.clone(),
        store: store.clone(),
        dispatcher: Arc::new(Dispatcher::new(&settings, limiters)),
        reporter: Arc::new(ProgressReporter::new(
            repos.jobs.clone(),
            settings.debounce_interval,
        )),
        settings: settings.clone(),
    });

    Harness {
        repos,
        store,
        deps,
        _dir: dir,
    }
}

fn new_job(status: JobStatus) -> Job {
    Job::new(
        "client-1",
        "hash-abc",
        "report.pdf",
        "OCR report",
        EngineKind::Vision,
        status,
        None,
    )
}

#[tokio::test]
async fn test_insert_claim_and_complete() {
    let h = harness().await;
    let job = new_job(JobStatus::Queued);
    h.repos.jobs.insert(&job).await.unwrap();

    let claimed = h
        .repos
        .jobs
        .claim_next_queued(4)
        .await
        .unwrap()
        .expect("claimable job");
    assert_eq!(claimed.id, job.id);
    assert_eq!(claimed.status, JobStatus::Processing);

    let done = h
        .repos
        .jobs
        .apply_event(&job.id, JobEvent::Complete)
        .await
        .unwrap();
    assert_eq!(done.status, JobStatus::Done);
}

#[tokio::test]
async fn test_claim_respects_concurrency_cap() {
    let h = harness().await;
    for _ in 0..3 {
        h.repos.jobs.insert(&new_job(JobStatus::Queued)).await.unwrap();
    }
    assert!(h.repos.jobs.claim_next_queued(2).await.unwrap().is_some());
    assert!(h.repos.jobs.claim_next_queued(2).await.unwrap().is_some());
    // Two processing, cap two: no further claims.
    assert!(h.repos.jobs.claim_next_queued(2).await.unwrap().is_none());
}

#[tokio::test]
async fn test_invalid_transition_does_not_mutate() {
    let h = harness().await;
    let job = new_job(JobStatus::Queued);
    h.repos.jobs.insert(&job).await.unwrap();

    let err = h
        .repos
        .jobs
        .apply_event(&job.id, JobEvent::Complete)
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::InvalidTransition { .. }));

    let unchanged = h.repos.jobs.require(&job.id).await.unwrap();
    assert_eq!(unchanged.status, JobStatus::Queued);
}

#[tokio::test]
async fn test_pause_resume_cycle() {
    let h = harness().await;
    let job = new_job(JobStatus::Queued);
    h.repos.jobs.insert(&job).await.unwrap();

    let paused = h
        .repos
        .jobs
        .apply_event(&job.id, JobEvent::Pause)
        .await
        .unwrap();
    assert_eq!(paused.status, JobStatus::Paused);

    let requeued = h
        .repos
        .jobs
        .apply_event(&job.id, JobEvent::Resume)
        .await
        .unwrap();
    assert_eq!(requeued.status, JobStatus::Queued);
}

#[tokio::test]
async fn test_settings_round_trip() {
    let h = harness().await;
    let job = new_job(JobStatus::Queued);
    h.repos.jobs.insert(&job).await.unwrap();

    let mut settings = JobSettings::new(&job.id);
    settings.text_model = "acme/reader-2".to_string();
    settings.table_model = "acme/tables-1".to_string();
    settings.is_correction_mode = true;
    h.repos.jobs.upsert_settings(&settings).await.unwrap();

    let loaded = h.repos.jobs.get_settings(&job.id).await.unwrap().unwrap();
    assert_eq!(loaded, settings);

    // Upsert replaces in place.
    settings.text_model = "acme/reader-3".to_string();
    h.repos.jobs.upsert_settings(&settings).await.unwrap();
    let loaded = h.repos.jobs.get_settings(&job.id).await.unwrap().unwrap();
    assert_eq!(loaded.text_model, "acme/reader-3");
}

#[tokio::test]
async fn test_changes_feed_sees_updates() {
    let h = harness().await;
    let job = new_job(JobStatus::Queued);
    h.repos.jobs.insert(&job).await.unwrap();

    let after_insert = chrono::Utc::now();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    h.repos
        .jobs
        .update_progress(&job.id, JobStatus::Queued, 0.0, Some("waiting"), None)
        .await
        .unwrap();

    let changed = h.repos.jobs.list_changed_since(after_insert).await.unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].id, job.id);

    let later = chrono::Utc::now();
    let changed = h.repos.jobs.list_changed_since(later).await.unwrap();
    assert!(changed.is_empty());
}

#[tokio::test]
async fn test_empty_job_publishes_all_artifacts() {
    let h = harness().await;
    let mut job = new_job(JobStatus::Processing);
    job.node_id = None;
    h.repos.jobs.insert(&job).await.unwrap();

    // An empty block list still produces the full artifact set.
    let workspace = tempfile::tempdir().unwrap();
    let pdf_path = workspace.path().join("document.pdf");
    std::fs::write(&pdf_path, b"%PDF-1.4 fake").unwrap();
    artifacts::build_artifacts(
        &h.deps,
        &job,
        &[],
        &HashMap::new(),
        &pdf_path,
        workspace.path(),
    )
    .await
    .unwrap();

    for (file_type, name) in [
        (FileType::ResultMd, "result.md"),
        (FileType::Annotation, "annotation.json"),
        (FileType::ResultZip, "result.zip"),
    ] {
        let row = h
            .repos
            .files
            .get_by_type(&job.id, file_type)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("missing {} row", name));
        assert!(h.store.exists(&row.object_key).await.unwrap(), "{}", name);
    }
}

#[tokio::test]
async fn test_delete_cascades_to_files_not_node_files() {
    let h = harness().await;

    let node = h.repos.nodes.create(None, "Project A", "folder").await.unwrap();
    let mut job = new_job(JobStatus::Processing);
    job.node_id = Some(node.id.clone());
    h.repos.jobs.insert(&job).await.unwrap();

    let workspace = tempfile::tempdir().unwrap();
    let pdf_path = workspace.path().join("document.pdf");
    std::fs::write(&pdf_path, b"%PDF-1.4 fake").unwrap();
    artifacts::build_artifacts(
        &h.deps,
        &job,
        &[],
        &HashMap::new(),
        &pdf_path,
        workspace.path(),
    )
    .await
    .unwrap();

    assert!(!h.repos.files.list_for_job(&job.id).await.unwrap().is_empty());
    let registered = h.repos.nodes.list_node_files(&node.id).await.unwrap();
    assert_eq!(registered.len(), 3);

    // Deleting the job removes its JobFile rows but never the node
    // registrations.
    assert!(h.repos.jobs.delete(&job.id).await.unwrap());
    assert!(h.repos.jobs.get(&job.id).await.unwrap().is_none());
    assert!(h.repos.files.list_for_job(&job.id).await.unwrap().is_empty());
    assert_eq!(
        h.repos.nodes.list_node_files(&node.id).await.unwrap().len(),
        3
    );
}

#[tokio::test]
async fn test_node_file_registration_is_idempotent() {
    let h = harness().await;
    let node = h.repos.nodes.create(None, "Project B", "folder").await.unwrap();

    let first = h
        .repos
        .nodes
        .register_node_file(&node.id, "ocr_jobs/x/result.md", "result.md", "result_md")
        .await
        .unwrap();
    let second = h
        .repos
        .nodes
        .register_node_file(&node.id, "ocr_jobs/x/result.md", "result (renamed).md", "result_md")
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    let files = h.repos.nodes.list_node_files(&node.id).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].file_name, "result (renamed).md");
}
