//! Job endpoints: creation, queries, lifecycle transitions, results.

use std::collections::{HashMap, HashSet};

use axum::extract::{Multipart, Path, Query, State};
use axum::response::IntoResponse;
use axum::{Form, Json};
use serde::Deserialize;

use crate::models::{
    parse_blocks, AnnotationDocument, Block, BlockType, EngineKind, FileType, Job, JobEvent,
    JobFile, JobSettings, JobStatus,
};
use crate::utils::file_icon;

use super::super::error::ApiError;
use super::super::AppState;

/// Collected multipart form: scalar fields plus file payloads.
struct JobForm {
    fields: HashMap<String, String>,
    pdf: Option<Vec<u8>>,
    blocks_file: Option<Vec<u8>>,
    annotation_json: Option<Vec<u8>>,
}

impl JobForm {
    async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut form = JobForm {
            fields: HashMap::new(),
            pdf: None,
            blocks_file: None,
            annotation_json: None,
        };
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::InvalidInput(format!("bad multipart payload: {}", e)))?
        {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "pdf" => {
                    form.pdf = Some(
                        field
                            .bytes()
                            .await
                            .map_err(|e| ApiError::InvalidInput(e.to_string()))?
                            .to_vec(),
                    )
                }
                "blocks_file" => {
                    form.blocks_file = Some(
                        field
                            .bytes()
                            .await
                            .map_err(|e| ApiError::InvalidInput(e.to_string()))?
                            .to_vec(),
                    )
                }
                "annotation_json" => {
                    form.annotation_json = Some(
                        field
                            .bytes()
                            .await
                            .map_err(|e| ApiError::InvalidInput(e.to_string()))?
                            .to_vec(),
                    )
                }
                _ => {
                    let value = field
                        .text()
                        .await
                        .map_err(|e| ApiError::InvalidInput(e.to_string()))?;
                    form.fields.insert(name, value);
                }
            }
        }
        Ok(form)
    }

    fn require(&self, name: &str) -> Result<&str, ApiError> {
        self.fields
            .get(name)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ApiError::InvalidInput(format!("missing field: {}", name)))
    }

    fn engine(&self) -> Result<EngineKind, ApiError> {
        let raw = self.require("engine")?;
        EngineKind::from_str(raw)
            .ok_or_else(|| ApiError::InvalidInput(format!("unknown engine: {}", raw)))
    }

    fn settings_for(&self, job_id: &str) -> JobSettings {
        let get = |name: &str| self.fields.get(name).cloned().unwrap_or_default();
        JobSettings {
            job_id: job_id.to_string(),
            text_model: get("text_model"),
            table_model: get("table_model"),
            image_model: get("image_model"),
            stamp_model: get("stamp_model"),
            is_correction_mode: self
                .fields
                .get("is_correction_mode")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }
}

fn validate_pdf(bytes: &[u8]) -> Result<(), ApiError> {
    let sniffed = infer::get(bytes).map(|t| t.mime_type());
    if sniffed != Some("application/pdf") {
        return Err(ApiError::InvalidInput(
            "pdf payload is not a PDF document".to_string(),
        ));
    }
    Ok(())
}

/// Admission control: reject creates once queued + processing reaches the
/// configured cap. A soft guard; claim-time limits self-correct any races.
async fn check_admission(state: &AppState) -> Result<(), ApiError> {
    let max = state.settings.max_queue_size;
    if max == 0 {
        return Ok(());
    }
    let active = state.repos.jobs.count_active().await?;
    if active as usize >= max {
        return Err(ApiError::QueueFull { max });
    }
    Ok(())
}

async fn persist_inputs(
    state: &AppState,
    job: &Job,
    pdf: Vec<u8>,
    blocks_json: Vec<u8>,
) -> Result<(), ApiError> {
    let pdf_size = pdf.len() as i64;
    let blocks_size = blocks_json.len() as i64;
    state
        .store
        .upload(&job.object_key("document.pdf"), pdf, "application/pdf")
        .await?;
    state
        .store
        .upload(
            &job.object_key("blocks.json"),
            blocks_json,
            "application/json",
        )
        .await?;
    state.repos.jobs.insert(job).await?;
    state
        .repos
        .files
        .append(&JobFile::new(
            &job.id,
            FileType::Pdf,
            job.object_key("document.pdf"),
            "document.pdf",
            pdf_size,
            serde_json::Value::Null,
        ))
        .await?;
    state
        .repos
        .files
        .append(&JobFile::new(
            &job.id,
            FileType::Blocks,
            job.object_key("blocks.json"),
            "blocks.json",
            blocks_size,
            serde_json::Value::Null,
        ))
        .await?;
    Ok(())
}

/// POST /jobs: create and enqueue an OCR job.
pub async fn create_job(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Job>, ApiError> {
    let mut form = JobForm::read(multipart).await?;

    let pdf = form
        .pdf
        .take()
        .ok_or_else(|| ApiError::InvalidInput("missing field: pdf".to_string()))?;
    validate_pdf(&pdf)?;
    let blocks_json = form
        .blocks_file
        .take()
        .ok_or_else(|| ApiError::InvalidInput("missing field: blocks_file".to_string()))?;
    let blocks = parse_blocks(&blocks_json)
        .map_err(|e| ApiError::InvalidInput(format!("blocks_file: {}", e)))?;
    let engine = form.engine()?;

    check_admission(&state).await?;

    let job = Job::new(
        form.require("client_id")?,
        form.require("document_id")?,
        form.require("document_name")?,
        form.require("task_name")?,
        engine,
        JobStatus::Queued,
        form.fields.get("node_id").filter(|s| !s.is_empty()).cloned(),
    );
    tracing::info!(job_id = %job.id, blocks = blocks.len(), "creating job");

    persist_inputs(&state, &job, pdf, blocks_json).await?;
    state
        .repos
        .jobs
        .upsert_settings(&form.settings_for(&job.id))
        .await?;
    state.broker.publish(&job.id).await?;

    Ok(Json(job))
}

/// POST /jobs/draft: persist a job without enqueueing it.
pub async fn create_draft(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Job>, ApiError> {
    let mut form = JobForm::read(multipart).await?;

    let pdf = form
        .pdf
        .take()
        .ok_or_else(|| ApiError::InvalidInput("missing field: pdf".to_string()))?;
    validate_pdf(&pdf)?;

    // Drafts may arrive with an annotation.json instead of a blocks.json.
    let annotation = form.annotation_json.take();
    let blocks_json: Vec<u8> = match (form.blocks_file.take(), &annotation) {
        (Some(blocks), _) => {
            parse_blocks(&blocks)
                .map_err(|e| ApiError::InvalidInput(format!("blocks_file: {}", e)))?;
            blocks
        }
        (None, Some(annotation)) => {
            let doc = AnnotationDocument::parse(annotation)
                .map_err(|e| ApiError::InvalidInput(format!("annotation_json: {}", e)))?;
            serde_json::to_vec(&doc.to_blocks())
                .map_err(|e| ApiError::Internal(e.to_string()))?
        }
        (None, None) => {
            return Err(ApiError::InvalidInput(
                "either blocks_file or annotation_json is required".to_string(),
            ))
        }
    };

    // Drafts may omit the engine; it is settled at start time.
    let engine = match form.fields.get("engine") {
        Some(raw) => EngineKind::from_str(raw)
            .ok_or_else(|| ApiError::InvalidInput(format!("unknown engine: {}", raw)))?,
        None => EngineKind::Vision,
    };

    let job = Job::new(
        form.require("client_id")?,
        form.require("document_id")?,
        form.require("document_name")?,
        form.require("task_name")?,
        engine,
        JobStatus::Draft,
        form.fields.get("node_id").filter(|s| !s.is_empty()).cloned(),
    );
    tracing::info!(job_id = %job.id, "creating draft");

    persist_inputs(&state, &job, pdf, blocks_json).await?;
    if let Some(annotation) = annotation {
        let size = annotation.len() as i64;
        state
            .store
            .upload(
                &job.object_key("annotation.json"),
                annotation,
                "application/json",
            )
            .await?;
        state
            .repos
            .files
            .append(&JobFile::new(
                &job.id,
                FileType::Annotation,
                job.object_key("annotation.json"),
                "annotation.json",
                size,
                serde_json::Value::Null,
            ))
            .await?;
    }
    state
        .repos
        .jobs
        .upsert_settings(&form.settings_for(&job.id))
        .await?;

    Ok(Json(job))
}

#[derive(Debug, Deserialize)]
pub struct StartForm {
    pub engine: Option<String>,
    pub text_model: Option<String>,
    pub table_model: Option<String>,
    pub image_model: Option<String>,
    pub stamp_model: Option<String>,
    pub is_correction_mode: Option<bool>,
}

/// POST /jobs/{id}/start: draft -> queued.
pub async fn start_draft(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Form(form): Form<StartForm>,
) -> Result<Json<Job>, ApiError> {
    let mut job = state.repos.jobs.apply_event(&id, JobEvent::Start).await?;

    let mut settings = state
        .repos
        .jobs
        .get_settings(&id)
        .await?
        .unwrap_or_else(|| JobSettings::new(&id));
    if let Some(model) = form.text_model {
        settings.text_model = model;
    }
    if let Some(model) = form.table_model {
        settings.table_model = model;
    }
    if let Some(model) = form.image_model {
        settings.image_model = model;
    }
    if let Some(model) = form.stamp_model {
        settings.stamp_model = model;
    }
    if let Some(correction) = form.is_correction_mode {
        settings.is_correction_mode = correction;
    }
    state.repos.jobs.upsert_settings(&settings).await?;

    if let Some(engine) = form.engine.as_deref().and_then(EngineKind::from_str) {
        if engine != job.engine {
            state.repos.jobs.update_engine(&id, engine).await?;
            job.engine = engine;
        }
    }

    state.broker.publish(&id).await?;
    Ok(Json(job))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub client_id: Option<String>,
    pub document_id: Option<String>,
}

/// GET /jobs: newest first, optional owner/document filters.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let jobs = state
        .repos
        .jobs
        .list(params.client_id.as_deref(), params.document_id.as_deref())
        .await?;
    Ok(Json(jobs))
}

#[derive(Debug, Deserialize)]
pub struct ChangesParams {
    pub since: String,
}

/// GET /jobs/changes?since=: incremental polling feed.
pub async fn jobs_changes(
    State(state): State<AppState>,
    Query(params): Query<ChangesParams>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let since = chrono::DateTime::parse_from_rfc3339(&params.since)
        .map_err(|e| ApiError::InvalidInput(format!("since: {}", e)))?
        .with_timezone(&chrono::Utc);
    let jobs = state.repos.jobs.list_changed_since(since).await?;
    Ok(Json(jobs))
}

/// GET /jobs/{id}.
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.repos.jobs.require(&id).await?))
}

/// GET /jobs/{id}/details: job, settings, block statistics, artifacts.
pub async fn get_job_details(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.repos.jobs.require(&id).await?;
    let settings = state.repos.jobs.get_settings(&id).await?;
    let files = state.repos.files.list_for_job(&id).await?;

    let blocks: Vec<Block> = match state.store.download(&job.object_key("blocks.json")).await {
        Ok(bytes) => parse_blocks(&bytes).unwrap_or_default(),
        Err(_) => Vec::new(),
    };
    let mut by_type: HashMap<&str, usize> = HashMap::new();
    for block_type in [BlockType::Text, BlockType::Table, BlockType::Image] {
        by_type.insert(block_type.as_str(), 0);
    }
    let mut groups: HashSet<&str> = HashSet::new();
    for block in &blocks {
        *by_type.entry(block.block_type.as_str()).or_insert(0) += 1;
        if let Some(group) = block.group_id.as_deref() {
            groups.insert(group);
        }
    }

    let artifacts: Vec<_> = files
        .iter()
        .map(|f| {
            serde_json::json!({
                "file_type": f.file_type.as_str(),
                "file_name": f.file_name,
                "file_size": f.file_size,
                "object_key": f.object_key,
                "icon": file_icon(f.file_type),
                "metadata": f.metadata,
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "job": job,
        "settings": settings,
        "blocks": {
            "total": blocks.len(),
            "by_type": by_type,
            "groups": groups.len(),
        },
        "artifact_base_url": format!(
            "{}/api/storage/download/{}",
            state.settings.public_base_url, job.artifact_prefix
        ),
        "artifacts": artifacts,
    })))
}

/// GET /jobs/{id}/result: presigned result.zip URL.
pub async fn get_result_url(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.repos.jobs.require(&id).await?;
    if job.status != JobStatus::Done {
        return Err(ApiError::NotReady(format!(
            "job is {}, result is only available when done",
            job.status
        )));
    }
    let file = state
        .repos
        .files
        .get_by_type(&id, FileType::ResultZip)
        .await?
        .ok_or_else(|| ApiError::NotFound("result.zip".to_string()))?;
    let url = state
        .store
        .presign_get(&file.object_key, state.settings.presign_expiry)
        .await?;
    Ok(Json(serde_json::json!({
        "download_url": url,
        "file_name": file.file_name,
    })))
}

#[derive(Debug, Deserialize)]
pub struct PatchForm {
    pub task_name: String,
}

/// PATCH /jobs/{id}: rename only.
pub async fn patch_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Form(form): Form<PatchForm>,
) -> Result<Json<Job>, ApiError> {
    if form.task_name.trim().is_empty() {
        return Err(ApiError::InvalidInput("task_name must not be empty".to_string()));
    }
    Ok(Json(state.repos.jobs.rename(&id, form.task_name.trim()).await?))
}

/// POST /jobs/{id}/pause.
pub async fn pause_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.repos.jobs.apply_event(&id, JobEvent::Pause).await?))
}

/// POST /jobs/{id}/resume: paused -> queued, re-announced to workers.
pub async fn resume_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job = state.repos.jobs.apply_event(&id, JobEvent::Resume).await?;
    state.broker.publish(&id).await?;
    Ok(Json(job))
}

/// POST /jobs/{id}/restart: error (or crashed processing) -> queued.
pub async fn restart_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job = state.repos.jobs.apply_event(&id, JobEvent::Restart).await?;
    state.broker.publish(&id).await?;
    Ok(Json(job))
}

/// DELETE /jobs/{id}: remove the job, its rows, and its stored objects.
/// Node file registrations survive by design.
pub async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.repos.jobs.require(&id).await?;

    let keys = state.store.list_by_prefix(&job.artifact_prefix).await?;
    if !keys.is_empty() {
        state.store.delete_batch(&keys).await?;
    }
    let deleted = state.repos.jobs.delete(&id).await?;
    if !deleted {
        return Err(ApiError::NotFound(format!("job {}", id)));
    }
    tracing::info!(job_id = %id, objects = keys.len(), "job deleted");
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// GET /queue: queue depth and configured cap.
pub async fn queue_depth(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let (queued, processing) = state.repos.jobs.queue_depth().await?;
    Ok(Json(serde_json::json!({
        "queued": queued,
        "processing": processing,
        "max": state.settings.max_queue_size,
    })))
}
