//! Job models: lifecycle state machine, per-job model settings, artifact references.
//!
//! A `Job` is one OCR work order over a single PDF. Jobs move through a small
//! persisted state machine; cancellation is row removal rather than a state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Root prefix under which all per-job object-store keys live.
pub const ARTIFACT_PREFIX_ROOT: &str = "ocr_jobs";

/// Processing status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Draft,
    Queued,
    Processing,
    Done,
    Error,
    Paused,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Error => "error",
            Self::Paused => "paused",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "done" => Some(Self::Done),
            "error" => Some(Self::Error),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }

    /// Whether this status ends an execution (progress writes must not be
    /// debounced past it).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Paused)
    }

    /// Whether a job in this status counts against the admission queue.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Processing)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Events that drive the job state machine.
///
/// Cancellation is intentionally absent: deleting a job removes the row, so
/// it is modeled as a repository operation, allowed from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    /// `draft` -> `queued` (start_draft).
    Start,
    /// `queued` -> `processing` (worker claim).
    Claim,
    /// `queued`/`processing` -> `paused`.
    Pause,
    /// `paused` -> `queued`.
    Resume,
    /// `error`/`processing` -> `queued`. Processing is accepted so a user can
    /// recover a job whose worker crashed mid-flight.
    Restart,
    /// `processing` -> `done`.
    Complete,
    /// `processing` -> `error`.
    Fail,
}

impl JobEvent {
    /// Apply the event to a status, returning the next status or `None` when
    /// the transition is invalid.
    pub fn apply(&self, from: JobStatus) -> Option<JobStatus> {
        use JobStatus::*;
        match (self, from) {
            (Self::Start, Draft) => Some(Queued),
            (Self::Claim, Queued) => Some(Processing),
            (Self::Pause, Queued) | (Self::Pause, Processing) => Some(Paused),
            (Self::Resume, Paused) => Some(Queued),
            (Self::Restart, Error) | (Self::Restart, Processing) => Some(Queued),
            (Self::Complete, Processing) => Some(Done),
            (Self::Fail, Processing) => Some(Error),
            _ => None,
        }
    }

    /// Source statuses from which this event is legal.
    pub fn allowed_from(&self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            Self::Start => &[Draft],
            Self::Claim => &[Queued],
            Self::Pause => &[Queued, Processing],
            Self::Resume => &[Paused],
            Self::Restart => &[Error, Processing],
            Self::Complete => &[Processing],
            Self::Fail => &[Processing],
        }
    }
}

/// Which vision backend executes a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// API-keyed vision provider: one chat-style request per crop/strip.
    #[default]
    Vision,
    /// Segmentation+OCR provider: submit a PDF, poll, fetch markdown.
    Segment,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vision => "vision",
            Self::Segment => "segment",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "vision" => Some(Self::Vision),
            "segment" => Some(Self::Segment),
            _ => None,
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One OCR work order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Opaque id (UUID v4).
    pub id: String,
    /// Owning client, opaque to the core.
    pub client_id: String,
    /// Content-hash fingerprint of the source PDF.
    pub document_id: String,
    /// Display name of the source document.
    pub document_name: String,
    /// User-facing task name, renameable.
    pub task_name: String,
    pub status: JobStatus,
    /// Completion fraction in [0, 1]; 1.0 iff status == done.
    pub progress: f64,
    pub engine: EngineKind,
    /// Object-store path root for this job's artifacts.
    pub artifact_prefix: String,
    pub error_message: Option<String>,
    /// Human-readable current phase ("rendering page 3/10", ...).
    pub status_message: Option<String>,
    /// Project tree node the artifacts are registered on, if any.
    pub node_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new job with a fresh id and artifact prefix.
    pub fn new(
        client_id: impl Into<String>,
        document_id: impl Into<String>,
        document_name: impl Into<String>,
        task_name: impl Into<String>,
        engine: EngineKind,
        status: JobStatus,
        node_id: Option<String>,
    ) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        Self {
            artifact_prefix: format!("{}/{}/", ARTIFACT_PREFIX_ROOT, id),
            id,
            client_id: client_id.into(),
            document_id: document_id.into(),
            document_name: document_name.into(),
            task_name: task_name.into(),
            status,
            progress: 0.0,
            engine,
            error_message: None,
            status_message: None,
            node_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// Object key for an artifact under this job's prefix.
    pub fn object_key(&self, file_name: &str) -> String {
        format!("{}{}", self.artifact_prefix, file_name)
    }
}

/// Per-job model selection, one row per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSettings {
    pub job_id: String,
    pub text_model: String,
    pub table_model: String,
    pub image_model: String,
    pub stamp_model: String,
    pub is_correction_mode: bool,
}

impl JobSettings {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            text_model: String::new(),
            table_model: String::new(),
            image_model: String::new(),
            stamp_model: String::new(),
            is_correction_mode: false,
        }
    }

    /// The model identifier used for a block of the given type.
    pub fn model_for(&self, block_type: super::BlockType) -> &str {
        match block_type {
            super::BlockType::Text => &self.text_model,
            super::BlockType::Table => &self.table_model,
            super::BlockType::Image => &self.image_model,
        }
    }
}

/// Artifact categories attached to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Pdf,
    Blocks,
    Annotation,
    ResultMd,
    ResultZip,
    Crop,
    OcrHtml,
    ResultJson,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Blocks => "blocks",
            Self::Annotation => "annotation",
            Self::ResultMd => "result_md",
            Self::ResultZip => "result_zip",
            Self::Crop => "crop",
            Self::OcrHtml => "ocr_html",
            Self::ResultJson => "result_json",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pdf" => Some(Self::Pdf),
            "blocks" => Some(Self::Blocks),
            "annotation" => Some(Self::Annotation),
            "result_md" => Some(Self::ResultMd),
            "result_zip" => Some(Self::ResultZip),
            "crop" => Some(Self::Crop),
            "ocr_html" => Some(Self::OcrHtml),
            "result_json" => Some(Self::ResultJson),
            _ => None,
        }
    }

    /// At most one JobFile row of this type may exist per job.
    /// Crops are the only multi-valued type.
    pub fn is_single_valued(&self) -> bool {
        !matches!(self, Self::Crop)
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A typed artifact reference, cascade-deleted with its job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFile {
    pub id: String,
    pub job_id: String,
    pub file_type: FileType,
    pub object_key: String,
    pub file_name: String,
    pub file_size: i64,
    /// Free-form metadata; crops carry block id, page index, normalized
    /// coords and block type here.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl JobFile {
    pub fn new(
        job_id: impl Into<String>,
        file_type: FileType,
        object_key: impl Into<String>,
        file_name: impl Into<String>,
        file_size: i64,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.into(),
            file_type,
            object_key: object_key.into(),
            file_name: file_name.into(),
            file_size,
            metadata,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for s in [
            JobStatus::Draft,
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Done,
            JobStatus::Error,
            JobStatus::Paused,
        ] {
            assert_eq!(JobStatus::from_str(s.as_str()), Some(s));
        }
        assert_eq!(JobStatus::from_str("deleted"), None);
    }

    #[test]
    fn test_transition_table() {
        use JobStatus::*;
        assert_eq!(JobEvent::Start.apply(Draft), Some(Queued));
        assert_eq!(JobEvent::Claim.apply(Queued), Some(Processing));
        assert_eq!(JobEvent::Pause.apply(Queued), Some(Paused));
        assert_eq!(JobEvent::Pause.apply(Processing), Some(Paused));
        assert_eq!(JobEvent::Resume.apply(Paused), Some(Queued));
        assert_eq!(JobEvent::Restart.apply(Error), Some(Queued));
        assert_eq!(JobEvent::Complete.apply(Processing), Some(Done));
        assert_eq!(JobEvent::Fail.apply(Processing), Some(Error));
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        use JobStatus::*;
        // Done is final apart from deletion.
        for ev in [
            JobEvent::Start,
            JobEvent::Claim,
            JobEvent::Pause,
            JobEvent::Resume,
            JobEvent::Restart,
            JobEvent::Complete,
            JobEvent::Fail,
        ] {
            assert_eq!(ev.apply(Done), None);
        }
        assert_eq!(JobEvent::Start.apply(Queued), None);
        assert_eq!(JobEvent::Resume.apply(Queued), None);
        assert_eq!(JobEvent::Complete.apply(Queued), None);
    }

    #[test]
    fn test_new_job_has_prefixed_keys() {
        let job = Job::new(
            "client-1",
            "abc123",
            "report.pdf",
            "Report",
            EngineKind::Vision,
            JobStatus::Queued,
            None,
        );
        assert!(job.artifact_prefix.starts_with("ocr_jobs/"));
        assert!(job.artifact_prefix.ends_with('/'));
        assert_eq!(
            job.object_key("result.md"),
            format!("ocr_jobs/{}/result.md", job.id)
        );
        assert_eq!(job.progress, 0.0);
    }

    #[test]
    fn test_file_type_cardinality() {
        assert!(FileType::ResultMd.is_single_valued());
        assert!(FileType::Pdf.is_single_valued());
        assert!(!FileType::Crop.is_single_valued());
    }
}
