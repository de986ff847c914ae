//! Core data models: jobs, blocks, annotation documents.

pub mod annotation;
pub mod block;
pub mod job;

pub use annotation::{AnnotationBlock, AnnotationDocument, AnnotationPage, ANNOTATION_VERSION};
pub use block::{
    normalize_id, parse_blocks, Block, BlockType, Rect, ResultRecord, ResultStatus, ShapeType,
};
pub use job::{EngineKind, FileType, Job, JobEvent, JobFile, JobSettings, JobStatus};
