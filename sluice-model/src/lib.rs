//! Core data model definitions shared across sluice crates.

pub mod error;
pub mod ids;
pub mod ingest;
pub mod messages;
pub mod score;
pub mod service;
pub mod submission;
pub mod task;

pub use error::{ModelError, Result as ModelResult};
pub use ids::{ScanKey, Sha256, Sid};
pub use ingest::IngestTask;
pub use messages::{AlertMessage, CompletionMessage};
pub use score::FileScoreEntry;
pub use service::{
    ErrorCategory, ExtractedFile, ServiceError, ServiceResult, build_error_key,
    build_result_key,
};
pub use submission::{
    FileEntry, Notification, SubmissionParams, SubmissionRecord,
    SubmissionRequest, SubmissionState,
};
pub use task::{FileTask, ServiceTask};
