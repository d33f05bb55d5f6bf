//! Error types for the worksheet pipeline.

use uuid::Uuid;

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Generation error: {0}")]
    Generate(#[from] GenerateError),

    #[error("Enrichment error: {0}")]
    Enrich(#[from] EnrichError),

    #[error("Compile error: {0}")]
    Compile(#[from] CompileFailure),

    #[error("Control error: {0}")]
    Control(#[from] ControlError),
}

/// Persistence errors. An `Io` or `Serialization` failure on save leaves
/// the prior on-disk snapshot intact (atomic replace).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn job_not_found(id: Uuid) -> Self {
        Self::NotFound { entity: "job", id }
    }

    pub fn conversation_not_found(id: Uuid) -> Self {
        Self::NotFound {
            entity: "conversation",
            id,
        }
    }

    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Queue admission errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is full")]
    Full,

    #[error("Queue is shut down")]
    Closed,

    #[error("Cannot enqueue non-existent job: {0}")]
    UnknownJob(Uuid),
}

/// Text-generation backend errors. Retryable within a step up to the
/// job's `max_retries`.
#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("Generation request failed: {0}")]
    RequestFailed(String),

    #[error("Generation returned an empty response")]
    EmptyResponse,

    #[error("Generation timed out after {seconds}s")]
    Timeout { seconds: u64 },
}

/// Web-search enrichment errors. Never fatal to a pipeline pass.
#[derive(Debug, thiserror::Error)]
#[error("Web search failed: {0}")]
pub struct EnrichError(pub String);

/// Typesetter compilation failure, carrying the compiler log.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Compilation failed: {log}")]
pub struct CompileFailure {
    /// Full compiler log.
    pub log: String,
    /// Offending source snippet, when the typesetter isolates one.
    pub snippet: Option<String>,
    /// Source line of the first error, when known.
    pub line: Option<u32>,
}

impl CompileFailure {
    pub fn new(log: impl Into<String>) -> Self {
        Self {
            log: log.into(),
            snippet: None,
            line: None,
        }
    }
}

/// Control-operation errors.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Job {id} is in state {status}, {operation} not allowed")]
    WrongState {
        id: Uuid,
        status: String,
        operation: &'static str,
    },
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
