//! Job and conversation model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::llm::Role;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the queue for a worker.
    Pending,
    /// A worker is driving the job through its steps.
    Running,
    /// Failed with a persisted error message.
    Error,
    /// Paused for a human decision (approve / edit / fix).
    WaitingManual,
    /// An AI fix is being generated on the job's behalf.
    WaitingAiFix,
    /// Finished; `pdf_url` points at the artifact.
    Completed,
    /// Cancelled by the user.
    Aborted,
}

impl JobStatus {
    /// Terminal states are never re-entered by the worker loop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    /// Whether a worker may run steps for a job in this state.
    pub fn is_processable(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Error => "error",
            Self::WaitingManual => "waiting_manual",
            Self::WaitingAiFix => "waiting_ai_fix",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

/// A stage of the generation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStep {
    Prompt,
    Design,
    Source,
    Compile,
    Done,
}

impl PipelineStep {
    /// The step that follows this one. `Done` is a fixed point.
    pub fn next(self) -> Self {
        match self {
            Self::Prompt => Self::Design,
            Self::Design => Self::Source,
            Self::Source => Self::Compile,
            Self::Compile => Self::Done,
            Self::Done => Self::Done,
        }
    }
}

impl std::fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Prompt => "prompt",
            Self::Design => "design",
            Self::Source => "source",
            Self::Compile => "compile",
            Self::Done => "done",
        };
        write!(f, "{s}")
    }
}

/// A worksheet generation job, tracked from submission to delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub user_id: String,
    pub status: JobStatus,
    pub current_step: PipelineStep,
    /// Serialized [`GenerationRequest`](crate::request::GenerationRequest).
    pub prompt: String,
    #[serde(default)]
    pub design: String,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_log: Option<String>,
    pub conversation_id: Uuid,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Job {
    /// Create a job in its initial state.
    pub fn new(user_id: impl Into<String>, prompt: impl Into<String>, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            status: JobStatus::Pending,
            current_step: PipelineStep::Prompt,
            prompt: prompt.into(),
            design: String::new(),
            source: String::new(),
            pdf_url: None,
            error_message: None,
            error_log: None,
            conversation_id: Uuid::new_v4(),
            retry_count: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            completed_at: None,
            metadata: Map::new(),
        }
    }

    /// Whether the retry budget allows another attempt.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn increment_retry(&mut self) {
        self.retry_count += 1;
        self.touch();
    }

    /// Move to `error` with a message and an optional compiler log.
    pub fn set_error(&mut self, message: impl Into<String>, log: Option<String>) {
        self.status = JobStatus::Error;
        self.error_message = Some(message.into());
        self.error_log = log;
        self.touch();
    }

    /// Pause for a human decision. The message doubles as the persisted
    /// reason the job is waiting.
    pub fn set_waiting_manual(&mut self, message: impl Into<String>) {
        self.status = JobStatus::WaitingManual;
        self.error_message = Some(message.into());
        self.touch();
    }

    /// Mark completed with the delivered artifact URL.
    pub fn set_completed(&mut self, pdf_url: impl Into<String>) {
        self.status = JobStatus::Completed;
        self.current_step = PipelineStep::Done;
        self.pdf_url = Some(pdf_url.into());
        let now = Utc::now();
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Advance to the next pipeline step, ready for the next pass.
    pub fn advance_step(&mut self) {
        self.current_step = self.current_step.next();
        self.status = JobStatus::Pending;
        self.touch();
    }

    /// Reset to a specific step for an in-step retry, clearing any
    /// recorded error.
    pub fn reset_to_step(&mut self, step: PipelineStep) {
        self.current_step = step;
        self.status = JobStatus::Pending;
        self.error_message = None;
        self.error_log = None;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// The dialogue thread carried across all generation calls for a job.
///
/// Messages accumulate across refinements and fix attempts; the thread
/// is replaced only by an explicit retry-from-scratch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub job_id: Uuid,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(job_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_id,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a message with the current timestamp.
    pub fn add_message(&mut self, role: Role, content: impl Into<String>) {
        let now = Utc::now();
        self.messages.push(Message {
            role,
            content: content.into(),
            timestamp: now,
        });
        self.updated_at = now;
    }
}

/// A job status change event, fanned out to listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub step: PipelineStep,
    pub message: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}
