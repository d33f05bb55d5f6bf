//! The worksheet generation pipeline: model, store-driven step
//! executor, worker pool, status fan-out, and control operations.

pub mod control;
pub mod events;
pub mod model;
pub mod queue;
pub mod steps;

pub use control::Control;
pub use events::StatusFan;
pub use model::{Conversation, Job, JobStatus, Message, PipelineStep, StatusUpdate};
pub use queue::Queue;
pub use steps::{StepDeps, StepRunner, SYSTEM_PROMPT};
