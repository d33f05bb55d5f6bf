//! Externally-triggered job operations.
//!
//! Every operation takes `(job_id, user_id)` and answers not-found on
//! an ownership mismatch; authorization proper is the caller layer's
//! job. Operations acquire the job's exclusive lock, mutate, commit,
//! and only then enqueue. The two operations that call the generation
//! backend (`design_refine`, `ai_fix`) run that call *between* two lock
//! windows — only the worker pool may hold a job lock across external
//! I/O.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use super::events;
use super::model::{Conversation, Job, JobStatus, PipelineStep};
use super::queue::Queue;
use crate::config::PipelineConfig;
use crate::error::{ControlError, Error, Result, StoreError};
use crate::request::GenerationRequest;
use crate::store::{FileStore, JobTxn};

/// The control surface exposed to the transport layer.
pub struct Control {
    store: Arc<FileStore>,
    queue: Arc<Queue>,
    config: PipelineConfig,
}

impl Control {
    pub fn new(store: Arc<FileStore>, queue: Arc<Queue>, config: PipelineConfig) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    /// Create a job from a request, persist it with a fresh
    /// conversation, and enqueue it.
    pub async fn create(&self, user_id: &str, request: GenerationRequest) -> Result<Job> {
        request
            .validate()
            .map_err(ControlError::InvalidRequest)?;

        let prompt = serde_json::to_string(&request).map_err(StoreError::Serialization)?;
        let mut job = Job::new(user_id, prompt, self.config.default_max_retries);
        job.metadata.insert(
            "request".into(),
            serde_json::to_value(&request).map_err(StoreError::Serialization)?,
        );

        let conv = Conversation::new(job.id);
        job.conversation_id = conv.id;
        self.store.save_job(&job).await?;
        self.store.save_conversation(&conv).await?;

        self.queue.enqueue(job.id).await?;
        self.queue
            .fan()
            .emit(&job, "Job accepted and queued", events::push("Job accepted and queued", job.id));

        info!(job = %job.id, user = user_id, "Created job");
        Ok(job)
    }

    /// Approve the generated design; the pipeline moves on to source
    /// generation.
    pub async fn design_approve(&self, job_id: Uuid, user_id: &str) -> Result<Job> {
        let mut txn = self.owned_txn(job_id, user_id).await?;
        if txn.job.current_step != PipelineStep::Design
            || !matches!(txn.job.status, JobStatus::Running | JobStatus::WaitingManual)
        {
            return Err(wrong_state(&txn.job, "design approve"));
        }

        txn.job.reset_to_step(PipelineStep::Source);
        let job = txn.job.clone();
        txn.commit().await?;

        self.queue
            .fan()
            .emit(&job, "Design approved, generating source", events::stage("Design", "Approved", None));
        self.queue.enqueue(job.id).await?;
        Ok(job)
    }

    /// Refine the design from operator feedback and park the job for
    /// another review.
    pub async fn design_refine(&self, job_id: Uuid, user_id: &str, refinement: &str) -> Result<Job> {
        let refinement = refinement.trim();
        if refinement.is_empty() {
            return Err(ControlError::InvalidRequest("refinement required".into()).into());
        }

        // First window: verify ownership and snapshot the design.
        let current_design = {
            let txn = self.owned_txn(job_id, user_id).await?;
            let design = txn.job.design.clone();
            txn.commit().await?;
            design
        };

        let refined = self
            .queue
            .runner()
            .refine_design(job_id, refinement, &current_design)
            .await?;

        // Second window: store the result and wait for review.
        let mut txn = self.owned_txn(job_id, user_id).await?;
        txn.job.design = refined;
        txn.job.current_step = PipelineStep::Design;
        txn.job.set_waiting_manual("Design refined - review required");
        let job = txn.job.clone();
        txn.commit().await?;

        self.queue.fan().emit(
            &job,
            "Design refined - review required",
            events::review_out(
                "Design Review",
                &format!("```text\n{}\n```", job.design),
                job.id,
                "design",
                &["approve", "refine", "regenerate"],
            ),
        );
        Ok(job)
    }

    /// Approve the current source; the pipeline moves on to compilation.
    pub async fn source_approve(&self, job_id: Uuid, user_id: &str) -> Result<Job> {
        let mut txn = self.owned_txn(job_id, user_id).await?;
        if txn.job.current_step != PipelineStep::Source || txn.job.status.is_terminal() {
            return Err(wrong_state(&txn.job, "source approve"));
        }

        txn.job.reset_to_step(PipelineStep::Compile);
        let job = txn.job.clone();
        txn.commit().await?;

        self.queue
            .fan()
            .emit(&job, "Source approved, starting compilation", events::stage("Source", "Approved", None));
        self.queue.enqueue(job.id).await?;
        Ok(job)
    }

    /// Replace the source verbatim and send the job to compilation.
    pub async fn source_edit(&self, job_id: Uuid, user_id: &str, new_source: &str) -> Result<Job> {
        if new_source.trim().is_empty() {
            return Err(ControlError::InvalidRequest("source required".into()).into());
        }

        let mut txn = self.owned_txn(job_id, user_id).await?;
        if txn.job.status.is_terminal() {
            return Err(wrong_state(&txn.job, "source edit"));
        }

        txn.job.source = new_source.to_string();
        txn.job.reset_to_step(PipelineStep::Compile);
        let job = txn.job.clone();
        txn.commit().await?;

        self.queue
            .fan()
            .emit(&job, "Source updated, starting compilation", events::stage("Source", "Edited", None));
        self.queue.enqueue(job.id).await?;
        Ok(job)
    }

    /// Ask the AI to repair the source from a compile log, then park
    /// the job for review of the fix.
    pub async fn ai_fix(&self, job_id: Uuid, user_id: &str, error_log: &str) -> Result<Job> {
        let error_log = error_log.trim();
        if error_log.is_empty() {
            return Err(ControlError::InvalidRequest("errorLog required".into()).into());
        }

        // First window: park the job while the fix is generated.
        let source = {
            let mut txn = self.owned_txn(job_id, user_id).await?;
            if txn.job.status.is_terminal() {
                return Err(wrong_state(&txn.job, "ai fix"));
            }
            txn.job.status = JobStatus::WaitingAiFix;
            txn.job.error_message = Some("AI fix in progress".into());
            txn.job.touch();
            let source = txn.job.source.clone();
            let job = txn.job.clone();
            txn.commit().await?;
            self.queue
                .fan()
                .emit(&job, "Generating AI fix", events::stage("Fix", "Generating", None));
            source
        };

        let fixed = match self.queue.runner().fix_source(job_id, &source, error_log).await {
            Ok(fixed) => fixed,
            Err(e) => {
                // Restore a reviewable state before surfacing the error.
                let mut txn = self.owned_txn(job_id, user_id).await?;
                txn.job.set_waiting_manual(format!("AI fix failed: {e}"));
                let job = txn.job.clone();
                txn.commit().await?;
                self.queue
                    .fan()
                    .emit(&job, "AI fix failed", events::error("AI fix failed", &e.to_string()));
                return Err(e);
            }
        };

        // Second window: store the fix and wait for review.
        let mut txn = self.owned_txn(job_id, user_id).await?;
        txn.job.source = fixed;
        txn.job.current_step = PipelineStep::Source;
        txn.job.set_waiting_manual("Source fixed - review required");
        let job = txn.job.clone();
        txn.commit().await?;

        self.queue.fan().emit(
            &job,
            "Source fixed - review required",
            events::review_out(
                "Source Review",
                &format!("```latex\n{}\n```", job.source),
                job.id,
                "source",
                &["approve", "edit", "fix"],
            ),
        );
        Ok(job)
    }

    /// Re-run a failed or aborted job from scratch: counters reset,
    /// artifacts cleared, and a brand-new conversation installed.
    pub async fn retry(&self, job_id: Uuid, user_id: &str) -> Result<Job> {
        let mut txn = self.owned_txn(job_id, user_id).await?;
        if !matches!(txn.job.status, JobStatus::Error | JobStatus::Aborted) {
            return Err(wrong_state(&txn.job, "retry"));
        }

        let conv = Conversation::new(job_id);
        txn.job.status = JobStatus::Pending;
        txn.job.current_step = PipelineStep::Prompt;
        txn.job.retry_count = 0;
        txn.job.error_message = None;
        txn.job.error_log = None;
        txn.job.design.clear();
        txn.job.source.clear();
        txn.job.pdf_url = None;
        txn.job.completed_at = None;
        txn.job.conversation_id = conv.id;
        txn.job.touch();
        let job = txn.job.clone();
        txn.commit().await?;

        self.store.delete_conversations_for_job(job_id).await?;
        self.store.save_conversation(&conv).await?;

        self.queue
            .fan()
            .emit(&job, "Job retrying from scratch", events::stage("Pipeline", "Retrying", None));
        self.queue.enqueue(job.id).await?;

        info!(job = %job.id, "Job reset for retry");
        Ok(job)
    }

    /// Abort a non-terminal job. Advisory: a step already running
    /// finishes; the worker observes the aborted status at its next
    /// lock entry and skips.
    pub async fn abort(&self, job_id: Uuid, user_id: &str) -> Result<Job> {
        let mut txn = self.owned_txn(job_id, user_id).await?;
        if txn.job.status.is_terminal() {
            return Err(wrong_state(&txn.job, "abort"));
        }

        txn.job.status = JobStatus::Aborted;
        txn.job.touch();
        let job = txn.job.clone();
        txn.commit().await?;

        self.queue
            .fan()
            .emit(&job, "Job aborted", events::error("Job aborted", "Aborted by user"));
        Ok(job)
    }

    /// Remove a job and its conversation.
    pub async fn delete(&self, job_id: Uuid, user_id: &str) -> Result<()> {
        let txn = self.owned_txn(job_id, user_id).await?;
        // Delete while the exclusive lock is held so no concurrent
        // commit can resurrect the job; the txn itself is dropped
        // uncommitted.
        self.store.delete_job(job_id).await?;
        drop(txn);

        self.store.delete_conversations_for_job(job_id).await?;
        self.queue.fan().unregister_listener(job_id);

        info!(job = %job_id, "Job deleted");
        Ok(())
    }

    /// Lock the job and verify ownership; a mismatch answers the same
    /// not-found as an unknown id.
    async fn owned_txn(&self, job_id: Uuid, user_id: &str) -> Result<JobTxn> {
        let txn = self.store.job_for_update(job_id).await?;
        if txn.job.user_id != user_id {
            return Err(StoreError::job_not_found(job_id).into());
        }
        Ok(txn)
    }
}

fn wrong_state(job: &Job, operation: &'static str) -> Error {
    ControlError::WrongState {
        id: job.id,
        status: job.status.to_string(),
        operation,
    }
    .into()
}
