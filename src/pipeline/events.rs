//! Status-event payloads and per-job fan-out.
//!
//! Step and control code never touch the network boundary: they hand a
//! [`StatusUpdate`] to [`StatusFan`], which forwards it to the internal
//! status channel (drained by the dispatcher) and to the per-job
//! listener a subscribed client registered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use super::model::{Job, StatusUpdate};

/// Callback relaying one job's updates to the network boundary.
pub type JobListener = Box<dyn Fn(StatusUpdate) + Send + Sync>;

// ── Payload constructors ────────────────────────────────────────────
//
// Every event carries a machine-readable `type` alongside whatever the
// producing site adds. The taxonomy: stage, review-out, retry, error,
// completed, push, start.

/// `stage` — a step-progress marker: `{stage, step}` plus extras.
pub fn stage(stage: &str, step: &str, extra: Option<Value>) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert("type".into(), json!("stage"));
    obj.insert("stage".into(), json!(stage));
    obj.insert("step".into(), json!(step));
    if let Some(Value::Object(extra)) = extra {
        obj.extend(extra);
    }
    Value::Object(obj)
}

/// `review-out` — ask the operator to choose among `actions`.
pub fn review_out(heading: &str, content: &str, job_id: Uuid, step: &str, actions: &[&str]) -> Value {
    json!({
        "type": "review-out",
        "heading": heading,
        "content": content,
        "optional": false,
        "pipeline": {
            "jobId": job_id,
            "step": step,
            "actions": actions,
        },
    })
}

/// `retry` — a generation attempt failed and the step will (maybe) retry.
pub fn retry(retries: u32, max_retries: u32, will_retry: bool, error: &str) -> Value {
    json!({
        "type": "retry",
        "retries": retries,
        "maxRetry": max_retries,
        "willRetry": will_retry,
        "error": error,
    })
}

/// `error` — a failure the job persisted.
pub fn error(heading: &str, message: &str) -> Value {
    json!({
        "type": "error",
        "heading": heading,
        "message": message,
    })
}

/// `completed` — the artifact is ready.
pub fn completed(message: &str, pdf_url: &str, metadata: Value) -> Value {
    json!({
        "type": "completed",
        "message": message,
        "pdf_url": pdf_url,
        "metadata": metadata,
    })
}

/// `start` — a worker began a pass over the job.
pub fn start(message: &str) -> Value {
    json!({
        "type": "start",
        "message": message,
    })
}

/// `push` — the job was accepted and queued.
pub fn push(message: &str, job_id: Uuid) -> Value {
    json!({
        "type": "push",
        "message": message,
        "jobId": job_id,
    })
}

// ── Fan-out ─────────────────────────────────────────────────────────

/// Fan-out point for status updates.
pub struct StatusFan {
    tx: mpsc::Sender<StatusUpdate>,
    listeners: Mutex<HashMap<Uuid, Arc<JobListener>>>,
}

impl StatusFan {
    /// Create the fan and the receiver the dispatcher drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StatusUpdate>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                listeners: Mutex::new(HashMap::new()),
            },
            rx,
        )
    }

    /// Register a listener for one job's updates. Replaces any previous
    /// listener for that job.
    pub fn register_listener(&self, job_id: Uuid, listener: JobListener) {
        self.listeners
            .lock()
            .expect("listener registry poisoned")
            .insert(job_id, Arc::new(listener));
    }

    /// Remove a job's listener (client disconnected).
    pub fn unregister_listener(&self, job_id: Uuid) {
        self.listeners
            .lock()
            .expect("listener registry poisoned")
            .remove(&job_id);
    }

    /// Build and fan out a status update for `job`.
    ///
    /// The channel send is non-blocking: a saturated channel drops the
    /// update with a log line. The per-job listener, if any, is invoked
    /// synchronously so per-job ordering matches the state transitions
    /// that produced the events.
    pub fn emit(&self, job: &Job, message: impl Into<String>, data: Value) {
        let update = StatusUpdate {
            job_id: job.id,
            status: job.status,
            step: job.current_step,
            message: message.into(),
            data,
            timestamp: Utc::now(),
        };

        if let Err(e) = self.tx.try_send(update.clone()) {
            warn!(job = %update.job_id, error = %e, "Status channel full, dropping update");
        }

        // Release the registry lock before invoking, so a listener may
        // itself register or unregister.
        let listener = {
            let listeners = self.listeners.lock().expect("listener registry poisoned");
            listeners.get(&update.job_id).cloned()
        };
        if let Some(listener) = listener {
            listener(update);
        }
    }
}
