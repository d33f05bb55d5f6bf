//! End-to-end pipeline scenarios against scripted collaborators.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use sheetpipe::config::PipelineConfig;
use sheetpipe::error::{CompileFailure, EnrichError, GenerateError};
use sheetpipe::llm::{ChatMessage, Role, Task, TextGenerator};
use sheetpipe::pipeline::model::{Conversation, Job, JobStatus, PipelineStep, StatusUpdate};
use sheetpipe::pipeline::{Control, Queue, StepDeps};
use sheetpipe::request::{GenerationRequest, Mode};
use sheetpipe::search::Enrichment;
use sheetpipe::store::FileStore;
use sheetpipe::styles::NoStyles;
use sheetpipe::typeset::Typesetter;

const GOOD_SOURCE: &str = "\\documentclass{article}\n\\begin{document}\nAlgebra drills\n\\end{document}";

// ── Scripted collaborators ──────────────────────────────────────────

/// Routes replies by task and prompt shape; can fail the first N calls
/// and delay every call (for the abort scenario).
struct RouterLlm {
    failures_left: AtomicUsize,
    delay: Duration,
}

impl RouterLlm {
    fn new() -> Self {
        Self {
            failures_left: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    fn failing(times: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(times),
            delay: Duration::ZERO,
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            failures_left: AtomicUsize::new(0),
            delay,
        }
    }
}

#[async_trait]
impl TextGenerator for RouterLlm {
    async fn generate(&self, task: Task, messages: &[ChatMessage]) -> Result<String, GenerateError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(GenerateError::RequestFailed("backend unavailable".into()));
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        if task == Task::Main {
            return Ok(format!("```latex\n{GOOD_SOURCE}\n```"));
        }
        if last_user.contains("failed to compile") {
            return Ok(format!("{GOOD_SOURCE} % fixed"));
        }
        if last_user.contains("Refine the design") {
            return Ok("A refined worksheet design".into());
        }
        Ok("A structured worksheet design".into())
    }
}

/// Fails the first N compiles with a fixed log, then succeeds.
struct FlakyTypesetter {
    failures_left: AtomicUsize,
    log: String,
}

impl FlakyTypesetter {
    fn ok() -> Self {
        Self {
            failures_left: AtomicUsize::new(0),
            log: String::new(),
        }
    }

    fn failing(times: usize, log: &str) -> Self {
        Self {
            failures_left: AtomicUsize::new(times),
            log: log.into(),
        }
    }
}

#[async_trait]
impl Typesetter for FlakyTypesetter {
    async fn compile(&self, _: &str, _: &str, _: &Path) -> Result<(), CompileFailure> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CompileFailure::new(self.log.clone()));
        }
        Ok(())
    }
}

struct BrokenSearch;

#[async_trait]
impl Enrichment for BrokenSearch {
    async fn search_context(&self, _: &str, _: usize) -> Result<String, EnrichError> {
        Err(EnrichError("dns failure".into()))
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Harness {
    store: Arc<FileStore>,
    queue: Arc<Queue>,
    control: Control,
    events: Arc<Mutex<Vec<StatusUpdate>>>,
    tmp: tempfile::TempDir,
}

fn harness(llm: RouterLlm, typesetter: FlakyTypesetter, enrichment: bool) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
        base_dir: tmp.path().join("storage"),
        bucket_dir: tmp.path().join("storage/bucket"),
        generated_dir: tmp.path().join("generated"),
        workers: 2,
        ..PipelineConfig::default()
    };
    let store = Arc::new(FileStore::open(&config.base_dir).unwrap());
    let deps = StepDeps {
        llm: Arc::new(llm),
        typesetter: Arc::new(typesetter),
        enrichment: enrichment.then(|| Arc::new(BrokenSearch) as Arc<dyn Enrichment>),
        styles: Arc::new(NoStyles),
    };
    let queue = Queue::start(config.clone(), store.clone(), deps);
    let control = Control::new(store.clone(), queue.clone(), config);

    Harness {
        store,
        queue,
        control,
        events: Arc::new(Mutex::new(Vec::new())),
        tmp,
    }
}

fn request() -> GenerationRequest {
    GenerationRequest {
        subject: "Algebra".into(),
        course: "Linear Equations".into(),
        description: "short diagnostic".into(),
        tags: vec!["algebra".into()],
        curriculum: String::new(),
        special_instructions: String::new(),
        visibility: "private".into(),
        style_name: None,
        mode: Mode::Notes,
        web_search_query: None,
        web_search_enabled: false,
        attachments: vec![],
    }
}

impl Harness {
    /// Seed a job with its listener registered before the first worker
    /// pass, so no event is missed.
    async fn start_job(&self, request: &GenerationRequest) -> Job {
        let prompt = serde_json::to_string(request).unwrap();
        let mut job = Job::new("alice", prompt, 3);
        job.metadata
            .insert("request".into(), serde_json::to_value(request).unwrap());
        let conv = Conversation::new(job.id);
        job.conversation_id = conv.id;
        self.store.save_job(&job).await.unwrap();
        self.store.save_conversation(&conv).await.unwrap();

        let events = self.events.clone();
        self.queue
            .register_listener(job.id, Box::new(move |u| events.lock().unwrap().push(u)));

        self.queue.enqueue(job.id).await.unwrap();
        job
    }

    async fn wait_for_status(&self, id: Uuid, status: JobStatus) -> Job {
        for _ in 0..500 {
            let job = self.store.get_job(id).await.unwrap();
            if job.status == status {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached {status}");
    }

    async fn wait_for_event<F: Fn(&StatusUpdate) -> bool>(&self, pred: F) {
        for _ in 0..500 {
            if self.events.lock().unwrap().iter().any(&pred) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected event never arrived");
    }

    fn event_types(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|u| u.data.get("type").and_then(|t| t.as_str()).map(String::from))
            .collect()
    }

    /// (stage, step) pairs of all `stage` events, in emission order.
    fn stage_pairs(&self) -> Vec<(String, String)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.data["type"] == "stage")
            .map(|u| {
                (
                    u.data["stage"].as_str().unwrap_or_default().to_string(),
                    u.data["step"].as_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }
}

/// Assert `expected` appears as an in-order subsequence of `actual`.
fn assert_subsequence(actual: &[(String, String)], expected: &[(&str, &str)]) {
    let mut it = actual.iter();
    for (stage, step) in expected {
        assert!(
            it.any(|(s, t)| s == stage && t == step),
            "missing {stage}/{step} in {actual:?}"
        );
    }
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_completes_with_ordered_events() {
    let h = harness(RouterLlm::new(), FlakyTypesetter::ok(), false);
    let job = h.start_job(&request()).await;

    let done = h.wait_for_status(job.id, JobStatus::Completed).await;
    assert_eq!(done.current_step, PipelineStep::Done);
    let pdf_url = done.pdf_url.unwrap();
    assert!(pdf_url.ends_with(&format!("{}.pdf", job.id)));
    assert!(pdf_url.starts_with("/bucket/"));
    assert_eq!(done.design, "A structured worksheet design");
    assert_eq!(done.source, GOOD_SOURCE);
    assert!(done.completed_at.is_some());
    assert_eq!(done.metadata["metadata"]["source"], "pipeline");

    assert_subsequence(
        &h.stage_pairs(),
        &[
            ("Prompt", "Validated"),
            ("Design", "Generated"),
            ("Source", "Generated"),
            ("Compile", "Compiling"),
        ],
    );
    assert!(h.event_types().contains(&"completed".to_string()));

    // Audit sidecars written under the per-job directory.
    let audit = h.tmp.path().join("generated").join(job.id.to_string());
    assert!(audit.join(format!("{}.src", job.id)).exists());
    assert!(audit.join(format!("{}.meta.json", job.id)).exists());
}

#[tokio::test]
async fn compile_failure_escalates_then_manual_edit_completes() {
    let log = "! Undefined control sequence.\nl.42 \\broken";
    let h = harness(RouterLlm::new(), FlakyTypesetter::failing(1, log), false);
    let job = h.start_job(&request()).await;

    let waiting = h.wait_for_status(job.id, JobStatus::WaitingManual).await;
    assert_eq!(waiting.error_log.as_deref(), Some(log));
    assert!(waiting.error_message.is_some());

    h.wait_for_event(|u| {
        u.data["type"] == "review-out"
            && u.data["pipeline"]["actions"] == serde_json::json!(["approve", "edit", "fix"])
    })
    .await;

    h.control
        .source_edit(job.id, "alice", GOOD_SOURCE)
        .await
        .unwrap();

    let done = h.wait_for_status(job.id, JobStatus::Completed).await;
    assert_eq!(done.source, GOOD_SOURCE);
}

#[tokio::test]
async fn ai_fix_replaces_source_and_threads_conversation() {
    let log = "! Missing } inserted";
    let h = harness(RouterLlm::new(), FlakyTypesetter::failing(1, log), false);
    let job = h.start_job(&request()).await;

    h.wait_for_status(job.id, JobStatus::WaitingManual).await;
    let before = h.store.conversation_by_job(job.id).await.unwrap().messages.len();

    let fixed = h.control.ai_fix(job.id, "alice", log).await.unwrap();
    assert_eq!(fixed.status, JobStatus::WaitingManual);
    assert_eq!(fixed.source, format!("{GOOD_SOURCE} % fixed"));

    let after = h.store.conversation_by_job(job.id).await.unwrap().messages.len();
    assert_eq!(after, before + 2);

    // Approving the fix finishes the job.
    h.control.source_approve(job.id, "alice").await.unwrap();
    h.wait_for_status(job.id, JobStatus::Completed).await;
}

#[tokio::test]
async fn retry_from_scratch_resets_and_completes() {
    let h = harness(RouterLlm::new(), FlakyTypesetter::ok(), false);
    let job = h.start_job(&request()).await;
    h.wait_for_status(job.id, JobStatus::Completed).await;

    let old_conv = h.store.conversation_by_job(job.id).await.unwrap();

    // Force the finished job into error, then retry from scratch.
    let mut txn = h.store.job_for_update(job.id).await.unwrap();
    txn.job.set_error("forced failure", Some("log".into()));
    txn.commit().await.unwrap();

    let retried = h.control.retry(job.id, "alice").await.unwrap();
    assert_eq!(retried.retry_count, 0);
    assert_eq!(retried.current_step, PipelineStep::Prompt);
    assert!(retried.design.is_empty());
    assert!(retried.source.is_empty());
    assert!(retried.pdf_url.is_none());
    assert!(retried.completed_at.is_none());
    assert_ne!(retried.conversation_id, old_conv.id);

    let done = h.wait_for_status(job.id, JobStatus::Completed).await;
    assert_eq!(done.conversation_id, retried.conversation_id);
    assert!(done.pdf_url.is_some());
}

#[tokio::test]
async fn abort_mid_run_skips_remaining_steps() {
    // Slow design step keeps the first pass busy long enough to abort.
    let h = harness(
        RouterLlm::slow(Duration::from_millis(300)),
        FlakyTypesetter::ok(),
        false,
    );
    let job = h.start_job(&request()).await;

    h.wait_for_event(|u| u.status == JobStatus::Running).await;
    h.control.abort(job.id, "alice").await.unwrap();

    let ended = h.wait_for_status(job.id, JobStatus::Aborted).await;
    assert!(ended.pdf_url.is_none());

    // Give any in-flight pass time to observe the abort and stop.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!h.event_types().contains(&"completed".to_string()));
    let current = h.store.get_job(job.id).await.unwrap();
    assert_eq!(current.status, JobStatus::Aborted);
}

#[tokio::test]
async fn enrichment_failure_is_non_fatal() {
    let mut req = request();
    req.web_search_enabled = true;
    req.web_search_query = Some("linear equations drills".into());

    let h = harness(RouterLlm::new(), FlakyTypesetter::ok(), true);
    let job = h.start_job(&req).await;

    let done = h.wait_for_status(job.id, JobStatus::Completed).await;
    assert!(done.pdf_url.is_some());

    assert_subsequence(&h.stage_pairs(), &[("WebSearch", "Failed"), ("Design", "Generated")]);
}

#[tokio::test]
async fn generation_failures_retry_within_budget() {
    // Two failures, budget of three: the design step retries in place.
    let h = harness(RouterLlm::failing(2), FlakyTypesetter::ok(), false);
    let job = h.start_job(&request()).await;

    let done = h.wait_for_status(job.id, JobStatus::Completed).await;
    assert_eq!(done.retry_count, 2);
    assert!(done.retry_count <= done.max_retries);

    let retries = h
        .events
        .lock()
        .unwrap()
        .iter()
        .filter(|u| u.data["type"] == "retry")
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn generation_failures_beyond_budget_error_out() {
    let h = harness(RouterLlm::failing(10), FlakyTypesetter::ok(), false);
    let job = h.start_job(&request()).await;

    let failed = h.wait_for_status(job.id, JobStatus::Error).await;
    assert_eq!(failed.retry_count, failed.max_retries);
    assert!(failed.error_message.unwrap().contains("Design generation failed"));
    assert!(h.event_types().contains(&"error".to_string()));
}

#[tokio::test]
async fn design_refine_pauses_then_approve_resumes() {
    let h = harness(RouterLlm::new(), FlakyTypesetter::ok(), false);
    let job = h.start_job(&request()).await;
    h.wait_for_status(job.id, JobStatus::Completed).await;

    // A completed job cannot be refined into a new design pass; build a
    // fresh one and pause it at the design review instead.
    let job2 = h.control.create("alice", request()).await.unwrap();
    h.wait_for_status(job2.id, JobStatus::Completed).await;

    let mut txn = h.store.job_for_update(job2.id).await.unwrap();
    txn.job.status = JobStatus::WaitingManual;
    txn.job.error_message = Some("review".into());
    txn.job.current_step = PipelineStep::Design;
    txn.commit().await.unwrap();

    let refined = h
        .control
        .design_refine(job2.id, "alice", "more word problems")
        .await
        .unwrap();
    assert_eq!(refined.status, JobStatus::WaitingManual);
    assert_eq!(refined.design, "A refined worksheet design");

    let resumed = h.control.design_approve(job2.id, "alice").await.unwrap();
    assert_eq!(resumed.current_step, PipelineStep::Source);
    h.wait_for_status(job2.id, JobStatus::Completed).await;

    h.queue.shutdown().await;
}
