//! Pipeline step functions.
//!
//! Each step transforms a job (and its conversation) using the external
//! collaborator contracts. Steps are invoked by a worker while the
//! job's exclusive lock is held; they mutate the working copy and
//! record every outcome on the job itself, so the caller only needs to
//! commit.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::events::{self, StatusFan};
use super::model::{Conversation, Job, JobStatus, PipelineStep};
use crate::config::PipelineConfig;
use crate::error::{Error, GenerateError, Result, StoreError};
use crate::llm::{ChatMessage, Role, Task, TextGenerator};
use crate::request::{Attachment, GenerationRequest};
use crate::search::Enrichment;
use crate::store::FileStore;
use crate::styles::StyleResolver;
use crate::typeset::Typesetter;

/// Fixed system prompt, identical across every generation call.
pub const SYSTEM_PROMPT: &str = "You are a deterministic document generation engine.\n\n\
     Rules:\n\
     - Output ONLY a valid typeset source\n\
     - Do not explain\n\
     - Do not apologize\n\
     - Do not include markdown code blocks\n\
     - Use only standard packages\n\
     - Never invent data\n\
     - Never use placeholders or TODOs\n\
     - If uncertain, choose the simplest valid option";

/// External collaborators the steps call out to.
pub struct StepDeps {
    pub llm: Arc<dyn TextGenerator>,
    pub typesetter: Arc<dyn Typesetter>,
    /// Optional web-search enrichment; `None` disables it entirely.
    pub enrichment: Option<Arc<dyn Enrichment>>,
    pub styles: Arc<dyn StyleResolver>,
}

/// Runs individual pipeline steps against a job's working copy.
pub struct StepRunner {
    deps: StepDeps,
    store: Arc<FileStore>,
    fan: Arc<StatusFan>,
    config: PipelineConfig,
}

impl StepRunner {
    pub fn new(
        deps: StepDeps,
        store: Arc<FileStore>,
        fan: Arc<StatusFan>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            deps,
            store,
            fan,
            config,
        }
    }

    // ── Prompt step ─────────────────────────────────────────────────

    /// Validate the serialized request and advance to `design`.
    pub async fn run_prompt(&self, job: &mut Job) -> Result<()> {
        self.fan.emit(job, "Processing prompt", events::stage("Prompt", "Validating", None));

        if job.prompt.trim().is_empty() {
            job.set_error("Empty prompt", None);
            self.fan.emit(job, "Prompt validation failed", events::error("Pipeline error", "Empty prompt"));
            return Err(crate::error::ControlError::InvalidRequest("empty prompt".into()).into());
        }

        if let Err(e) = parse_request(job) {
            let msg = format!("Invalid request: {e}");
            job.set_error(&msg, None);
            self.fan.emit(job, "Prompt validation failed", events::error("Pipeline error", &msg));
            return Err(e);
        }

        job.advance_step();
        self.fan.emit(job, "Prompt validated, moving to design", events::stage("Prompt", "Validated", None));
        Ok(())
    }

    // ── Design step ─────────────────────────────────────────────────

    /// Generate the worksheet design from the request, threading the
    /// conversation and retrying generation failures in place.
    pub async fn run_design(&self, job: &mut Job) -> Result<()> {
        self.fan.emit(job, "Generating design", events::stage("Design", "Generating", None));

        let request = match parse_request(job) {
            Ok(request) => request,
            Err(e) => {
                let msg = format!("Invalid request: {e}");
                job.set_error(&msg, None);
                self.fan.emit(job, "Design generation failed", events::error("Pipeline error", &msg));
                return Err(e);
            }
        };

        let mut design_prompt = design_prompt(&request);

        if request.web_search_enabled {
            if let Some(context) = self.fetch_enrichment(job, &request).await {
                design_prompt.push_str("\n\n");
                design_prompt.push_str(&context);
            }
        }

        let wrapped = design_step_prompt(&design_prompt);

        let design = loop {
            match self
                .generate_in_conversation(job.id, Task::Utility, &wrapped, &request.attachments)
                .await
            {
                Ok(text) => break text,
                Err(e) => {
                    if job.can_retry() {
                        job.increment_retry();
                        job.reset_to_step(PipelineStep::Design);
                        job.status = JobStatus::Running;
                        self.fan.emit(
                            job,
                            "Design generation failed, retrying",
                            events::retry(job.retry_count, job.max_retries, job.can_retry(), &e.to_string()),
                        );
                        continue;
                    }
                    let msg = format!("Design generation failed: {e}");
                    job.set_error(&msg, None);
                    self.fan.emit(job, "Design generation failed", events::error("Pipeline error", &msg));
                    return Err(e.into());
                }
            }
        };

        job.design = design;
        self.fan.emit(job, "Design generated, advancing to source", events::stage("Design", "Generated", None));

        job.advance_step();
        Ok(())
    }

    /// Fetch the web-search context; failure produces an event and
    /// `None`, never an error.
    async fn fetch_enrichment(&self, job: &Job, request: &GenerationRequest) -> Option<String> {
        let query = request.web_search_query.as_deref().unwrap_or("").trim();
        if query.is_empty() {
            return None;
        }
        let enrichment = self.deps.enrichment.as_ref()?;

        let limit = self.config.search_result_limit.clamp(1, 5);
        let fetch = enrichment.search_context(query, limit);
        match tokio::time::timeout(self.config.enrichment_timeout, fetch).await {
            Ok(Ok(context)) => {
                self.fan.emit(
                    job,
                    "Web search completed, context added",
                    events::stage("WebSearch", "Completed", None),
                );
                Some(context)
            }
            Ok(Err(e)) => {
                self.fan.emit(
                    job,
                    "Web search failed, continuing without web context",
                    events::stage("WebSearch", "Failed", Some(json!({"error": e.to_string()}))),
                );
                None
            }
            Err(_) => {
                self.fan.emit(
                    job,
                    "Web search timed out, continuing without web context",
                    events::stage("WebSearch", "Failed", Some(json!({"error": "timeout"}))),
                );
                None
            }
        }
    }

    // ── Source-generation step ──────────────────────────────────────

    /// Generate the typeset source from the design and style block.
    pub async fn run_source(&self, job: &mut Job) -> Result<()> {
        self.fan.emit(job, "Generating source", events::stage("Source", "Generating", None));

        let request = match parse_request(job) {
            Ok(request) => request,
            Err(e) => {
                let msg = format!("Invalid request: {e}");
                job.set_error(&msg, None);
                self.fan.emit(job, "Source generation failed", events::error("Pipeline error", &msg));
                return Err(e);
            }
        };

        let style = self.deps.styles.resolve(request.style_name.as_deref()).await;
        let prompt = source_prompt(&job.design, &style);

        let source = loop {
            match self
                .generate_in_conversation(job.id, Task::Main, &prompt, &request.attachments)
                .await
            {
                Ok(text) => break sanitize_source(&text),
                Err(e) => {
                    if job.can_retry() {
                        job.increment_retry();
                        job.reset_to_step(PipelineStep::Source);
                        job.status = JobStatus::Running;
                        self.fan.emit(
                            job,
                            "Source generation failed, retrying",
                            events::retry(job.retry_count, job.max_retries, job.can_retry(), &e.to_string()),
                        );
                        continue;
                    }
                    let msg = format!("Source generation failed: {e}");
                    job.set_error(&msg, None);
                    self.fan.emit(job, "Source generation failed", events::error("Pipeline error", &msg));
                    return Err(e.into());
                }
            }
        };

        job.source = source;
        self.fan.emit(job, "Source generated, compiling PDF", events::stage("Source", "Generated", None));

        job.advance_step();
        Ok(())
    }

    // ── Compile step ────────────────────────────────────────────────

    /// Compile the source to a PDF in the output bucket.
    ///
    /// Compilation failures never auto-retry: they escalate to
    /// `waiting_manual` with the compiler log, and the operator picks
    /// approve / edit / fix.
    pub async fn run_compile(&self, job: &mut Job) -> Result<()> {
        self.fan.emit(job, "Compiling source to PDF", events::stage("Compile", "Compiling", None));

        if job.source.trim().is_empty() {
            let msg = "No source available for compilation";
            job.set_error(msg, None);
            self.fan.emit(job, "Compilation failed", events::error("Pipeline error", msg));
            return Err(crate::error::ControlError::InvalidRequest(msg.into()).into());
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.config.bucket_dir).await {
            let msg = format!("Failed to create bucket directory: {e}");
            job.set_error(&msg, None);
            self.fan.emit(job, "Compilation failed", events::error("Pipeline error", &msg));
            return Err(StoreError::io(self.config.bucket_dir.display().to_string(), e).into());
        }

        let metadata = json!({
            "generated": chrono::Utc::now().to_rfc3339(),
            "source": "pipeline",
        });
        self.write_audit_files(job, &metadata).await;
        job.metadata.insert("metadata".into(), metadata.clone());

        let source_filename = format!("{}.src", job.id);
        let pdf_filename = format!("{}.pdf", job.id);
        let output_path = self.config.bucket_dir.join(&pdf_filename);

        let compile = self
            .deps
            .typesetter
            .compile(&job.source, &source_filename, &output_path);
        let outcome = match tokio::time::timeout(self.config.compile_timeout, compile).await {
            Ok(outcome) => outcome,
            Err(_) => Err(crate::error::CompileFailure::new(format!(
                "Typesetter timed out after {}s",
                self.config.compile_timeout.as_secs()
            ))),
        };

        if let Err(failure) = outcome {
            // Park at the source review point: the operator's approve /
            // edit / fix all act on the source.
            job.current_step = PipelineStep::Source;
            job.error_log = Some(failure.log.clone());
            job.set_waiting_manual("Compilation failed - review required");
            self.fan.emit(
                job,
                "Compilation failed - review required",
                events::review_out(
                    "Compilation Failed",
                    &format!("```text\n{}\n```", failure.log),
                    job.id,
                    "source",
                    &["approve", "edit", "fix"],
                ),
            );
            return Err(failure.into());
        }

        let pdf_url = format!("/bucket/{pdf_filename}");
        job.set_completed(&pdf_url);

        self.fan.emit(
            job,
            "Compilation completed successfully",
            events::completed("Sheet generation completed", &pdf_url, metadata),
        );
        info!(job = %job.id, url = %pdf_url, "Job completed");

        Ok(())
    }

    /// Persist the source and metadata sidecar for audit/debugging.
    /// Best effort — a failure here never fails the compile step.
    async fn write_audit_files(&self, job: &Job, metadata: &serde_json::Value) {
        let audit_dir: PathBuf = self.config.generated_dir.join(job.id.to_string());
        if let Err(e) = tokio::fs::create_dir_all(&audit_dir).await {
            warn!(job = %job.id, error = %e, "Failed to create audit directory");
            return;
        }

        let src_path = audit_dir.join(format!("{}.src", job.id));
        if let Err(e) = tokio::fs::write(&src_path, &job.source).await {
            warn!(job = %job.id, error = %e, "Failed to write audit source");
        }

        let meta_path = audit_dir.join(format!("{}.meta.json", job.id));
        match serde_json::to_vec_pretty(metadata) {
            Ok(data) => {
                if let Err(e) = tokio::fs::write(&meta_path, data).await {
                    warn!(job = %job.id, error = %e, "Failed to write audit metadata");
                }
            }
            Err(e) => warn!(job = %job.id, error = %e, "Failed to serialize audit metadata"),
        }
    }

    // ── Conversation helpers (used by control operations too) ───────

    /// Ask the utility model to repair a source that failed to compile.
    ///
    /// Appends the exchange to the job's conversation and returns the
    /// sanitized corrected source. Does not touch job state.
    pub async fn fix_source(&self, job_id: Uuid, source: &str, error_log: &str) -> Result<String> {
        let prompt = fix_prompt(source, error_log);
        let fixed = self
            .generate_in_conversation(job_id, Task::Utility, &prompt, &[])
            .await?;
        Ok(sanitize_source(&fixed))
    }

    /// Refine an existing design from operator feedback.
    pub async fn refine_design(
        &self,
        job_id: Uuid,
        refinement: &str,
        current_design: &str,
    ) -> Result<String> {
        let prompt = format!(
            "Refine the design based on this feedback: {refinement}\n\nCurrent design:\n{current_design}"
        );
        let refined = self
            .generate_in_conversation(job_id, Task::Utility, &prompt, &[])
            .await?;
        Ok(refined)
    }

    /// One-shot: a brief 1-2 sentence description of a request.
    pub async fn describe_request(&self, prompt: &str) -> Result<String> {
        let messages = vec![
            ChatMessage::system(
                "You are a concise description generator. Output only a brief 1-2 sentence description.",
            ),
            ChatMessage::user(format!(
                "Create a brief description for this worksheet request: {prompt}"
            )),
        ];
        Ok(self.generate_timed(Task::Utility, &messages, &[]).await?)
    }

    /// One-shot: 3-5 tags for a request, split and trimmed.
    pub async fn suggest_tags(&self, prompt: &str) -> Result<Vec<String>> {
        let messages = vec![
            ChatMessage::system("You are a tag generator. Output only comma-separated tags, no explanations."),
            ChatMessage::user(format!("Generate 3-5 relevant tags for this worksheet: {prompt}")),
        ];
        let raw = self.generate_timed(Task::Utility, &messages, &[]).await?;
        Ok(raw
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect())
    }

    /// Append a user message to the job's conversation, run generation
    /// over the full history, and append the assistant reply.
    ///
    /// The conversation is reloaded per attempt, so a failed call
    /// leaves no dangling user message behind. Conversation persistence
    /// is best effort: the thread is context, not an artifact, and a
    /// store hiccup must not fail the generation.
    async fn generate_in_conversation(
        &self,
        job_id: Uuid,
        task: Task,
        prompt: &str,
        attachments: &[Attachment],
    ) -> std::result::Result<String, GenerateError> {
        let mut conv = match self.store.conversation_by_job(job_id).await {
            Ok(conv) => conv,
            Err(e) => {
                if !matches!(e, StoreError::NotFound { .. }) {
                    warn!(job = %job_id, error = %e, "Failed to load conversation, starting fresh");
                }
                Conversation::new(job_id)
            }
        };

        conv.add_message(Role::User, prompt);
        let messages = build_messages(&conv);

        let reply = self.generate_timed(task, &messages, attachments).await?;

        conv.add_message(Role::Assistant, &reply);
        if let Err(e) = self.store.save_conversation(&conv).await {
            warn!(job = %job_id, error = %e, "Failed to persist conversation");
        }
        Ok(reply)
    }

    async fn generate_timed(
        &self,
        task: Task,
        messages: &[ChatMessage],
        attachments: &[Attachment],
    ) -> std::result::Result<String, GenerateError> {
        let call = async {
            if attachments.is_empty() {
                self.deps.llm.generate(task, messages).await
            } else {
                self.deps
                    .llm
                    .generate_with_attachments(task, messages, attachments)
                    .await
            }
        };
        match tokio::time::timeout(self.config.generation_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GenerateError::Timeout {
                seconds: self.config.generation_timeout.as_secs(),
            }),
        }
    }
}

// ── Prompt construction ─────────────────────────────────────────────

/// Parse the serialized request out of `job.prompt`.
pub fn parse_request(job: &Job) -> Result<GenerationRequest> {
    serde_json::from_str(&job.prompt)
        .map_err(|e| Error::Control(crate::error::ControlError::InvalidRequest(e.to_string())))
}

/// The composite design prompt: request fields, mode instructions, and
/// attachment context.
pub fn design_prompt(request: &GenerationRequest) -> String {
    format!(
        "Subject: {}\nCourse: {}\nDescription: {}\nTags: {}\nCurriculum: {}\nSpecial Instructions: {}\n\nGeneration Mode: {}\n{}\n\nAdditional Context:\n{}",
        request.subject,
        request.course,
        request.description,
        request.tags.join(", "),
        request.curriculum,
        request.special_instructions,
        request.mode,
        request.mode.instructions(),
        request.attachment_context(),
    )
}

/// Wrap the design prompt in the step's instruction frame.
fn design_step_prompt(design_prompt: &str) -> String {
    format!(
        "Create a detailed design specification for an educational worksheet based on this request:\n\n\
         {design_prompt}\n\n\
         Output a structured design that includes:\n\
         - Document type and purpose\n\
         - Content sections and topics\n\
         - Question types and difficulty levels\n\
         - Layout and formatting requirements\n\
         - Any special requirements\n\n\
         Be specific and detailed. This design will be used to generate the typeset source."
    )
}

/// The source-generation prompt: design, style block, constraint list.
fn source_prompt(design: &str, style: &str) -> String {
    format!(
        "Generate the typeset source for the following design.\n\n\
         Design:\n{design}\n\n\
         Visual Style (apply these definitions in the source):\n{style}\n\n\
         Constraints:\n\
         - Must be compilable by the typesetter\n\
         - No external assets\n\
         - No placeholders\n\
         - No TODOs\n\
         - Use only standard packages\n\
         - Output ONLY the source, no explanations\n\
         - Do not wrap in markdown code blocks\n\n\
         If uncertain, choose the simplest valid option."
    )
}

/// The repair prompt handed to the utility model after a compile failure.
fn fix_prompt(source: &str, error_log: &str) -> String {
    format!(
        "The following typeset source failed to compile.\n\n\
         Source:\n{source}\n\n\
         Error Log:\n{error_log}\n\n\
         Fix the source to resolve the compilation error.\n\n\
         Rules:\n\
         - Output ONLY the corrected source\n\
         - Do not explain what you changed\n\
         - Do not include markdown code blocks\n\
         - Preserve the original content and structure as much as possible\n\
         - Only fix what is necessary to make it compile\n\n\
         Output the complete corrected source:"
    )
}

/// Build the message array for a generation call: the fixed system
/// prompt followed by the conversation history (system messages from
/// the stored thread are skipped — the engine prompt is canonical).
pub fn build_messages(conv: &Conversation) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT)];
    for msg in &conv.messages {
        if msg.role != Role::System {
            messages.push(ChatMessage {
                role: msg.role,
                content: msg.content.clone(),
            });
        }
    }
    messages
}

/// Strip markdown fencing artifacts from a generated source and trim.
pub fn sanitize_source(raw: &str) -> String {
    let mut s = raw.trim();
    for prefix in ["```latex\n", "```latex", "```\n", "```"] {
        if let Some(rest) = s.strip_prefix(prefix) {
            s = rest;
            break;
        }
    }
    for suffix in ["\n```", "```"] {
        if let Some(rest) = s.strip_suffix(suffix) {
            s = rest;
            break;
        }
    }
    s.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Mode;

    fn request() -> GenerationRequest {
        GenerationRequest {
            subject: "Algebra".into(),
            course: "Linear Equations".into(),
            description: "short diagnostic".into(),
            tags: vec!["algebra".into(), "linear".into()],
            curriculum: "IB".into(),
            special_instructions: "show working".into(),
            visibility: "private".into(),
            style_name: None,
            mode: Mode::PrepTest,
            web_search_query: None,
            web_search_enabled: false,
            attachments: vec![],
        }
    }

    #[test]
    fn sanitize_strips_latex_fences() {
        assert_eq!(
            sanitize_source("```latex\n\\documentclass{article}\n```"),
            "\\documentclass{article}"
        );
    }

    #[test]
    fn sanitize_strips_bare_fences() {
        assert_eq!(sanitize_source("```\nhello\n```"), "hello");
        assert_eq!(sanitize_source("```hello```"), "hello");
    }

    #[test]
    fn sanitize_trims_whitespace() {
        assert_eq!(sanitize_source("  \n\\section{A}\n  "), "\\section{A}");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let inputs = [
            "```latex\n\\documentclass{article}\n```",
            "```\nplain\n```",
            "no fences at all",
            "   padded   ",
            "",
        ];
        for input in inputs {
            let once = sanitize_source(input);
            assert_eq!(sanitize_source(&once), once, "input: {input:?}");
        }
    }

    #[test]
    fn design_prompt_contains_request_fields_and_mode() {
        let prompt = design_prompt(&request());
        assert!(prompt.contains("Subject: Algebra"));
        assert!(prompt.contains("Tags: algebra, linear"));
        assert!(prompt.contains("Generation Mode: prep-test"));
        assert!(prompt.contains("MODE: PREP TEST"));
        assert!(prompt.contains("Additional Context:\n(none)"));
    }

    #[test]
    fn source_prompt_contains_design_style_and_constraints() {
        let prompt = source_prompt("two sections of drills", "\\usepackage{xcolor}");
        assert!(prompt.contains("two sections of drills"));
        assert!(prompt.contains("\\usepackage{xcolor}"));
        assert!(prompt.contains("No placeholders"));
        assert!(prompt.contains("Do not wrap in markdown code blocks"));
    }

    #[test]
    fn fix_prompt_embeds_source_and_log() {
        let prompt = fix_prompt("\\bad{", "! Missing } inserted");
        assert!(prompt.contains("\\bad{"));
        assert!(prompt.contains("! Missing } inserted"));
        assert!(prompt.contains("Only fix what is necessary"));
    }

    #[test]
    fn build_messages_prefixes_system_prompt() {
        let mut conv = Conversation::new(Uuid::new_v4());
        conv.add_message(Role::System, "stored system message, skipped");
        conv.add_message(Role::User, "make a worksheet");
        conv.add_message(Role::Assistant, "design v1");

        let messages = build_messages(&conv);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, SYSTEM_PROMPT);
        assert_eq!(messages[1].content, "make a worksheet");
        assert_eq!(messages[2].role, Role::Assistant);
    }

    #[test]
    fn parse_request_rejects_garbage() {
        let mut job = Job::new("alice", "not json", 3);
        assert!(parse_request(&job).is_err());
        job.prompt = serde_json::to_string(&request()).unwrap();
        assert!(parse_request(&job).is_ok());
    }
}
