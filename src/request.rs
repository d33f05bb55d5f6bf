//! The serialized worksheet request and its generation modes.

use serde::{Deserialize, Serialize};

use crate::llm::truncate_chars;

/// Per-attachment cap on how much content the design prompt inlines.
const MAX_ATTACHMENT_CONTEXT_CHARS: usize = 20_000;

/// How an attachment's `content` field is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Encoding {
    Utf8,
    Base64,
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Utf8 => write!(f, "utf-8"),
            Self::Base64 => write!(f, "base64"),
        }
    }
}

/// An uploaded file or extracted content passed along to generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub content: String,
    pub encoding: Encoding,
}

/// Generation mode — selects the fixed instruction block folded into the
/// design prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    #[default]
    Notes,
    PrepTest,
    SuperLazy,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Notes => write!(f, "notes"),
            Self::PrepTest => write!(f, "prep-test"),
            Self::SuperLazy => write!(f, "super-lazy"),
        }
    }
}

impl Mode {
    /// The fixed instruction block for this mode.
    pub fn instructions(self) -> &'static str {
        match self {
            Self::PrepTest => {
                "MODE: PREP TEST\n\
                 You are generating a practice test / exam paper.\n\n\
                 Requirements:\n\
                 - Create a complete test paper with clear sections\n\
                 - Include a mix of question types: multiple choice, short answer, long answer, and problem-solving\n\
                 - Vary difficulty: easy (30%), medium (50%), hard (20%)\n\
                 - Include point values for each question\n\
                 - Add a clear header with subject, course, date, and time limit\n\
                 - Include instructions section at the top\n\
                 - Add space for student name and ID\n\
                 - Provide an answer key section at the end\n\
                 - Make questions that genuinely test understanding, not just memorization\n\
                 - Include at least 15-25 questions depending on complexity\n\
                 - Group questions by topic or section\n\
                 - Use professional exam formatting"
            }
            Self::SuperLazy => {
                "MODE: SUPER LAZY\n\
                 You are generating a study document optimized for maximum retention with minimum effort.\n\n\
                 Requirements:\n\
                 - Use proven memory techniques: spaced repetition cues, mnemonics, chunking, and visual anchors\n\
                 - Structure content as KEY POINTS with bold highlights for critical terms\n\
                 - Use the \"explain like I'm 5\" approach for complex concepts\n\
                 - Include quick-fire summary boxes at the end of each section\n\
                 - Add \"Remember This\" callout boxes with memory tricks and acronyms\n\
                 - Use comparison tables to contrast similar concepts\n\
                 - Include a one-page \"cheat sheet\" summary at the end with EVERYTHING essential\n\
                 - Create \"If you only read ONE thing\" highlights per section\n\
                 - Use bullet points extensively, avoid long paragraphs\n\
                 - Add visual separators between concepts\n\
                 - Include practice recall prompts (\"Can you explain X without looking?\")\n\
                 - Make at least 4-5 pages of content\n\
                 - Design it so someone reading it the night before an exam WILL pass with excellence\n\
                 - Prioritize the 20% of content that covers 80% of what's tested\n\
                 - Use casual, engaging tone - not dry textbook language"
            }
            Self::Notes => {
                "MODE: NOTES\n\
                 You are generating comprehensive, professional study notes.\n\n\
                 Requirements:\n\
                 - Create at least 3 pages of thorough, well-structured notes\n\
                 - Use a clean, professional document design with clear hierarchy\n\
                 - Include numbered sections and subsections\n\
                 - Add definitions, theorems, and key concepts in highlighted boxes\n\
                 - Include worked examples where relevant\n\
                 - Use proper mathematical notation where applicable\n\
                 - Add summary points at the end of each major section\n\
                 - Include diagrams descriptions where they would help understanding\n\
                 - Use professional typography: proper headings, consistent spacing, clear fonts\n\
                 - Make it comprehensive enough to be a standalone study resource\n\
                 - Include a table of contents if content is substantial\n\
                 - Add page numbers and proper headers/footers"
            }
        }
    }
}

/// The worksheet request, serialized into `job.prompt` and echoed in
/// `metadata["request"]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub subject: String,
    pub course: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub curriculum: String,
    #[serde(default)]
    pub special_instructions: String,
    #[serde(default)]
    pub visibility: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style_name: Option<String>,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_search_query: Option<String>,
    #[serde(default)]
    pub web_search_enabled: bool,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl GenerationRequest {
    /// Validate the fields a request cannot do without.
    pub fn validate(&self) -> Result<(), String> {
        if self.subject.trim().is_empty() {
            return Err("subject is required".to_string());
        }
        if self.course.trim().is_empty() {
            return Err("course is required".to_string());
        }
        if self.description.trim().is_empty() {
            return Err("description is required".to_string());
        }
        Ok(())
    }

    /// Render the attachment context block for the design prompt.
    ///
    /// Each item gets an indexed header and its content cut at 20 000
    /// characters with a `[TRUNCATED]` marker.
    pub fn attachment_context(&self) -> String {
        if self.attachments.is_empty() {
            return "(none)".to_string();
        }

        let mut out = String::new();
        for (i, att) in self.attachments.iter().enumerate() {
            out.push_str(&format!(
                "[{}] {} ({}, {} bytes, {})\n",
                i + 1,
                att.name,
                att.mime_type,
                att.size,
                att.encoding,
            ));
            out.push_str(&truncate_chars(&att.content, MAX_ATTACHMENT_CONTEXT_CHARS));
            out.push_str("\n---\n");
        }
        out
    }
}
