//! Text-generation contract.
//!
//! The pipeline never talks to a concrete AI backend; it calls a
//! [`TextGenerator`] trait object owned by the embedding layer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GenerateError;
use crate::request::Attachment;

/// Which model tier a generation call should use.
///
/// `Main` is the high-quality model reserved for source generation;
/// `Utility` is the fast model for designs, refinements, and fixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    Main,
    Utility,
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Main => write!(f, "main"),
            Self::Utility => write!(f, "utility"),
        }
    }
}

/// Speaker role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single message handed to the generation backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Attachment content above this length is cut before being inlined
/// into a prompt for backends without native attachment support.
const MAX_ATTACHMENT_PROMPT_CHARS: usize = 50_000;

/// Contract for the external text-generation service.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate a completion for the given message history.
    async fn generate(&self, task: Task, messages: &[ChatMessage]) -> Result<String, GenerateError>;

    /// Generate with file attachments.
    ///
    /// The default implementation inlines attachment content into the
    /// final user message as textual blocks, for backends that cannot
    /// accept files natively.
    async fn generate_with_attachments(
        &self,
        task: Task,
        messages: &[ChatMessage],
        attachments: &[Attachment],
    ) -> Result<String, GenerateError> {
        if attachments.is_empty() {
            return self.generate(task, messages).await;
        }

        let mut inlined: Vec<ChatMessage> = messages.to_vec();
        if let Some(last_user) = inlined.iter_mut().rev().find(|m| m.role == Role::User) {
            last_user.content =
                append_attachments_to_prompt(&last_user.content, attachments);
        }
        self.generate(task, &inlined).await
    }
}

/// Append attachment content as raw text blocks to a prompt.
pub fn append_attachments_to_prompt(prompt: &str, attachments: &[Attachment]) -> String {
    if attachments.is_empty() {
        return prompt.to_string();
    }

    let mut out = String::from(prompt);
    out.push_str("\n\n[Attachments]\n");

    for (i, att) in attachments.iter().enumerate() {
        if att.content.is_empty() {
            continue;
        }
        out.push_str(&format!(
            "\nAttachment {}: {} ({}, {} bytes, {})\n---\n",
            i + 1,
            att.name,
            att.mime_type,
            att.size,
            att.encoding,
        ));
        out.push_str(&truncate_chars(&att.content, MAX_ATTACHMENT_PROMPT_CHARS));
        out.push_str("\n---\n");
    }

    out
}

/// Cut `text` at `max` characters, marking the cut.
pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max).collect();
    cut.push_str("\n[TRUNCATED]");
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Encoding;

    fn attachment(content: &str) -> Attachment {
        Attachment {
            name: "notes.txt".into(),
            mime_type: "text/plain".into(),
            size: content.len() as u64,
            content: content.into(),
            encoding: Encoding::Utf8,
        }
    }

    #[test]
    fn inline_fallback_includes_header_and_content() {
        let out = append_attachments_to_prompt("base prompt", &[attachment("chapter one")]);
        assert!(out.starts_with("base prompt"));
        assert!(out.contains("[Attachments]"));
        assert!(out.contains("Attachment 1: notes.txt (text/plain, 11 bytes, utf-8)"));
        assert!(out.contains("chapter one"));
    }

    #[test]
    fn inline_fallback_skips_empty_content() {
        let out = append_attachments_to_prompt("p", &[attachment("")]);
        assert!(!out.contains("Attachment 1"));
    }

    #[test]
    fn truncate_preserves_prefix_verbatim() {
        let long = "x".repeat(60_000);
        let out = truncate_chars(&long, MAX_ATTACHMENT_PROMPT_CHARS);
        assert!(out.starts_with(&"x".repeat(MAX_ATTACHMENT_PROMPT_CHARS)));
        assert!(out.ends_with("[TRUNCATED]"));
    }

    #[test]
    fn truncate_is_noop_below_limit() {
        assert_eq!(truncate_chars("short", 100), "short");
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
    }
}
