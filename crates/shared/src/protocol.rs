//! Types exchanged with the document question-answering service.
//!
//! Field names follow the service's JSON exactly; Rust-side names are only
//! changed where the wire name would be ambiguous (`source` -> `name`).

use serde::{Deserialize, Serialize};

/// A document that contributed to an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Display name, usually the file name.
    #[serde(rename = "source")]
    pub name: String,
    /// Path or identifier resolvable through `GET /files/{name}`.
    #[serde(rename = "path")]
    pub locator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
}

/// One decoded record of a `/chat/stream` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Sources(Vec<SourceDescriptor>),
    Token(String),
    Done,
    Error(String),
}

impl StreamEvent {
    /// `done` and `error` close the stream; nothing after them is consumed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error(_))
    }
}

/// Body of `POST /chat` and `POST /chat/stream`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

/// A retrieved chunk as returned by the non-streaming `POST /chat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Response of the non-streaming `POST /chat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatReply {
    pub answer: String,
    #[serde(default)]
    pub sources: Vec<RetrievedChunk>,
}

/// Entry of `GET /files/search`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    /// Upper-cased extension, e.g. `PDF`.
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileList {
    #[serde(default)]
    pub files: Vec<FileInfo>,
}

/// Plain `{"message": ...}` acknowledgement used by refresh/clear endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadDetails {
    pub filename: String,
    pub file_size: u64,
    pub text_length: u64,
    pub chunks_created: u64,
    pub embeddings_generated: u64,
}

/// Response of `POST /upload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub message: String,
    pub details: Option<UploadDetails>,
}

/// Error body the service attaches to non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    pub detail: serde_json::Value,
}

impl ErrorBody {
    pub fn text(&self) -> String {
        match &self.detail {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Who wrote a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A message as shown in the chat pane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    /// Append-only while the turn is streaming.
    pub content: String,
    /// Set at most once, before the first token.
    pub sources: Option<Vec<SourceDescriptor>>,
    /// True from creation until the first non-empty token.
    pub is_thinking: bool,
    pub timestamp: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            sources: None,
            is_thinking: false,
            timestamp: chrono::Local::now().format("%H:%M").to_string(),
        }
    }

    /// Placeholder for the answer that is about to stream in.
    pub fn assistant_placeholder() -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            sources: None,
            is_thinking: true,
            timestamp: chrono::Local::now().format("%H:%M").to_string(),
        }
    }
}
