//! Model/tool loop collaborator.
//!
//! The orchestrator only needs two operations from the model layer: submit a
//! prompt and get the final answer, or submit a prompt and get the answer as a
//! stream of fragments. [`AgentClient`] is that seam; [`OpenAiAgent`] is the
//! production implementation.

pub mod openai;
pub mod types;

pub use openai::{AgentSettings, OpenAiAgent};

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("model request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("model API returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("model returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("model did not respond within {0}s")]
    Timeout(u64),

    #[error("model stream failed: {0}")]
    Stream(String),

    #[error("tool loop did not finish within {0} steps")]
    StepLimit(usize),
}

/// Incremental model output. Fragments arrive in upstream order.
pub type FragmentStream = BoxStream<'static, Result<String, AgentError>>;

/// One entry of the loop transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEntry {
    Assistant(String),
    ToolCall { name: String, arguments: String },
    ToolResult { name: String, output: String },
}

/// Output of one run of the model/tool loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentTurn {
    pub transcript: Vec<TranscriptEntry>,
}

impl AgentTurn {
    /// A turn consisting of a single assistant message.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            transcript: vec![TranscriptEntry::Assistant(text.into())],
        }
    }

    /// Text of the last assistant-authored message, or empty if there is none.
    pub fn final_text(&self) -> &str {
        self.transcript
            .iter()
            .rev()
            .find_map(|entry| match entry {
                TranscriptEntry::Assistant(text) => Some(text.as_str()),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn tool_invocations(&self) -> usize {
        self.transcript
            .iter()
            .filter(|entry| matches!(entry, TranscriptEntry::ToolCall { .. }))
            .count()
    }
}

/// A model runtime able to run the tool-calling loop for a prompt.
///
/// Implementations must be safe to call concurrently from independent requests.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn submit(&self, prompt: &str) -> Result<AgentTurn, AgentError>;

    async fn stream_submit(&self, prompt: &str) -> Result<FragmentStream, AgentError>;
}
