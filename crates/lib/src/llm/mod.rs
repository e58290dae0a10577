//! LLM abstraction: the `LlmGateway` capability plus Ollama and OpenAI-compatible clients.
//!
//! The dialogue engine only sees `LlmGateway`: a list of role-tagged messages in, generated
//! text out. Clients are shared through the `ClientRegistry`.

mod ollama;
mod openai;
mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use ollama::OllamaClient;
pub use openai::OpenAiClient;
pub use registry::{ClientKey, ClientRegistry};

/// One role-tagged message ("system", "user" or "assistant").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("llm request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("llm api error: {0}")]
    Api(String),
    #[error("llm returned an empty reply")]
    Empty,
    #[error("llm call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Opaque text generation capability.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    /// Generate a reply for the given conversation. No streaming.
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, LlmError>;
}
