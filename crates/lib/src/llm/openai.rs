//! OpenAI-compatible client (`/chat/completions`): OpenAI, Groq, LM Studio and friends.

use crate::llm::{ChatMessage, LlmError, LlmGateway};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL_FALLBACK: &str = "gpt-4o-mini";

/// Client for an OpenAI-compatible endpoint, bound to one model and temperature.
#[derive(Clone)]
pub struct OpenAiClient {
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: Option<f32>,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(
        base_url: Option<String>,
        api_key: Option<String>,
        model: Option<String>,
        temperature: Option<f32>,
    ) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let model = model
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL_FALLBACK.to_string());
        Self {
            base_url,
            api_key,
            model,
            temperature,
            client: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// POST /chat/completions, non-streaming.
    async fn chat(&self, messages: &[ChatMessage]) -> Result<OpenAiChatResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = OpenAiChatRequest {
            model: &self.model,
            messages,
            stream: false,
            temperature: self.temperature,
        };
        let mut req = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        let res = req.send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("{} {}", status, body)));
        }
        Ok(res.json().await?)
    }
}

#[async_trait]
impl LlmGateway for OpenAiClient {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let data = self.chat(messages).await?;
        let text = data.first_content().trim();
        if text.is_empty() {
            return Err(LlmError::Empty);
        }
        Ok(text.to_string())
    }
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: Option<OpenAiResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiChatResponse {
    fn first_content(&self) -> &str {
        self.choices
            .first()
            .and_then(|c| c.message.as_ref())
            .and_then(|m| m.content.as_deref())
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_choice_content_is_used() {
        let data: OpenAiChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"one"}},{"message":{"content":"two"}}]}"#,
        )
        .unwrap();
        assert_eq!(data.first_content(), "one");
    }

    #[test]
    fn missing_choices_read_as_empty() {
        let data: OpenAiChatResponse = serde_json::from_str(r#"{"id":"x"}"#).unwrap();
        assert_eq!(data.first_content(), "");
        let null_content: OpenAiChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":null}}]}"#).unwrap();
        assert_eq!(null_content.first_content(), "");
    }

    #[test]
    fn request_serializes_temperature_when_set() {
        let messages = vec![ChatMessage::system("s"), ChatMessage::user("u")];
        let body = OpenAiChatRequest {
            model: "m",
            messages: &messages,
            stream: false,
            temperature: Some(0.5),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["temperature"], 0.5);
        assert_eq!(json["messages"][1]["content"], "u");
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let c = OpenAiClient::new(Some("https://api.groq.com/openai/v1/".to_string()), None, None, None);
        assert_eq!(c.base_url, "https://api.groq.com/openai/v1");
        assert_eq!(c.model(), DEFAULT_MODEL_FALLBACK);
    }
}
