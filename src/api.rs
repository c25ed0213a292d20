use crate::error::ChatError;
use crate::json::JsonValue;
use crate::models::{ChatMessage, Role, ToolCall};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;

// Alias for the raw body stream a provider hands back
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ChatError>> + Send>>;

// Trait defining the interface to an Ollama-compatible server
#[async_trait]
pub trait ChatProvider: Send + Sync {
    // Opens `POST /api/chat` and returns the undecoded response body.
    async fn open_chat_stream(&self, request: &ChatRequest) -> Result<ByteStream, ChatError>;

    async fn list_models(&self) -> Result<Vec<ModelSummary>, ChatError>;

    async fn show_model(&self, model: &str) -> Result<ModelDetails, ChatError>;

    async fn version(&self) -> Result<String, ChatError>;
}

// --- Wire types ---

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<RequestMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub think: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<ChatOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<JsonValue>>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RequestMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_duration: Option<u64>,
}

impl From<&ChatMessage> for RequestMessage {
    fn from(message: &ChatMessage) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
            thinking: message.thinking.clone().filter(|t| !t.is_empty()),
            images: message.images.clone(),
            tool_calls: message.tool_calls.clone(),
            tool_name: message.tool_name.clone(),
            created_at: message.created_at.clone(),
            total_duration: message.total_duration,
            eval_count: message.eval_count,
            eval_duration: message.eval_duration,
        }
    }
}

/// Sampling options in the provider's `options` schema.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_ctx: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<i32>,
}

/// One decoded object of a chat response.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ChatResponseChunk {
    #[serde(default)]
    pub model: String,
    pub created_at: Option<String>,
    pub message: Option<ResponseMessage>,
    #[serde(default)]
    pub done: bool,
    pub done_reason: Option<String>,
    // Cumulative counters, only meaningful on the terminal chunk
    pub total_duration: Option<u64>,
    pub load_duration: Option<u64>,
    pub prompt_eval_count: Option<u64>,
    pub prompt_eval_duration: Option<u64>,
    pub eval_count: Option<u64>,
    pub eval_duration: Option<u64>,
    // Set instead of everything else when the server fails mid-stream
    pub error: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ResponseMessage {
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub content: String,
    pub thinking: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub images: Option<Vec<String>>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ModelSummary {
    pub name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub size: u64,
    pub modified_at: Option<String>,
    pub digest: Option<String>,
    pub details: Option<JsonValue>,
}

#[derive(Deserialize, Debug)]
struct ModelListResponse {
    #[serde(default)]
    models: Vec<ModelSummary>,
}

/// Response of `POST /api/show`.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ModelDetails {
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub model_info: BTreeMap<String, JsonValue>,
    pub template: Option<String>,
    pub parameters: Option<String>,
    pub license: Option<String>,
    pub details: Option<JsonValue>,
}

impl ModelDetails {
    /// Reads `<architecture>.context_length` from `model_info`, whatever the architecture.
    pub fn context_length(&self) -> Option<u32> {
        self.model_info
            .iter()
            .find(|(key, _)| key.ends_with(".context_length"))
            .and_then(|(_, value)| value.as_i64())
            .and_then(|n| u32::try_from(n).ok())
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c == name)
    }
}

#[derive(Deserialize, Debug)]
struct VersionResponse {
    version: String,
}

#[derive(Serialize, Debug)]
struct ShowRequest<'a> {
    model: &'a str,
}

// --- Ollama HTTP Provider Implementation ---

pub struct OllamaProvider {
    client: Client,
    base_url: String,
}

impl OllamaProvider {
    pub fn new(base_url: &str, connect_timeout: Option<Duration>) -> Result<Self, ChatError> {
        let mut builder = Client::builder();
        if let Some(timeout) = connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ChatError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<Failed to read error body>".to_string());
        log::error!("Ollama request failed with status {}: {}", status, body);
        Err(ChatError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ChatProvider for OllamaProvider {
    async fn open_chat_stream(&self, request: &ChatRequest) -> Result<ByteStream, ChatError> {
        // Serialize up front so a bad request never reaches the network
        let body = serde_json::to_vec(request)?;
        let request_url = self.url("/api/chat");
        log::info!(
            "Sending chat request to {} using model: {} (stream: {})",
            request_url,
            request.model,
            request.stream
        );

        let response = self
            .client
            .post(&request_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        let byte_stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(ChatError::from));
        Ok(Box::pin(byte_stream))
    }

    async fn list_models(&self) -> Result<Vec<ModelSummary>, ChatError> {
        let response = self.client.get(self.url("/api/tags")).send().await?;
        let response = Self::check_status(response).await?;
        let list: ModelListResponse = response.json().await?;
        log::debug!("Server reported {} models", list.models.len());
        Ok(list.models)
    }

    async fn show_model(&self, model: &str) -> Result<ModelDetails, ChatError> {
        let response = self
            .client
            .post(self.url("/api/show"))
            .json(&ShowRequest { model })
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn version(&self) -> Result<String, ChatError> {
        let response = self.client.get(self.url("/api/version")).send().await?;
        let response = Self::check_status(response).await?;
        let version: VersionResponse = response.json().await?;
        Ok(version.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn request_omits_unset_fields() {
        let request = ChatRequest {
            model: "demo:1b".into(),
            messages: vec![RequestMessage::from(&ChatMessage::new(Role::User, "Hello"))],
            stream: true,
            think: None,
            options: None,
            tools: None,
        };
        let value: serde_json::Value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["model"], "demo:1b");
        assert_eq!(value["stream"], true);
        assert!(value.get("think").is_none());
        assert!(value.get("options").is_none());
        assert_eq!(value["messages"][0]["role"], "user");
        assert_eq!(value["messages"][0]["content"], "Hello");
        assert!(value["messages"][0].get("thinking").is_none());
    }

    #[test]
    fn decodes_terminal_chunk() {
        let chunk: ChatResponseChunk = serde_json::from_str(
            r#"{"model":"demo:1b","created_at":"2025-01-01T00:00:00Z","message":{"role":"assistant","content":""},"done":true,"done_reason":"stop","total_duration":500000000,"eval_count":42,"eval_duration":200000000}"#,
        )
        .unwrap();
        assert!(chunk.done);
        assert_eq!(chunk.eval_count, Some(42));
        assert_eq!(chunk.total_duration, Some(500_000_000));
        assert_eq!(chunk.done_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn decodes_minimal_chunk() {
        let chunk: ChatResponseChunk =
            serde_json::from_str(r#"{"message":{"content":"Hi"},"done":false}"#).unwrap();
        let message = chunk.message.unwrap();
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.content, "Hi");
        assert_eq!(message.thinking, None);
    }

    #[test]
    fn decodes_tool_calls() {
        let chunk: ChatResponseChunk = serde_json::from_str(
            r#"{"message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"get_weather","arguments":{"city":"Tokyo"}}}]},"done":false}"#,
        )
        .unwrap();
        let calls = chunk.message.unwrap().tool_calls.unwrap();
        assert_eq!(calls[0].function.name, "get_weather");
        assert_eq!(
            calls[0].function.arguments.get("city").and_then(JsonValue::as_str),
            Some("Tokyo")
        );
    }

    #[test]
    fn reads_context_length_for_any_architecture() {
        let details: ModelDetails = serde_json::from_str(
            r#"{"capabilities":["completion","thinking"],"model_info":{"general.architecture":"qwen3","qwen3.context_length":40960}}"#,
        )
        .unwrap();
        assert_eq!(details.context_length(), Some(40960));
        assert!(details.has_capability("thinking"));
        assert!(!details.has_capability("vision"));
    }
}
