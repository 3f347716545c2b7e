//! The ambient LLM collaborator interface: a provider-agnostic
//! `LlmClient` trait plus one concrete OpenAI-compatible HTTP
//! implementation. `warden-orchestrator` only ever depends on the
//! trait, so a different provider is a `Settings` choice, not a
//! recompile.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    fn as_wire_str(self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

/// Result of one `complete` call: text plus the token accounting the
/// Budget Manager needs.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model: String,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm transport error ({provider}): {source}")]
    Transport { provider: String, #[source] source: reqwest::Error },

    #[error("unexpected response from {provider}: {detail}")]
    UnexpectedResponse { provider: String, detail: String },
}

/// The collaborator interface named in spec §6: `complete` for a single
/// round-trip, `stream` for incremental chunks.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        system_prompt: Option<&str>,
    ) -> Result<CompletionResponse, LlmError>;

    async fn stream(
        &self,
        messages: &[ChatMessage],
        system_prompt: Option<&str>,
    ) -> Result<BoxStream<'static, Result<String, LlmError>>, LlmError>;
}

/// Reference `LlmClient` speaking the OpenAI-style `/chat/completions`
/// wire format, the same shape used by local gateways (an
/// OpenAI-compatible Ollama endpoint) and hosted providers alike.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self { http: reqwest::Client::new(), base_url: base_url.into(), model: model.into(), api_key }
    }

    fn messages_payload(&self, messages: &[ChatMessage], system_prompt: Option<&str>) -> serde_json::Value {
        let mut payload = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = system_prompt {
            payload.push(json!({"role": "system", "content": system}));
        }
        for message in messages {
            payload.push(json!({"role": message.role.as_wire_str(), "content": message.content}));
        }
        serde_json::Value::Array(payload)
    }

    fn request(&self, body: serde_json::Value) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut request = self.http.post(url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        request
    }

    fn provider_label(&self) -> String {
        self.model.clone()
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        system_prompt: Option<&str>,
    ) -> Result<CompletionResponse, LlmError> {
        let provider = self.provider_label();
        let body = json!({
            "model": self.model,
            "messages": self.messages_payload(messages, system_prompt),
        });

        let response = self
            .request(body)
            .send()
            .await
            .map_err(|e| LlmError::Transport { provider: provider.clone(), source: e })?;
        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Transport { provider: provider.clone(), source: e })?;

        if !status.is_success() {
            return Err(LlmError::UnexpectedResponse {
                provider,
                detail: format!("http {status}: {body}"),
            });
        }

        let text = body
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| LlmError::UnexpectedResponse {
                provider: provider.clone(),
                detail: "missing choices[0].message.content".to_string(),
            })?
            .to_string();
        let input_tokens = body.pointer("/usage/prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
        let output_tokens = body.pointer("/usage/completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0);

        Ok(CompletionResponse { text, input_tokens, output_tokens, model: self.model.clone() })
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        system_prompt: Option<&str>,
    ) -> Result<BoxStream<'static, Result<String, LlmError>>, LlmError> {
        let provider = self.provider_label();
        let mut body = json!({
            "model": self.model,
            "messages": self.messages_payload(messages, system_prompt),
        });
        body["stream"] = json!(true);

        let response = self
            .request(body)
            .send()
            .await
            .map_err(|e| LlmError::Transport { provider: provider.clone(), source: e })?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LlmError::UnexpectedResponse { provider, detail: format!("http {status}: {detail}") });
        }

        Ok(sse_content_stream(provider, response))
    }
}

/// Turns an OpenAI-style Server-Sent-Events response into a stream of
/// content chunks, parsing `data: {...}` lines and stopping on
/// `data: [DONE]`.
fn sse_content_stream(
    provider: String,
    response: reqwest::Response,
) -> BoxStream<'static, Result<String, LlmError>> {
    stream::try_unfold((response, String::new()), move |(mut response, mut buffer)| {
        let provider = provider.clone();
        async move {
            loop {
                if let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);

                    if line.is_empty() {
                        continue;
                    }
                    if line == "data: [DONE]" {
                        return Ok(None);
                    }
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let Ok(json) = serde_json::from_str::<serde_json::Value>(data) else {
                        continue;
                    };
                    if let Some(content) = json.pointer("/choices/0/delta/content").and_then(|v| v.as_str()) {
                        return Ok(Some((content.to_string(), (response, buffer))));
                    }
                    continue;
                }

                match response.chunk().await {
                    Ok(Some(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                    }
                    Ok(None) => return Ok(None),
                    Err(e) => return Err(LlmError::Transport { provider, source: e }),
                }
            }
        }
    })
    .boxed()
}
