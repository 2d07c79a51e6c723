//! OpenAI-compatible adapter
//!
//! Covers hosted openai_compatible providers and the local
//! ollama_native/lmstudio variant (same wire format, no auth). Streaming
//! uses SSE `data:` frames terminated by a `[DONE]` sentinel; usage
//! arrives in the final frame when the server reports it.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::ProviderConfig;

use super::retry::{backoff_delay, retry_after, BASE_DELAY};
use super::types::{
    CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, Message, Role,
    ToolCall, ToolSpec, Usage,
};
use super::{LlmError, LlmProvider};

pub struct OpenAiProvider {
    name: String,
    model: String,
    api_key: Option<String>,
    base_url: String,
    http: reqwest::Client,
    max_retries: u32,
}

impl OpenAiProvider {
    /// Hosted variant; an API key is required.
    pub fn hosted(
        name: &str,
        config: &ProviderConfig,
        http: reqwest::Client,
        model: String,
    ) -> Result<Self, LlmError> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            LlmError::Configuration(format!("provider '{}' requires api_key", name))
        })?;
        Ok(Self {
            name: name.to_string(),
            model,
            api_key: Some(api_key),
            base_url: config
                .api_base
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            http,
            max_retries: config.max_retries,
        })
    }

    /// Local server variant (Ollama, LM Studio): no auth.
    pub fn local(name: &str, config: &ProviderConfig, http: reqwest::Client, model: String) -> Self {
        Self {
            name: name.to_string(),
            model,
            api_key: None,
            base_url: config
                .api_base
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            http,
            max_retries: config.max_retries,
        }
    }

    fn request(&self, url: &str, body: &Value) -> reqwest::RequestBuilder {
        let mut builder = self.http.post(url).json(body);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }
        builder
    }

    fn build_body(&self, request: &CompletionRequest) -> Value {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let mut body = json!({
            "model": model,
            "messages": openai_messages(&request.messages),
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = request.max_tokens {
            body["max_tokens"] = json!(m);
        }
        if !request.tools.is_empty() {
            body["tools"] = openai_tools(&request.tools);
            body["tool_choice"] = json!(request.tool_choice.as_deref().unwrap_or("auto"));
        }
        body
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = self.build_body(&request);

        let mut last_error: Option<LlmError> = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = match &last_error {
                    Some(LlmError::RateLimited {
                        retry_after: Some(d),
                    }) => *d,
                    _ => backoff_delay(attempt, BASE_DELAY),
                };
                warn!(provider = %self.name, attempt, delay_ms = delay.as_millis() as u64, "retrying after transient error");
                tokio::time::sleep(delay).await;
            }

            let response = match self.request(&url, &body).send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(if e.is_timeout() {
                        LlmError::Timeout
                    } else {
                        LlmError::Network(e)
                    });
                    continue;
                }
            };

            let status = response.status().as_u16();
            if !response.status().is_success() {
                let after = retry_after(&response);
                let text = response.text().await.unwrap_or_default();
                let error = if status == 429 {
                    LlmError::RateLimited { retry_after: after }
                } else {
                    LlmError::from_status(status, text)
                };
                if error.is_retryable() && attempt < self.max_retries {
                    last_error = Some(error);
                    continue;
                }
                return Err(error);
            }

            let parsed: ChatResponse = response.json().await.map_err(LlmError::Network)?;
            return Ok(parse_chat_response(parsed));
        }

        Err(last_error.unwrap_or_else(|| LlmError::Parse("retries exhausted".to_string())))
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        sink: mpsc::Sender<String>,
    ) -> Result<CompletionResponse, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut body = self.build_body(&request);
        body["stream"] = json!(true);

        let response = self.request(&url, &body).send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::Network(e)
            }
        })?;
        consume_sse(response, &sink).await
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, LlmError> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let model = request.model.as_deref().unwrap_or(&self.model).to_string();
        let body = json!({
            "model": model,
            "input": request.inputs,
        });

        let response = self
            .request(&url, &body)
            .send()
            .await
            .map_err(LlmError::Network)?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status, text));
        }

        let parsed: EmbeddingsApiResponse = response.json().await.map_err(LlmError::Network)?;
        let mut data = parsed.data;
        data.sort_by_key(|d| d.index);
        let vectors: Vec<Vec<f32>> = data.into_iter().map(|d| d.embedding).collect();
        let dimensions = vectors.first().map(|v| v.len()).unwrap_or(0);

        Ok(EmbeddingResponse {
            model: parsed.model.unwrap_or(model),
            dimensions,
            vectors,
        })
    }
}

/// Drain an SSE chat-completions stream, forwarding content deltas and
/// assembling the final response. Shared with the Vertex adapter, whose
/// chat endpoint speaks the same format.
pub(crate) async fn consume_sse(
    response: reqwest::Response,
    sink: &mpsc::Sender<String>,
) -> Result<CompletionResponse, LlmError> {
    let status = response.status().as_u16();
    if !response.status().is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(LlmError::from_status(status, text));
    }

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut content = String::new();
    let mut id = String::new();
    let mut usage = Usage::default();
    // index -> (id, name, accumulated argument json)
    let mut partial_calls: std::collections::HashMap<usize, (String, String, String)> =
        std::collections::HashMap::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(LlmError::Network)?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(line_end) = buffer.find('\n') {
            let line = buffer[..line_end].trim().to_string();
            buffer = buffer[line_end + 1..].to_string();

            if line.is_empty() || line == "data: [DONE]" {
                continue;
            }
            let data = match line.strip_prefix("data: ") {
                Some(d) => d,
                None => continue,
            };
            let frame: StreamFrame = match serde_json::from_str(data) {
                Ok(f) => f,
                Err(e) => {
                    debug!(error = %e, "skipping unparseable SSE frame");
                    continue;
                }
            };

            if id.is_empty() {
                if let Some(frame_id) = frame.id {
                    id = frame_id;
                }
            }
            if let Some(u) = frame.usage {
                usage = u.into();
            }
            if let Some(choice) = frame.choices.into_iter().next() {
                if let Some(delta) = choice.delta.content {
                    content.push_str(&delta);
                    let _ = sink.send(delta).await;
                }
                for tc in choice.delta.tool_calls.unwrap_or_default() {
                    let entry = partial_calls
                        .entry(tc.index)
                        .or_insert_with(|| (String::new(), String::new(), String::new()));
                    if let Some(call_id) = tc.id {
                        entry.0 = call_id;
                    }
                    if let Some(function) = tc.function {
                        if let Some(name) = function.name {
                            entry.1 = name;
                        }
                        if let Some(args) = function.arguments {
                            entry.2.push_str(&args);
                        }
                    }
                }
            }
        }
    }

    let mut indices: Vec<usize> = partial_calls.keys().copied().collect();
    indices.sort_unstable();
    let tool_calls = indices
        .into_iter()
        .map(|i| {
            let (call_id, name, args) = partial_calls.remove(&i).unwrap();
            ToolCall {
                id: call_id,
                name,
                arguments: serde_json::from_str(&args).unwrap_or_else(|_| json!({})),
                thought_signature: None,
            }
        })
        .collect();

    Ok(CompletionResponse {
        id,
        content,
        tool_calls,
        usage,
    })
}

/// Convert internal messages to the OpenAI wire shape.
pub(crate) fn openai_messages(messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        match message.role {
            Role::System => out.push(json!({"role": "system", "content": message.content})),
            Role::User => out.push(json!({"role": "user", "content": message.content})),
            Role::Tool => out.push(json!({
                "role": "tool",
                "tool_call_id": message.tool_call_id.clone().unwrap_or_default(),
                "content": message.content,
            })),
            Role::Assistant => {
                if message.tool_calls.is_empty() {
                    out.push(json!({"role": "assistant", "content": message.content}));
                } else {
                    let calls: Vec<Value> = message
                        .tool_calls
                        .iter()
                        .map(|tc| {
                            json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": tc.arguments.to_string(),
                                },
                            })
                        })
                        .collect();
                    let mut msg = json!({"role": "assistant", "tool_calls": calls});
                    if !message.content.is_empty() {
                        msg["content"] = json!(message.content);
                    }
                    out.push(msg);
                }
            }
        }
    }
    out
}

pub(crate) fn openai_tools(tools: &[ToolSpec]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    },
                })
            })
            .collect(),
    )
}

pub(crate) fn parse_chat_response(response: ChatResponse) -> CompletionResponse {
    let choice = response.choices.into_iter().next();
    let (content, tool_calls) = match choice {
        Some(c) => {
            let tool_calls = c
                .message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|tc| ToolCall {
                    id: tc.id,
                    name: tc.function.name,
                    arguments: serde_json::from_str(&tc.function.arguments)
                        .unwrap_or_else(|_| json!({})),
                    thought_signature: None,
                })
                .collect();
            (c.message.content.unwrap_or_default(), tool_calls)
        }
        None => (String::new(), Vec::new()),
    };

    CompletionResponse {
        id: response.id.unwrap_or_default(),
        content,
        tool_calls,
        usage: response.usage.map(Usage::from).unwrap_or_default(),
    }
}

// Wire types

#[derive(Debug, Deserialize)]
pub(crate) struct ChatResponse {
    pub id: Option<String>,
    pub choices: Vec<ChatChoice>,
    pub usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatChoice {
    pub message: ChatMessage,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatMessage {
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiToolCall {
    pub id: String,
    pub function: ApiFunction,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Usage {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamFrame {
    id: Option<String>,
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    index: usize,
    id: Option<String>,
    function: Option<StreamFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsApiResponse {
    model: Option<String>,
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}
