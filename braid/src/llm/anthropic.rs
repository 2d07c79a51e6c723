//! Anthropic native adapter
//!
//! `/v1/messages` with `tool_use` / `tool_result` content blocks; the
//! system prompt is a top-level field rather than a message. Streaming is
//! SSE with typed events (`content_block_delta`, `message_delta`, ...).

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
    ToolCall, Usage,
};
use super::{LlmError, LlmProvider};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicProvider {
    name: String,
    model: String,
    api_key: String,
    base_url: String,
    http: reqwest::Client,
    max_retries: u32,
}

impl AnthropicProvider {
    pub fn new(
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
            api_key,
            base_url: config
                .api_base
                .clone()
                .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            http,
            max_retries: config.max_retries,
        })
    }

    fn build_body(&self, request: &CompletionRequest) -> Value {
        let model = request.model.as_deref().unwrap_or(&self.model);

        let mut system = String::new();
        let mut messages: Vec<Value> = Vec::new();
        for message in &request.messages {
            match message.role {
                Role::System => {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(&message.content);
                }
                Role::User => {
                    messages.push(json!({"role": "user", "content": message.content}));
                }
                Role::Tool => {
                    messages.push(json!({
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                            "content": message.content,
                        }],
                    }));
                }
                Role::Assistant => {
                    if message.tool_calls.is_empty() {
                        messages.push(json!({"role": "assistant", "content": message.content}));
                    } else {
                        let mut blocks: Vec<Value> = Vec::new();
                        if !message.content.is_empty() {
                            blocks.push(json!({"type": "text", "text": message.content}));
                        }
                        for tc in &message.tool_calls {
                            blocks.push(json!({
                                "type": "tool_use",
                                "id": tc.id,
                                "name": tc.name,
                                "input": tc.arguments,
                            }));
                        }
                        messages.push(json!({"role": "assistant", "content": blocks}));
                    }
                }
            }
        }

        let mut body = json!({
            "model": model,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": messages,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect(),
            );
        }
        body
    }

    fn request(&self, body: &Value) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
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
                warn!(provider = %self.name, attempt, "retrying after transient error");
                tokio::time::sleep(delay).await;
            }

            let response = match self.request(&body).send().await {
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

            let parsed: MessagesResponse = response.json().await.map_err(LlmError::Network)?;
            return Ok(parse_response(parsed));
        }

        Err(last_error.unwrap_or_else(|| LlmError::Parse("retries exhausted".to_string())))
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        sink: mpsc::Sender<String>,
    ) -> Result<CompletionResponse, LlmError> {
        let mut body = self.build_body(&request);
        body["stream"] = json!(true);

        let response = self.request(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::Network(e)
            }
        })?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status, text));
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut id = String::new();
        let mut content = String::new();
        let mut usage = Usage::default();
        // index -> (id, name, accumulated input json)
        let mut blocks: std::collections::HashMap<usize, (String, String, String)> =
            std::collections::HashMap::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(LlmError::Network)?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(line_end) = buffer.find('\n') {
                let line = buffer[..line_end].trim().to_string();
                buffer = buffer[line_end + 1..].to_string();

                let data = match line.strip_prefix("data: ") {
                    Some(d) => d,
                    None => continue,
                };
                let event: StreamEvent = match serde_json::from_str(data) {
                    Ok(e) => e,
                    Err(e) => {
                        debug!(error = %e, "skipping unparseable SSE event");
                        continue;
                    }
                };

                match event.kind.as_str() {
                    "message_start" => {
                        if let Some(message) = event.message {
                            id = message.id;
                            usage.prompt_tokens = message.usage.map(|u| u.input_tokens).unwrap_or(0);
                        }
                    }
                    "content_block_start" => {
                        if let (Some(index), Some(block)) = (event.index, event.content_block) {
                            if block.kind == "tool_use" {
                                blocks.insert(
                                    index,
                                    (
                                        block.id.unwrap_or_default(),
                                        block.name.unwrap_or_default(),
                                        String::new(),
                                    ),
                                );
                            }
                        }
                    }
                    "content_block_delta" => {
                        if let Some(delta) = event.delta {
                            if let Some(text) = delta.text {
                                content.push_str(&text);
                                let _ = sink.send(text).await;
                            }
                            if let Some(partial) = delta.partial_json {
                                if let Some(index) = event.index {
                                    if let Some(entry) = blocks.get_mut(&index) {
                                        entry.2.push_str(&partial);
                                    }
                                }
                            }
                        }
                    }
                    "message_delta" => {
                        if let Some(u) = event.usage {
                            usage.completion_tokens = u.output_tokens.unwrap_or(0);
                        }
                    }
                    _ => {}
                }
            }
        }

        usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;

        let mut indices: Vec<usize> = blocks.keys().copied().collect();
        indices.sort_unstable();
        let tool_calls = indices
            .into_iter()
            .map(|i| {
                let (call_id, name, input) = blocks.remove(&i).unwrap();
                ToolCall {
                    id: call_id,
                    name,
                    arguments: serde_json::from_str(&input).unwrap_or_else(|_| json!({})),
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

    async fn embed(&self, _request: EmbeddingRequest) -> Result<EmbeddingResponse, LlmError> {
        Err(LlmError::Configuration(
            "anthropic_native has no embeddings endpoint".to_string(),
        ))
    }
}

fn parse_response(response: MessagesResponse) -> CompletionResponse {
    let mut content = String::new();
    let mut tool_calls = Vec::new();

    for block in response.content {
        match block.kind.as_str() {
            "text" => content.push_str(&block.text.unwrap_or_default()),
            "tool_use" => tool_calls.push(ToolCall {
                id: block.id.unwrap_or_default(),
                name: block.name.unwrap_or_default(),
                arguments: block.input.unwrap_or_else(|| json!({})),
                thought_signature: None,
            }),
            _ => {}
        }
    }

    let usage = response
        .usage
        .map(|u| {
            let prompt = u.input_tokens;
            let completion = u.output_tokens.unwrap_or(0);
            Usage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: prompt + completion,
            }
        })
        .unwrap_or_default();

    CompletionResponse {
        id: response.id,
        content,
        tool_calls,
        usage,
    }
}

// Wire types

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    id: String,
    content: Vec<ContentBlock>,
    usage: Option<MessagesUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
    id: Option<String>,
    name: Option<String>,
    input: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: u64,
    output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    kind: String,
    index: Option<usize>,
    message: Option<StreamMessage>,
    content_block: Option<StreamBlock>,
    delta: Option<StreamDelta>,
    usage: Option<StreamUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    id: String,
    usage: Option<StreamStartUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamStartUsage {
    #[serde(default)]
    input_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct StreamBlock {
    #[serde(rename = "type")]
    kind: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    text: Option<String>,
    partial_json: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    output_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> AnthropicProvider {
        AnthropicProvider {
            name: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            api_key: "key".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            http: reqwest::Client::new(),
            max_retries: 0,
        }
    }

    #[test]
    fn test_system_is_top_level() {
        let request = CompletionRequest {
            messages: vec![Message::system("be terse"), Message::user("hi")],
            ..Default::default()
        };
        let body = provider().build_body(&request);
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn test_tool_round_trip_blocks() {
        let request = CompletionRequest {
            messages: vec![
                Message::user("weather?"),
                Message::assistant_with_calls(
                    "",
                    vec![ToolCall {
                        id: "toolu_1".to_string(),
                        name: "weather".to_string(),
                        arguments: json!({"city": "Oslo"}),
                        thought_signature: None,
                    }],
                ),
                Message::tool("toolu_1", "rainy"),
            ],
            ..Default::default()
        };
        let body = provider().build_body(&request);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[1]["content"][0]["type"], "tool_use");
        assert_eq!(messages[2]["content"][0]["type"], "tool_result");
        assert_eq!(messages[2]["content"][0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn test_parse_tool_use_response() {
        let raw = json!({
            "id": "msg_1",
            "content": [
                {"type": "text", "text": "checking"},
                {"type": "tool_use", "id": "toolu_2", "name": "search", "input": {"q": "x"}}
            ],
            "usage": {"input_tokens": 7, "output_tokens": 3}
        });
        let parsed: MessagesResponse = serde_json::from_value(raw).unwrap();
        let response = parse_response(parsed);
        assert_eq!(response.content, "checking");
        assert_eq!(response.tool_calls[0].name, "search");
        assert_eq!(response.usage.total_tokens, 10);
    }
}
