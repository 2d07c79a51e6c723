//! Gemini native adapter
//!
//! Google Generative Language `generateContent` with content "parts".
//! Tool calls arrive as `functionCall` parts and results go back as
//! `functionResponse` parts; thought signatures on function calls are
//! preserved across tool rounds.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::ProviderConfig;

use super::retry::{backoff_delay, retry_after, BASE_DELAY};
use super::types::{
    CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, Message, Role,
    ToolCall, Usage,
};
use super::{LlmError, LlmProvider};

pub struct GeminiProvider {
    name: String,
    model: String,
    api_key: String,
    base_url: String,
    http: reqwest::Client,
    max_retries: u32,
}

impl GeminiProvider {
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
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".to_string()),
            http,
            max_retries: config.max_retries,
        })
    }

    fn build_body(&self, request: &CompletionRequest) -> Value {
        let mut system = String::new();
        let mut contents: Vec<Value> = Vec::new();
        // functionResponse parts are matched by function name, so track
        // call id -> name from earlier assistant turns.
        let mut call_names: std::collections::HashMap<String, String> =
            std::collections::HashMap::new();

        for message in &request.messages {
            for tc in &message.tool_calls {
                call_names.insert(tc.id.clone(), tc.name.clone());
            }
            match message.role {
                Role::System => {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(&message.content);
                }
                Role::User => contents.push(json!({
                    "role": "user",
                    "parts": [{"text": message.content}],
                })),
                Role::Tool => {
                    let call_id = message.tool_call_id.clone().unwrap_or_default();
                    let name = call_names.get(&call_id).cloned().unwrap_or(call_id);
                    contents.push(json!({
                        "role": "user",
                        "parts": [{
                            "functionResponse": {
                                "name": name,
                                "response": {"result": message.content},
                            },
                        }],
                    }));
                }
                Role::Assistant => {
                    let mut parts: Vec<Value> = Vec::new();
                    if !message.content.is_empty() {
                        parts.push(json!({"text": message.content}));
                    }
                    for tc in &message.tool_calls {
                        let mut part = json!({
                            "functionCall": {"name": tc.name, "args": tc.arguments},
                        });
                        if let Some(sig) = &tc.thought_signature {
                            part["thoughtSignature"] = json!(sig);
                        }
                        parts.push(part);
                    }
                    contents.push(json!({"role": "model", "parts": parts}));
                }
            }
        }

        let mut body = json!({"contents": contents});
        if !system.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        if !request.tools.is_empty() {
            let declarations: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!([{"functionDeclarations": declarations}]);
        }
        let mut generation = serde_json::Map::new();
        if let Some(t) = request.temperature {
            generation.insert("temperature".to_string(), json!(t));
        }
        if let Some(m) = request.max_tokens {
            generation.insert("maxOutputTokens".to_string(), json!(m));
        }
        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }
        body
    }

    fn url(&self, request: &CompletionRequest, verb: &str) -> String {
        let model = request.model.as_deref().unwrap_or(&self.model);
        format!(
            "{}/v1beta/models/{}:{}?key={}",
            self.base_url, model, verb, self.api_key
        )
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let url = self.url(&request, "generateContent");
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

            let response = match self.http.post(&url).json(&body).send().await {
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

            let parsed: GenerateResponse = response.json().await.map_err(LlmError::Network)?;
            return Ok(parse_response(parsed));
        }

        Err(last_error.unwrap_or_else(|| LlmError::Parse("retries exhausted".to_string())))
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        sink: mpsc::Sender<String>,
    ) -> Result<CompletionResponse, LlmError> {
        let url = format!("{}&alt=sse", self.url(&request, "streamGenerateContent"));
        let body = self.build_body(&request);

        let response = self.http.post(&url).json(&body).send().await.map_err(|e| {
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
        let mut content = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut usage = Usage::default();

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
                let frame: GenerateResponse = match serde_json::from_str(data) {
                    Ok(f) => f,
                    Err(_) => continue,
                };
                let partial = parse_response(frame);
                if !partial.content.is_empty() {
                    content.push_str(&partial.content);
                    let _ = sink.send(partial.content).await;
                }
                tool_calls.extend(partial.tool_calls);
                if partial.usage.total_tokens > 0 {
                    usage = partial.usage;
                }
            }
        }

        // Re-number synthesized ids across frames
        for (i, tc) in tool_calls.iter_mut().enumerate() {
            tc.id = format!("call_{}", i);
        }

        Ok(CompletionResponse {
            id: String::new(),
            content,
            tool_calls,
            usage,
        })
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, LlmError> {
        let model = request.model.as_deref().unwrap_or(&self.model).to_string();
        let url = format!(
            "{}/v1beta/models/{}:batchEmbedContents?key={}",
            self.base_url, model, self.api_key
        );
        let requests: Vec<Value> = request
            .inputs
            .iter()
            .map(|text| {
                json!({
                    "model": format!("models/{}", model),
                    "content": {"parts": [{"text": text}]},
                })
            })
            .collect();

        let response = self
            .http
            .post(&url)
            .json(&json!({"requests": requests}))
            .send()
            .await
            .map_err(LlmError::Network)?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status, text));
        }

        let parsed: BatchEmbedResponse = response.json().await.map_err(LlmError::Network)?;
        let vectors: Vec<Vec<f32>> = parsed.embeddings.into_iter().map(|e| e.values).collect();
        let dimensions = vectors.first().map(|v| v.len()).unwrap_or(0);

        Ok(EmbeddingResponse {
            model,
            dimensions,
            vectors,
        })
    }
}

fn parse_response(response: GenerateResponse) -> CompletionResponse {
    let mut content = String::new();
    let mut tool_calls = Vec::new();

    if let Some(candidate) = response.candidates.into_iter().next() {
        if let Some(parts) = candidate.content.map(|c| c.parts) {
            for part in parts {
                if let Some(text) = part.text {
                    content.push_str(&text);
                }
                if let Some(call) = part.function_call {
                    tool_calls.push(ToolCall {
                        id: format!("call_{}", tool_calls.len()),
                        name: call.name,
                        arguments: call.args.unwrap_or_else(|| json!({})),
                        thought_signature: part.thought_signature,
                    });
                }
            }
        }
    }

    let usage = response
        .usage_metadata
        .map(|u| Usage {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
            total_tokens: u.total_token_count,
        })
        .unwrap_or_default();

    CompletionResponse {
        id: String::new(),
        content,
        tool_calls,
        usage,
    }
}

// Wire types

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
    #[serde(rename = "functionCall")]
    function_call: Option<FunctionCall>,
    #[serde(rename = "thoughtSignature")]
    thought_signature: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    args: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u64,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u64,
    #[serde(rename = "totalTokenCount", default)]
    total_token_count: u64,
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<EmbeddingValues>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}
