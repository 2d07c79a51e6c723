//! AWS Bedrock adapter
//!
//! SigV4-signed requests to the regional `bedrock-runtime` endpoint. The
//! request/response payload varies per inner model family: Anthropic
//! models speak the messages format, Titan models cover embeddings.
//! Bedrock's binary event-stream framing is not implemented; `stream`
//! falls back to a single completed response pushed through the sink.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::{AwsConfig, ProviderConfig};

use super::retry::{backoff_delay, BASE_DELAY};
use super::sigv4::{sign, SigningParams};
use super::types::{
    CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, Role, ToolCall,
    Usage,
};
use super::{LlmError, LlmProvider};

pub struct BedrockProvider {
    name: String,
    model: String,
    aws: AwsConfig,
    endpoint: String,
    http: reqwest::Client,
    max_retries: u32,
    embedding_model: Option<String>,
}

impl BedrockProvider {
    pub fn new(
        name: &str,
        config: &ProviderConfig,
        http: reqwest::Client,
        model: String,
    ) -> Result<Self, LlmError> {
        let aws = config.aws.clone().ok_or_else(|| {
            LlmError::Configuration(format!("provider '{}' requires an aws section", name))
        })?;
        let endpoint = config
            .api_base
            .clone()
            .unwrap_or_else(|| format!("https://bedrock-runtime.{}.amazonaws.com", aws.region));
        Ok(Self {
            name: name.to_string(),
            model,
            aws,
            endpoint,
            http,
            max_retries: config.max_retries,
            embedding_model: config.embedding_model.clone(),
        })
    }

    fn host(&self) -> String {
        self.endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string()
    }

    async fn invoke(&self, model_id: &str, body: Value) -> Result<Value, LlmError> {
        // Model ids carry ':'; keep the path and its canonical form
        // byte-identical by encoding it up front.
        let encoded_model = model_id.replace(':', "%3A");
        let path = format!("/model/{}/invoke", encoded_model);
        let url = format!("{}{}", self.endpoint, path);
        let payload = serde_json::to_vec(&body).map_err(|e| LlmError::Parse(e.to_string()))?;
        let host = self.host();

        let mut last_error: Option<LlmError> = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                warn!(provider = %self.name, attempt, "retrying after transient error");
                tokio::time::sleep(backoff_delay(attempt, BASE_DELAY)).await;
            }

            let params = SigningParams {
                access_key: &self.aws.access_key_id,
                secret_key: &self.aws.secret_access_key,
                session_token: self.aws.session_token.as_deref(),
                region: &self.aws.region,
                service: "bedrock",
            };
            let signed = sign(
                &params,
                "POST",
                &path,
                "",
                &[("content-type", "application/json"), ("host", &host)],
                &payload,
                chrono::Utc::now(),
            );

            let mut builder = self
                .http
                .post(&url)
                .header("content-type", "application/json")
                .header("x-amz-date", &signed.amz_date)
                .header("authorization", &signed.authorization);
            if let Some(token) = &self.aws.session_token {
                builder = builder.header("x-amz-security-token", token);
            }

            let response = match builder.body(payload.clone()).send().await {
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
                let text = response.text().await.unwrap_or_default();
                let error = LlmError::from_status(status, text);
                if error.is_retryable() && attempt < self.max_retries {
                    last_error = Some(error);
                    continue;
                }
                return Err(error);
            }

            return response.json().await.map_err(LlmError::Network);
        }

        Err(last_error.unwrap_or_else(|| LlmError::Parse("retries exhausted".to_string())))
    }

    fn build_anthropic_body(&self, request: &CompletionRequest) -> Value {
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
                Role::User => messages.push(json!({"role": "user", "content": message.content})),
                Role::Tool => messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                        "content": message.content,
                    }],
                })),
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
            "anthropic_version": "bedrock-2023-05-31",
            "max_tokens": request.max_tokens.unwrap_or(1024),
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
}

#[async_trait]
impl LlmProvider for BedrockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.model.clone());
        if !model.contains("anthropic.") {
            return Err(LlmError::Configuration(format!(
                "unsupported bedrock chat model family: {}",
                model
            )));
        }

        let body = self.build_anthropic_body(&request);
        let raw = self.invoke(&model, body).await?;
        let parsed: AnthropicInvokeResponse =
            serde_json::from_value(raw).map_err(|e| LlmError::Parse(e.to_string()))?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in parsed.content {
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

        let usage = parsed
            .usage
            .map(|u| Usage {
                prompt_tokens: u.input_tokens,
                completion_tokens: u.output_tokens,
                total_tokens: u.input_tokens + u.output_tokens,
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            id: parsed.id.unwrap_or_default(),
            content,
            tool_calls,
            usage,
        })
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        sink: mpsc::Sender<String>,
    ) -> Result<CompletionResponse, LlmError> {
        let response = self.complete(request).await?;
        if !response.content.is_empty() {
            let _ = sink.send(response.content.clone()).await;
        }
        Ok(response)
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, LlmError> {
        let model = request
            .model
            .clone()
            .or_else(|| self.embedding_model.clone())
            .ok_or_else(|| {
                LlmError::Configuration("no bedrock embedding model configured".to_string())
            })?;
        if !model.contains("titan-embed") {
            return Err(LlmError::Configuration(format!(
                "unsupported bedrock embedding model family: {}",
                model
            )));
        }

        // Titan embeds one input per invoke.
        let mut vectors = Vec::with_capacity(request.inputs.len());
        for input in &request.inputs {
            let raw = self.invoke(&model, json!({"inputText": input})).await?;
            let parsed: TitanEmbedResponse =
                serde_json::from_value(raw).map_err(|e| LlmError::Parse(e.to_string()))?;
            vectors.push(parsed.embedding);
        }
        let dimensions = vectors.first().map(|v| v.len()).unwrap_or(0);

        Ok(EmbeddingResponse {
            model,
            dimensions,
            vectors,
        })
    }
}

// Wire types

#[derive(Debug, Deserialize)]
struct AnthropicInvokeResponse {
    id: Option<String>,
    #[serde(default)]
    content: Vec<InvokeBlock>,
    usage: Option<InvokeUsage>,
}

#[derive(Debug, Deserialize)]
struct InvokeBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
    id: Option<String>,
    name: Option<String>,
    input: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct InvokeUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct TitanEmbedResponse {
    embedding: Vec<f32>,
}
