//! GCP Vertex AI adapter
//!
//! Hybrid interface: chat goes through Vertex's OpenAI-compatible
//! endpoint with `google/<model>` name mangling, embeddings through the
//! native `:predict` endpoint. Auth is an OAuth2 bearer token from the
//! service-account JWT flow in [`super::auth`].

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::{GcpConfig, ProviderConfig};

use super::auth::TokenProvider;
use super::openai::{consume_sse, openai_messages, openai_tools, parse_chat_response, ChatResponse};
use super::retry::{backoff_delay, retry_after, BASE_DELAY};
use super::types::{
    CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse,
};
use super::{LlmError, LlmProvider};

pub struct VertexProvider {
    name: String,
    model: String,
    gcp: GcpConfig,
    http: reqwest::Client,
    auth: TokenProvider,
    max_retries: u32,
    embedding_model: Option<String>,
}

impl VertexProvider {
    pub fn new(
        name: &str,
        config: &ProviderConfig,
        http: reqwest::Client,
        model: String,
    ) -> Result<Self, LlmError> {
        let gcp = config.gcp.clone().ok_or_else(|| {
            LlmError::Configuration(format!("provider '{}' requires a gcp section", name))
        })?;
        let auth = TokenProvider::new(gcp.credentials_path.clone(), http.clone());
        Ok(Self {
            name: name.to_string(),
            model,
            gcp,
            http,
            auth,
            max_retries: config.max_retries,
            embedding_model: config.embedding_model.clone(),
        })
    }

    fn host(&self) -> String {
        if self.gcp.location == "global" {
            "aiplatform.googleapis.com".to_string()
        } else {
            format!("{}-aiplatform.googleapis.com", self.gcp.location)
        }
    }

    fn chat_url(&self) -> String {
        format!(
            "https://{}/v1beta1/projects/{}/locations/{}/endpoints/openapi/chat/completions",
            self.host(),
            self.gcp.project,
            self.gcp.location
        )
    }

    fn predict_url(&self, model: &str) -> String {
        format!(
            "https://{}/v1/projects/{}/locations/{}/publishers/google/models/{}:predict",
            self.host(),
            self.gcp.project,
            self.gcp.location,
            model
        )
    }

    fn build_body(&self, request: &CompletionRequest) -> Value {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let mut body = json!({
            "model": format!("google/{}", model),
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
impl LlmProvider for VertexProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let url = self.chat_url();
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

            let token = self.auth.token().await?;
            let response = match self
                .http
                .post(&url)
                .bearer_auth(&token)
                .json(&body)
                .send()
                .await
            {
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
        let url = self.chat_url();
        let mut body = self.build_body(&request);
        body["stream"] = json!(true);

        let token = self.auth.token().await?;
        let response = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Network(e)
                }
            })?;
        consume_sse(response, &sink).await
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, LlmError> {
        let model = request
            .model
            .clone()
            .or_else(|| self.embedding_model.clone())
            .ok_or_else(|| {
                LlmError::Configuration("no vertex embedding model configured".to_string())
            })?;
        let url = self.predict_url(&model);
        let instances: Vec<Value> = request
            .inputs
            .iter()
            .map(|text| json!({"content": text}))
            .collect();

        let token = self.auth.token().await?;
        let response = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .json(&json!({"instances": instances}))
            .send()
            .await
            .map_err(LlmError::Network)?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status, text));
        }

        let parsed: PredictResponse = response.json().await.map_err(LlmError::Network)?;
        let vectors: Vec<Vec<f32>> = parsed
            .predictions
            .into_iter()
            .map(|p| p.embeddings.values)
            .collect();
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
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    embeddings: PredictionEmbeddings,
}

#[derive(Debug, Deserialize)]
struct PredictionEmbeddings {
    values: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn provider(location: &str) -> VertexProvider {
        let http = reqwest::Client::new();
        VertexProvider {
            name: "vertex".to_string(),
            model: "gemini-2.0-flash".to_string(),
            gcp: GcpConfig {
                project: "proj".to_string(),
                location: location.to_string(),
                credentials_path: PathBuf::from("/dev/null"),
            },
            http: http.clone(),
            auth: TokenProvider::new(PathBuf::from("/dev/null"), http),
            max_retries: 0,
            embedding_model: Some("text-embedding-005".to_string()),
        }
    }

    #[test]
    fn test_regional_and_global_hosts() {
        assert_eq!(
            provider("us-central1").chat_url(),
            "https://us-central1-aiplatform.googleapis.com/v1beta1/projects/proj/locations/us-central1/endpoints/openapi/chat/completions"
        );
        assert!(provider("global")
            .chat_url()
            .starts_with("https://aiplatform.googleapis.com/"));
    }

    #[test]
    fn test_model_name_mangling() {
        let request = CompletionRequest {
            messages: vec![super::super::types::Message::user("hi")],
            ..Default::default()
        };
        let body = provider("us-central1").build_body(&request);
        assert_eq!(body["model"], "google/gemini-2.0-flash");
    }

    #[test]
    fn test_predict_url() {
        assert_eq!(
            provider("us-central1").predict_url("text-embedding-005"),
            "https://us-central1-aiplatform.googleapis.com/v1/projects/proj/locations/us-central1/publishers/google/models/text-embedding-005:predict"
        );
    }
}
