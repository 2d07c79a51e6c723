//! Provider host
//!
//! A uniform [`LlmProvider`] contract with one adapter per wire
//! interface. The factory resolves a provider name through the
//! descriptor table, picks the adapter for its `interface_type`, and
//! hands back an `Arc<dyn LlmProvider>` sharing a keep-alive HTTP client
//! per provider.

mod anthropic;
mod auth;
mod bedrock;
mod error;
mod gemini;
mod openai;
pub mod retry;
mod sigv4;
pub mod toolloop;
mod types;
mod vertex;

pub use anthropic::AnthropicProvider;
pub use bedrock::BedrockProvider;
pub use error::LlmError;
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
pub use toolloop::{run_tool_loop, AttachedTool, ToolRouter, DEFAULT_TOOL_FOLLOW_UP};
pub use types::{
    CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, Message, Role,
    ToolCall, ToolSpec, Usage,
};
pub use vertex::VertexProvider;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{AppConfig, InterfaceType, ProviderDescriptor};

/// The provider contract every adapter satisfies
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Descriptor name this provider was created from
    fn name(&self) -> &str;

    /// Effective model id
    fn model(&self) -> &str;

    /// Non-streaming completion
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Streaming completion: content deltas go to `sink`, the final
    /// aggregated response is returned.
    async fn stream(
        &self,
        request: CompletionRequest,
        sink: mpsc::Sender<String>,
    ) -> Result<CompletionResponse, LlmError>;

    /// Embeddings endpoint for this interface
    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, LlmError>;

    /// Release pooled resources
    async fn close(&self) {}
}

/// Anything that can mint providers by name. The engine depends on this
/// seam so tests can inject stubs.
pub trait ProviderSource: Send + Sync {
    fn create(
        &self,
        name: &str,
        model_override: Option<&str>,
    ) -> Result<Arc<dyn LlmProvider>, LlmError>;
}

/// Factory over the descriptor table
pub struct ProviderFactory {
    descriptors: HashMap<String, ProviderDescriptor>,
    /// Keep-alive HTTP client per provider name
    clients: Mutex<HashMap<String, reqwest::Client>>,
    /// Adapter cache per `(provider, model)`
    cache: Mutex<HashMap<(String, String), Arc<dyn LlmProvider>>>,
}

impl ProviderFactory {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            descriptors: config.providers.clone(),
            clients: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn http_client(&self, name: &str, timeout_secs: u64) -> Result<reqwest::Client, LlmError> {
        let mut clients = self.clients.lock().expect("client pool poisoned");
        if let Some(client) = clients.get(name) {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(LlmError::Network)?;
        clients.insert(name.to_string(), client.clone());
        Ok(client)
    }
}

impl ProviderSource for ProviderFactory {
    fn create(
        &self,
        name: &str,
        model_override: Option<&str>,
    ) -> Result<Arc<dyn LlmProvider>, LlmError> {
        let descriptor = self
            .descriptors
            .get(name)
            .ok_or_else(|| LlmError::ProviderNotFound(name.to_string()))?;
        let config = &descriptor.config;

        let model = model_override
            .map(str::to_string)
            .or_else(|| config.default_model.clone())
            .ok_or_else(|| {
                LlmError::Configuration(format!("provider '{}' has no model configured", name))
            })?;

        let cache_key = (name.to_string(), model.clone());
        if let Some(provider) = self.cache.lock().expect("cache poisoned").get(&cache_key) {
            return Ok(provider.clone());
        }

        let http = self.http_client(name, config.timeout_secs)?;
        let provider: Arc<dyn LlmProvider> = match descriptor.interface_type {
            InterfaceType::OpenaiCompatible => {
                Arc::new(OpenAiProvider::hosted(name, config, http, model)?)
            }
            InterfaceType::OllamaNative => {
                Arc::new(OpenAiProvider::local(name, config, http, model))
            }
            InterfaceType::AnthropicNative => {
                Arc::new(AnthropicProvider::new(name, config, http, model)?)
            }
            InterfaceType::GeminiNative => {
                Arc::new(GeminiProvider::new(name, config, http, model)?)
            }
            InterfaceType::AwsBedrock => {
                Arc::new(BedrockProvider::new(name, config, http, model)?)
            }
            InterfaceType::GcpVertexAi => {
                Arc::new(VertexProvider::new(name, config, http, model)?)
            }
        };

        self.cache
            .lock()
            .expect("cache poisoned")
            .insert(cache_key, provider.clone());
        tracing::debug!(provider = name, model = %provider.model(), "created provider");
        Ok(provider)
    }
}
