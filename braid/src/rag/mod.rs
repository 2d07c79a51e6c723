//! RAG service
//!
//! Given a query, returns ranked documents from a vector-store MCP
//! server: optional synonym expansion, one query embedding per variant,
//! one search-tool call per strategy, then rank fusion.

pub mod fusion;

pub use fusion::{fuse, FusedHit, RankedSource, SearchHit};

use std::collections::HashMap;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{OutputFormat, QueryEmbeddingMode, RagServiceConfig};
use crate::llm::{EmbeddingRequest, LlmError, ProviderSource, ToolSpec};
use crate::mcp::{McpError, McpPool};

#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error(transparent)]
    Mcp(#[from] McpError),

    #[error(transparent)]
    Provider(#[from] LlmError),

    #[error("failed to parse search results: {0}")]
    Parse(String),

    #[error("rag service has no provider configured for query embedding")]
    NoEmbeddingProvider,
}

/// Arguments of the synthesized `rag_search` tool offered to models
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RagSearchArgs {
    /// Natural-language search query
    pub query: String,
    /// Override the configured result count
    #[serde(default)]
    pub top_k: Option<usize>,
}

pub struct RagService {
    pub name: String,
    config: RagServiceConfig,
    pool: Arc<McpPool>,
    providers: Arc<dyn ProviderSource>,
    expansions: HashMap<String, Vec<String>>,
    max_expansions: usize,
}

impl RagService {
    pub fn new(
        name: String,
        config: RagServiceConfig,
        pool: Arc<McpPool>,
        providers: Arc<dyn ProviderSource>,
        expansions: HashMap<String, Vec<String>>,
        max_expansions: usize,
    ) -> Self {
        Self {
            name,
            config,
            pool,
            providers,
            expansions,
            max_expansions,
        }
    }

    /// The tool spec exposed to models for this service.
    pub fn tool_spec(&self, exposed_name: &str) -> ToolSpec {
        let schema = schemars::schema_for!(RagSearchArgs);
        ToolSpec {
            name: exposed_name.to_string(),
            description: format!("Semantic search over the '{}' knowledge base", self.name),
            parameters: serde_json::to_value(schema)
                .unwrap_or_else(|_| json!({"type": "object", "properties": {}})),
        }
    }

    /// Synonym/acronym expansion: up to `max_expansions` variants beyond
    /// the original query.
    fn expand(&self, query: &str) -> Vec<String> {
        let mut variants = vec![query.to_string()];
        if !self.config.expansion {
            return variants;
        }
        for word in query.split_whitespace() {
            let key = word.to_lowercase();
            if let Some(alternatives) = self.expansions.get(&key) {
                for alt in alternatives {
                    if variants.len() > self.max_expansions {
                        return variants;
                    }
                    let variant = query
                        .split_whitespace()
                        .map(|w| if w.to_lowercase() == key { alt.as_str() } else { w })
                        .collect::<Vec<_>>()
                        .join(" ");
                    if !variants.contains(&variant) {
                        variants.push(variant);
                    }
                }
            }
        }
        variants
    }

    async fn query_embedding(
        &self,
        variant: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>, RagError> {
        match self.config.query_embedding.mode {
            QueryEmbeddingMode::Service => {
                let provider_name = self
                    .config
                    .query_embedding
                    .provider
                    .as_deref()
                    .ok_or(RagError::NoEmbeddingProvider)?;
                let provider = self.providers.create(provider_name, None)?;
                let response = provider
                    .embed(EmbeddingRequest {
                        model: self.config.query_embedding.model.clone(),
                        inputs: vec![variant.to_string()],
                    })
                    .await?;
                response
                    .vectors
                    .into_iter()
                    .next()
                    .ok_or_else(|| RagError::Parse("provider returned no embedding".to_string()))
            }
            QueryEmbeddingMode::McpTool => {
                let tool = self
                    .config
                    .query_embedding
                    .tool
                    .as_deref()
                    .ok_or_else(|| RagError::Parse("mcp_tool mode requires a tool name".to_string()))?;
                let text = self
                    .pool
                    .call(&self.config.server, tool, json!({"text": variant}), cancel)
                    .await?;
                let parsed: Vec<f32> = serde_json::from_str(text.trim())
                    .map_err(|e| RagError::Parse(format!("embedding tool output: {}", e)))?;
                Ok(parsed)
            }
        }
    }

    /// Execute the search and return the formatted result.
    pub async fn execute(
        &self,
        query: &str,
        top_k: Option<usize>,
        filters: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, RagError> {
        let top_k = top_k.unwrap_or(self.config.top_k);
        let variants = self.expand(query);
        debug!(service = %self.name, variants = variants.len(), "rag search");

        let mut sources: Vec<RankedSource> = Vec::new();
        for (vi, variant) in variants.iter().enumerate() {
            let embedding = self.query_embedding(variant, cancel).await?;

            for strategy in &self.config.strategies {
                let args = json!({
                    "table": self.config.table,
                    "vector_column": strategy.vector_column,
                    "embedding": embedding,
                    "top_k": top_k,
                    "threshold": strategy.threshold,
                    "filters": filters,
                });
                let text = self
                    .pool
                    .call(&self.config.server, &self.config.search_tool, args, cancel)
                    .await?;
                let hits = self.parse_hits(&text)?;
                sources.push(RankedSource {
                    name: format!("{}#{}", strategy.vector_column, vi),
                    weight: strategy.weight,
                    hits,
                });
            }
        }

        let mut fused = fuse(self.config.fusion, &sources);
        fused.truncate(top_k);
        Ok(self.render(query, &fused))
    }

    /// Rows come back as a JSON array of objects carrying the text and
    /// metadata columns plus a score.
    fn parse_hits(&self, text: &str) -> Result<Vec<SearchHit>, RagError> {
        let rows: Vec<Value> = serde_json::from_str(text.trim())
            .map_err(|e| RagError::Parse(format!("search tool output: {}", e)))?;

        Ok(rows
            .iter()
            .map(|row| {
                let text = row[self.config.text_column.as_str()]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let id = row["id"]
                    .as_str()
                    .map(str::to_string)
                    .or_else(|| row["id"].as_i64().map(|n| n.to_string()))
                    .unwrap_or_else(|| text.clone());
                let score = row["score"]
                    .as_f64()
                    .or_else(|| row["similarity"].as_f64())
                    .unwrap_or(0.0);
                let mut metadata = serde_json::Map::new();
                for column in &self.config.metadata_columns {
                    if let Some(value) = row.get(column.as_str()) {
                        metadata.insert(column.clone(), value.clone());
                    }
                }
                SearchHit {
                    id,
                    text,
                    metadata: Value::Object(metadata),
                    score,
                }
            })
            .collect())
    }

    fn render(&self, query: &str, hits: &[FusedHit]) -> Value {
        match self.config.output_format {
            OutputFormat::Text => {
                let joined: Vec<&str> = hits.iter().map(|h| h.text.as_str()).collect();
                Value::String(joined.join("\n\n"))
            }
            OutputFormat::Compact => {
                Value::String(serde_json::to_string(&self.render_json(query, hits)).unwrap_or_default())
            }
            _ => self.render_json(query, hits),
        }
    }

    fn render_json(&self, query: &str, hits: &[FusedHit]) -> Value {
        json!({
            "query": query,
            "results": hits
                .iter()
                .map(|h| {
                    json!({
                        "id": h.id,
                        "text": h.text,
                        "metadata": h.metadata,
                        "score": h.score,
                        "sources": h.sources,
                    })
                })
                .collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FusionMethod, QueryEmbedding, RagStrategy};

    fn service(expansion: bool) -> RagService {
        let config = RagServiceConfig {
            server: "vectors".to_string(),
            search_tool: "search".to_string(),
            table: "docs".to_string(),
            text_column: "body".to_string(),
            metadata_columns: vec!["title".to_string()],
            query_embedding: QueryEmbedding {
                mode: QueryEmbeddingMode::Service,
                tool: None,
                provider: Some("embedder".to_string()),
                model: None,
            },
            strategies: vec![RagStrategy {
                vector_column: "embedding".to_string(),
                weight: 1.0,
                threshold: 0.0,
            }],
            fusion: FusionMethod::Rrf,
            top_k: 5,
            expansion,
            output_format: OutputFormat::Json,
        };
        struct NoProviders;
        impl ProviderSource for NoProviders {
            fn create(
                &self,
                name: &str,
                _model: Option<&str>,
            ) -> Result<Arc<dyn crate::llm::LlmProvider>, LlmError> {
                Err(LlmError::ProviderNotFound(name.to_string()))
            }
        }
        let mut expansions = HashMap::new();
        expansions.insert("db".to_string(), vec!["database".to_string()]);
        RagService::new(
            "kb".to_string(),
            config,
            Arc::new(McpPool::new(HashMap::new())),
            Arc::new(NoProviders),
            expansions,
            3,
        )
    }

    #[test]
    fn test_expansion_produces_variants() {
        let s = service(true);
        let variants = s.expand("db schema");
        assert_eq!(variants, vec!["db schema", "database schema"]);
    }

    #[test]
    fn test_expansion_disabled() {
        let s = service(false);
        assert_eq!(s.expand("db schema"), vec!["db schema"]);
    }

    #[test]
    fn test_parse_hits_reads_columns() {
        let s = service(false);
        let hits = s
            .parse_hits(
                r#"[{"id": 1, "body": "hello", "title": "greeting", "score": 0.8},
                    {"id": 2, "body": "world", "similarity": 0.5}]"#,
            )
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "1");
        assert_eq!(hits[0].text, "hello");
        assert_eq!(hits[0].metadata["title"], "greeting");
        assert!((hits[1].score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_tool_spec_has_schema() {
        let s = service(false);
        let spec = s.tool_spec("rag_search");
        assert_eq!(spec.name, "rag_search");
        assert!(spec.parameters.is_object());
    }
}
