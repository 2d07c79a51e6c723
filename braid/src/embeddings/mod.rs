//! Embeddings pipeline
//!
//! Chunker + provider dispatch + output formatter. Inputs may be a text
//! string, an array of strings, or a `file://` URL; batches of up to 100
//! chunks go to the provider per request.

pub mod chunk;

pub use chunk::{chunk_text, Chunk};

use std::path::PathBuf;

use serde_json::{json, Value};

use crate::config::{ChunkStrategy, EmbeddingsDefaults, OutputFormat};
use crate::llm::{EmbeddingRequest, LlmError, LlmProvider};

/// Provider batching cap
const MAX_BATCH: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingsError {
    #[error("invalid embeddings input: {0}")]
    Input(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Provider(#[from] LlmError),

    #[error("failed to write output {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Resolved pipeline parameters for one invocation
#[derive(Debug, Clone)]
pub struct PipelineSpec {
    pub model: Option<String>,
    pub chunking: ChunkStrategy,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub output_format: OutputFormat,
    pub output_file: Option<PathBuf>,
}

impl PipelineSpec {
    pub fn from_defaults(defaults: &EmbeddingsDefaults) -> Self {
        Self {
            model: defaults.model.clone(),
            chunking: defaults.chunking,
            chunk_size: defaults.chunk_size,
            chunk_overlap: defaults.chunk_overlap,
            output_format: defaults.output_format,
            output_file: None,
        }
    }
}

/// Resolve the input value into chunks: strings are chunked, arrays are
/// chunked per element (element index as source id), `file://` URLs are
/// read from disk first.
pub async fn resolve_chunks(input: &Value, spec: &PipelineSpec) -> Result<Vec<Chunk>, EmbeddingsError> {
    match input {
        Value::String(s) => {
            let text = if let Some(path) = s.strip_prefix("file://") {
                let path = PathBuf::from(path);
                tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|source| EmbeddingsError::Io { path, source })?
            } else {
                s.clone()
            };
            Ok(chunk_text(
                &text,
                spec.chunking,
                spec.chunk_size,
                spec.chunk_overlap,
                None,
            ))
        }
        Value::Array(items) => {
            let mut chunks = Vec::new();
            for (i, item) in items.iter().enumerate() {
                let text = item.as_str().ok_or_else(|| {
                    EmbeddingsError::Input(format!("array element {} is not a string", i))
                })?;
                let source_id = i.to_string();
                let mut piece = chunk_text(
                    text,
                    spec.chunking,
                    spec.chunk_size,
                    spec.chunk_overlap,
                    Some(&source_id),
                );
                // indices are global across the whole input
                for chunk in &mut piece {
                    chunk.index = chunks.len() + chunk.index;
                }
                chunks.append(&mut piece);
            }
            Ok(chunks)
        }
        other => Err(EmbeddingsError::Input(format!(
            "expected string or array of strings, got {}",
            other
        ))),
    }
}

/// Run the pipeline: chunk, embed in batches, format, optionally write
/// to disk. Returns the formatted result as a scope-bindable value.
pub async fn run(
    provider: &dyn LlmProvider,
    input: &Value,
    spec: &PipelineSpec,
) -> Result<Value, EmbeddingsError> {
    let chunks = resolve_chunks(input, spec).await?;
    tracing::debug!(chunks = chunks.len(), "embedding chunks");

    let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(chunks.len());
    let mut model = spec.model.clone().unwrap_or_default();
    let mut dimensions = 0;

    for batch in chunks.chunks(MAX_BATCH) {
        let response = provider
            .embed(EmbeddingRequest {
                model: spec.model.clone(),
                inputs: batch.iter().map(|c| c.text.clone()).collect(),
            })
            .await?;
        if !response.model.is_empty() {
            model = response.model.clone();
        }
        dimensions = response.dimensions;
        vectors.extend(response.vectors);
    }

    let document = render(&model, dimensions, &chunks, &vectors, spec.output_format);

    if let Some(path) = &spec.output_file {
        let text = match &document {
            Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_default(),
        };
        tokio::fs::write(path, text)
            .await
            .map_err(|source| EmbeddingsError::Output {
                path: path.clone(),
                source,
            })?;
    }

    Ok(document)
}

fn render(
    model: &str,
    dimensions: usize,
    chunks: &[Chunk],
    vectors: &[Vec<f32>],
    format: OutputFormat,
) -> Value {
    match format {
        OutputFormat::Json | OutputFormat::Compact => {
            let data: Vec<Value> = chunks
                .iter()
                .zip(vectors)
                .map(|(chunk, vector)| {
                    json!({
                        "index": chunk.index,
                        "embedding": vector,
                        "metadata": {
                            "offset": chunk.offset,
                            "length": chunk.length,
                            "source_id": chunk.source_id,
                        },
                    })
                })
                .collect();
            let document = json!({
                "model": model,
                "dimensions": dimensions,
                "data": data,
            });
            if format == OutputFormat::Compact {
                Value::String(serde_json::to_string(&document).unwrap_or_default())
            } else {
                document
            }
        }
        OutputFormat::Csv => {
            let mut out = String::from("index,source_id,embedding\n");
            for (chunk, vector) in chunks.iter().zip(vectors) {
                let joined: Vec<String> = vector.iter().map(|f| f.to_string()).collect();
                out.push_str(&format!(
                    "{},{},\"{}\"\n",
                    chunk.index,
                    chunk.source_id.clone().unwrap_or_default(),
                    joined.join(" ")
                ));
            }
            Value::String(out)
        }
        OutputFormat::Text => {
            // text output mirrors compact for embeddings
            Value::String(
                serde_json::to_string(&json!({"model": model, "dimensions": dimensions}))
                    .unwrap_or_default(),
            )
        }
    }
}
