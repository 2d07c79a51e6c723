//! Configuration loading
//!
//! The whole configuration surface is YAML with strict unknown-field
//! rejection. `config.yaml` is either monolithic or an `includes:` bundle
//! of glob patterns; included fragments are self-describing (a workflow
//! starts with `$schema`, a provider file with `interface_type`, and so
//! on). `${VAR}` / `${VAR:-default}` references are expanded before
//! parsing; the result is an effective in-memory config, the files on disk
//! are never touched.

mod expand;

pub use expand::{expand_env, expand_with};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::Workflow;

/// Errors raised while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found: {path}")]
    Missing { path: PathBuf },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("environment variable ${{{name}}} is not set and has no default")]
    UnsetVariable { name: String },

    #[error("{kind} '{name}' referenced by {referrer} is not declared")]
    UnknownReference {
        kind: &'static str,
        name: String,
        referrer: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Provider wire interface families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceType {
    OpenaiCompatible,
    AnthropicNative,
    GeminiNative,
    /// Local openai-compatible server with no auth (Ollama, LM Studio)
    #[serde(alias = "lmstudio")]
    OllamaNative,
    AwsBedrock,
    GcpVertexAi,
}

impl std::fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InterfaceType::OpenaiCompatible => "openai_compatible",
            InterfaceType::AnthropicNative => "anthropic_native",
            InterfaceType::GeminiNative => "gemini_native",
            InterfaceType::OllamaNative => "ollama_native",
            InterfaceType::AwsBedrock => "aws_bedrock",
            InterfaceType::GcpVertexAi => "gcp_vertex_ai",
        };
        write!(f, "{}", s)
    }
}

/// A provider descriptor: `(interface_type, provider_name, config)`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderDescriptor {
    pub interface_type: InterfaceType,
    pub provider_name: String,
    #[serde(default)]
    pub config: ProviderConfig,
}

/// Per-provider connection settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    /// Endpoint base URL; each adapter has a sensible default
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub context_window: Option<u32>,
    /// Default model for embedding requests
    #[serde(default)]
    pub embedding_model: Option<String>,
    /// Logical name -> provider model id table for embeddings
    #[serde(default)]
    pub embedding_models: HashMap<String, String>,
    /// AWS extensions (aws_bedrock only)
    #[serde(default)]
    pub aws: Option<AwsConfig>,
    /// GCP extensions (gcp_vertex_ai only)
    #[serde(default)]
    pub gcp: Option<GcpConfig>,
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AwsConfig {
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GcpConfig {
    pub project: String,
    pub location: String,
    /// Path to a service-account JSON credentials file
    pub credentials_path: PathBuf,
}

/// MCP server descriptor: `(command, args, env, system_prompt, settings)`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct McpServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub settings: McpServerSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct McpServerSettings {
    /// Server-level cap on tool-call follow-up rounds
    #[serde(default)]
    pub max_tool_follow_up: Option<u32>,
    /// Reject tool calls whose arguments fail the advertised schema
    #[serde(default)]
    pub strict_mode: bool,
}

/// Chunking strategy for the embeddings pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    Sentence,
    Paragraph,
    Fixed,
}

impl Default for ChunkStrategy {
    fn default() -> Self {
        ChunkStrategy::Sentence
    }
}

/// Output rendering for embeddings and RAG results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Json,
    Csv,
    Compact,
    Text,
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::Json
    }
}

/// Defaults for the embeddings pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmbeddingsDefaults {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub chunking: ChunkStrategy,
    /// Token window for the `fixed` strategy
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub chunk_overlap: usize,
    #[serde(default)]
    pub output_format: OutputFormat,
}

fn default_chunk_size() -> usize {
    512
}

/// How a RAG service obtains the query embedding
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryEmbedding {
    pub mode: QueryEmbeddingMode,
    /// Tool name on the same server (mcp_tool mode)
    #[serde(default)]
    pub tool: Option<String>,
    /// Provider/model for the internal pipeline (service mode)
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryEmbeddingMode {
    Service,
    McpTool,
}

/// One search strategy: a vector column with a weight and threshold
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RagStrategy {
    pub vector_column: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub threshold: f64,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionMethod {
    Rrf,
    Weighted,
    Max,
    Avg,
}

impl Default for FusionMethod {
    fn default() -> Self {
        FusionMethod::Rrf
    }
}

/// RAG service configuration bound to a vector-store MCP server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RagServiceConfig {
    /// MCP server hosting the vector store
    pub server: String,
    /// Search tool name on that server
    pub search_tool: String,
    pub table: String,
    pub text_column: String,
    #[serde(default)]
    pub metadata_columns: Vec<String>,
    pub query_embedding: QueryEmbedding,
    pub strategies: Vec<RagStrategy>,
    #[serde(default)]
    pub fusion: FusionMethod,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Enable synonym/acronym query expansion
    #[serde(default)]
    pub expansion: bool,
    #[serde(default)]
    pub output_format: OutputFormat,
}

fn default_top_k() -> usize {
    10
}

/// MCP-server-facade descriptor (`runas/<name>.yaml`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunasConfig {
    pub server_info: ServerInfo,
    pub tools: Vec<RunasTool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// One facade tool: tool name -> workflow name, with an input schema and a
/// mapping from call arguments to the workflow's initial variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunasTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub workflow: String,
    #[serde(default = "default_input_schema")]
    pub input_schema: Value,
    /// variable name -> template over `arguments.*` / `input_data`
    #[serde(default)]
    pub input_mapping: HashMap<String, String>,
}

fn default_input_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// A named reusable prompt fragment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SkillConfig {
    #[serde(default)]
    pub description: Option<String>,
    pub prompt: String,
}

/// Engine-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub default_provider: Option<String>,
    /// AI-level default for the tool-call follow-up cap (2 if unset)
    #[serde(default)]
    pub max_tool_follow_up: Option<u32>,
    /// Raise a step error on unknown substitution paths
    #[serde(default)]
    pub strict_substitution: bool,
    #[serde(default = "default_template_depth")]
    pub max_template_depth: u32,
    #[serde(default = "default_task_ttl_ms")]
    pub task_ttl_default_ms: u64,
    #[serde(default = "default_task_ttl_max_ms")]
    pub task_ttl_max_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub task_poll_interval_ms: u64,
    /// Directory for facade Unix sockets
    #[serde(default)]
    pub socket_dir: Option<PathBuf>,
    #[serde(default)]
    pub skills: HashMap<String, SkillConfig>,
    /// Synonym/acronym table for RAG query expansion
    #[serde(default)]
    pub expansions: HashMap<String, Vec<String>>,
    #[serde(default = "default_max_expansions")]
    pub max_expansions: usize,
}

fn default_template_depth() -> u32 {
    32
}

fn default_task_ttl_ms() -> u64 {
    300_000
}

fn default_task_ttl_max_ms() -> u64 {
    3_600_000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_expansions() -> usize {
    3
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_provider: None,
            max_tool_follow_up: None,
            strict_substitution: false,
            max_template_depth: default_template_depth(),
            task_ttl_default_ms: default_task_ttl_ms(),
            task_ttl_max_ms: default_task_ttl_max_ms(),
            task_poll_interval_ms: default_poll_interval_ms(),
            socket_dir: None,
            skills: HashMap::new(),
            expansions: HashMap::new(),
            max_expansions: default_max_expansions(),
        }
    }
}

impl Settings {
    pub fn socket_dir(&self) -> PathBuf {
        self.socket_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("/tmp/mcp-sockets"))
    }
}

/// The fully loaded, env-expanded application configuration
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub providers: HashMap<String, ProviderDescriptor>,
    pub servers: HashMap<String, McpServerConfig>,
    pub workflows: HashMap<String, Workflow>,
    pub embeddings: EmbeddingsDefaults,
    pub rag: HashMap<String, RagServiceConfig>,
    pub runas: HashMap<String, RunasConfig>,
    pub settings: Settings,
}

/// Shape of `config.yaml` (monolithic sections plus `includes:`)
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RootFile {
    #[serde(default)]
    includes: Vec<String>,
    #[serde(default)]
    providers: HashMap<String, ProviderDescriptor>,
    #[serde(default)]
    servers: HashMap<String, McpServerConfig>,
    #[serde(default)]
    workflows: HashMap<String, Workflow>,
    #[serde(default)]
    embeddings: Option<EmbeddingsDefaults>,
    #[serde(default)]
    rag: HashMap<String, RagServiceConfig>,
    #[serde(default)]
    runas: HashMap<String, RunasConfig>,
    #[serde(default)]
    settings: Option<Settings>,
}

/// `providers/<name>.yaml`
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProviderFile {
    interface_type: InterfaceType,
    provider_name: String,
    #[serde(default)]
    config: ProviderConfig,
}

/// `servers/<name>.yaml`
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServerFile {
    server_name: String,
    config: McpServerConfig,
}

/// `rag/<name>.yaml`
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RagFile {
    service_name: String,
    config: RagServiceConfig,
}

/// `settings.yaml`
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    settings: Settings,
}

/// `embeddings/<name>.yaml`
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EmbeddingsFile {
    embeddings: EmbeddingsDefaults,
}

impl AppConfig {
    /// Load from a `config.yaml`, following `includes:` globs.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = read_expanded(path)?;
        let root: RootFile = parse_yaml(path, &text)?;

        let mut config = AppConfig {
            providers: root.providers,
            servers: root.servers,
            workflows: root.workflows,
            embeddings: root.embeddings.unwrap_or_default(),
            rag: root.rag,
            runas: root.runas,
            settings: root.settings.unwrap_or_default(),
        };

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for pattern in &root.includes {
            let full = base.join(pattern);
            let full = full.to_string_lossy().into_owned();
            let entries = glob::glob(&full)
                .map_err(|e| ConfigError::Invalid(format!("bad include pattern '{}': {}", pattern, e)))?;

            let mut matched = false;
            for entry in entries {
                let file = entry.map_err(|e| ConfigError::Invalid(format!("include error: {}", e)))?;
                if file.is_dir() {
                    continue;
                }
                matched = true;
                config.merge_fragment(base, &file)?;
            }
            if !matched {
                tracing::debug!("include pattern '{}' matched no files", pattern);
            }
        }

        config.validate_names()?;
        Ok(config)
    }

    /// Parse one included fragment, classifying it by its top-level keys.
    fn merge_fragment(&mut self, base: &Path, path: &Path) -> Result<(), ConfigError> {
        let text = read_expanded(path)?;
        let value: serde_yaml::Value = parse_yaml(path, &text)?;

        let mapping = match value.as_mapping() {
            Some(m) => m,
            None => {
                return Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    message: "expected a YAML mapping".to_string(),
                })
            }
        };

        let has = |key: &str| mapping.contains_key(&serde_yaml::Value::String(key.to_string()));

        if has("$schema") {
            let workflow: Workflow = parse_yaml(path, &text)?;
            let key = workflow_key(base, path);
            if self.workflows.contains_key(&key) {
                return Err(ConfigError::Invalid(format!("duplicate workflow '{}'", key)));
            }
            self.workflows.insert(key, workflow);
        } else if has("interface_type") {
            let file: ProviderFile = parse_yaml(path, &text)?;
            self.providers.insert(
                file.provider_name.clone(),
                ProviderDescriptor {
                    interface_type: file.interface_type,
                    provider_name: file.provider_name,
                    config: file.config,
                },
            );
        } else if has("server_name") {
            let file: ServerFile = parse_yaml(path, &text)?;
            self.servers.insert(file.server_name, file.config);
        } else if has("server_info") {
            let file: RunasConfig = parse_yaml(path, &text)?;
            let key = file_stem(path);
            self.runas.insert(key, file);
        } else if has("service_name") {
            let file: RagFile = parse_yaml(path, &text)?;
            self.rag.insert(file.service_name, file.config);
        } else if has("settings") {
            let file: SettingsFile = parse_yaml(path, &text)?;
            self.settings = file.settings;
        } else if has("embeddings") {
            let file: EmbeddingsFile = parse_yaml(path, &text)?;
            self.embeddings = file.embeddings;
        } else {
            return Err(ConfigError::Parse {
                path: path.to_path_buf(),
                message: "unrecognised configuration fragment (expected one of: \
                          $schema, interface_type, server_name, server_info, \
                          service_name, settings, embeddings)"
                    .to_string(),
            });
        }

        Ok(())
    }

    /// Cross-reference checks that do not need workflow compilation.
    fn validate_names(&self) -> Result<(), ConfigError> {
        for (name, rag) in &self.rag {
            if !self.servers.contains_key(&rag.server) {
                return Err(ConfigError::UnknownReference {
                    kind: "MCP server",
                    name: rag.server.clone(),
                    referrer: format!("rag service '{}'", name),
                });
            }
            if rag.strategies.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "rag service '{}' declares no strategies",
                    name
                )));
            }
        }

        for (name, runas) in &self.runas {
            for tool in &runas.tools {
                if !self.workflows.contains_key(&tool.workflow) {
                    return Err(ConfigError::UnknownReference {
                        kind: "workflow",
                        name: tool.workflow.clone(),
                        referrer: format!("runas '{}' tool '{}'", name, tool.name),
                    });
                }
            }
        }

        if let Some(provider) = &self.settings.default_provider {
            if !self.providers.contains_key(provider) {
                return Err(ConfigError::UnknownReference {
                    kind: "provider",
                    name: provider.clone(),
                    referrer: "settings.default_provider".to_string(),
                });
            }
        }

        if self.settings.task_ttl_default_ms > self.settings.task_ttl_max_ms {
            return Err(ConfigError::Invalid(
                "task_ttl_default_ms exceeds task_ttl_max_ms".to_string(),
            ));
        }

        Ok(())
    }
}

fn read_expanded(path: &Path) -> Result<String, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::Missing {
                path: path.to_path_buf(),
            }
        } else {
            ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            }
        }
    })?;
    expand_env(&text)
}

fn parse_yaml<T: serde::de::DeserializeOwned>(path: &Path, text: &str) -> Result<T, ConfigError> {
    serde_yaml::from_str(text).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Workflow key: path relative to the config dir, extension stripped, with
/// any leading `workflows/` removed. Nested directories key as
/// `subdir/name`.
fn workflow_key(base: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(base).unwrap_or(path);
    let mut key = rel.with_extension("");
    if let Ok(stripped) = key.strip_prefix("workflows") {
        key = stripped.to_path_buf();
    }
    key.to_string_lossy().replace('\\', "/")
}

/// Resolve the config path: the preferred path when it exists, otherwise
/// the per-user location (`<config dir>/braid/config.yaml`), falling back
/// to the preferred path so the missing-file error names it.
pub fn default_config_path(preferred: PathBuf) -> PathBuf {
    if preferred.exists() {
        return preferred;
    }
    if let Some(dir) = dirs::config_dir() {
        let candidate = dir.join("braid").join("config.yaml");
        if candidate.exists() {
            return candidate;
        }
    }
    preferred
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn test_monolithic_config() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "config.yaml",
            r#"
providers:
  local:
    interface_type: ollama_native
    provider_name: local
    config:
      api_base: http://localhost:11434
      default_model: llama3.2
settings:
  strict_substitution: true
"#,
        );

        let config = AppConfig::load(&dir.path().join("config.yaml")).unwrap();
        assert_eq!(config.providers.len(), 1);
        assert_eq!(
            config.providers["local"].interface_type,
            InterfaceType::OllamaNative
        );
        assert!(config.settings.strict_substitution);
    }

    #[test]
    fn test_includes_bundle() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "config.yaml",
            "includes:\n  - providers/*.yaml\n  - servers/*.yaml\n  - workflows/**/*.yaml\n",
        );
        write(
            dir.path(),
            "providers/openai.yaml",
            r#"
interface_type: openai_compatible
provider_name: openai
config:
  api_key: sk-test
  default_model: gpt-4o
"#,
        );
        write(
            dir.path(),
            "servers/files.yaml",
            r#"
server_name: files
config:
  command: files-mcp
  args: ["--stdio"]
"#,
        );
        write(
            dir.path(),
            "workflows/research/deep.yaml",
            r#"
$schema: workflow/v2.0
name: deep
steps:
  - name: one
    run: "say hi"
"#,
        );

        let config = AppConfig::load(&dir.path().join("config.yaml")).unwrap();
        assert!(config.providers.contains_key("openai"));
        assert!(config.servers.contains_key("files"));
        assert!(
            config.workflows.contains_key("research/deep"),
            "workflow keyed by subdir/name, got: {:?}",
            config.workflows.keys().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "config.yaml",
            "providers: {}\nnot_a_field: true\n",
        );

        let err = AppConfig::load(&dir.path().join("config.yaml")).unwrap_err();
        match err {
            ConfigError::Parse { message, .. } => {
                assert!(message.contains("not_a_field"), "message: {}", message)
            }
            other => panic!("expected Parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_config() {
        let err = AppConfig::load(Path::new("/nonexistent/config.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { .. }));
    }

    #[test]
    fn test_env_expansion_in_fragment() {
        std::env::set_var("BRAID_TEST_KEY", "sk-expanded");
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "config.yaml",
            r#"
providers:
  p:
    interface_type: openai_compatible
    provider_name: p
    config:
      api_key: ${BRAID_TEST_KEY}
      api_base: ${BRAID_TEST_BASE:-https://api.openai.com}
"#,
        );

        let config = AppConfig::load(&dir.path().join("config.yaml")).unwrap();
        let p = &config.providers["p"].config;
        assert_eq!(p.api_key.as_deref(), Some("sk-expanded"));
        assert_eq!(p.api_base.as_deref(), Some("https://api.openai.com"));
    }

    #[test]
    fn test_runas_reference_validated() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "config.yaml",
            r#"
runas:
  main:
    server_info:
      name: facade
      version: "1.0"
    tools:
      - name: go
        workflow: missing
"#,
        );

        let err = AppConfig::load(&dir.path().join("config.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownReference { .. }));
    }
}
