//! Workflow definitions and primitives
//!
//! A workflow is an ordered collection of named steps plus an optional
//! `loops:` section, with an execution context acting as a prototype of
//! defaults. Each step is exactly one execution kind: `run`, `loop`,
//! `template`, `consensus`, `embeddings`, or `rag`. The YAML form keeps
//! the kinds as optional fields; compilation converts them into the
//! tagged [`StepKind`] enum so the scheduler can match exhaustively.

pub mod compile;
pub mod cond;
pub mod consensus;
pub mod engine;
pub mod loops;
pub mod scope;
pub mod subst;

pub use compile::{compile, CompiledWorkflow};
pub use engine::{Engine, EngineBuilder, WorkflowRun};
pub use scope::Scope;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{ChunkStrategy, OutputFormat};

/// Schema tag every workflow file must carry
pub const WORKFLOW_SCHEMA: &str = "workflow/v2.0";

/// A complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Workflow {
    /// Must be `workflow/v2.0`
    #[serde(rename = "$schema")]
    pub schema: String,

    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub description: String,

    /// Defaults inherited by every contained step
    #[serde(default)]
    pub context: ExecutionContext,

    /// Workflow-level environment strings, visible as `env.*`
    #[serde(default)]
    pub env: HashMap<String, String>,

    pub steps: Vec<RawStep>,

    /// Named loop definitions referenced by steps via `loop: <name>`
    #[serde(default)]
    pub loops: HashMap<String, LoopSpec>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// Defaults a step inherits unless it overrides them. Scalar fields shadow
/// individually; `servers`/`skills` on a step REPLACE the context's lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionContext {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Ordered fallback chain tried on transient failure
    #[serde(default)]
    pub providers: Vec<ProviderRef>,
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub log_level: Option<String>,
}

/// A `(provider, model)` pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderRef {
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
}

/// A step as written in YAML. Exactly one of the execution-kind fields
/// (`run`, `loop`, `template`, `consensus`, `embeddings`, `rag`) must be
/// set; the loader rejects anything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawStep {
    pub name: String,

    /// Upstream step names that must complete first
    #[serde(default)]
    pub needs: Vec<String>,

    /// Condition expression gating execution
    #[serde(default, rename = "if")]
    pub condition: Option<String>,

    /// Fan out over a variable's collection
    #[serde(default)]
    pub for_each: Option<String>,
    #[serde(default)]
    pub item_name: Option<String>,

    #[serde(default)]
    pub on_error: Option<OnError>,

    #[serde(default)]
    pub outputs: Option<OutputSpec>,

    // -- execution kinds (exactly one) --
    #[serde(default)]
    pub run: Option<String>,
    /// System prompt for `run` steps
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default, rename = "loop")]
    pub loop_spec: Option<LoopRef>,
    #[serde(default)]
    pub template: Option<TemplateSpec>,
    #[serde(default)]
    pub consensus: Option<ConsensusSpec>,
    #[serde(default)]
    pub embeddings: Option<EmbeddingsSpec>,
    #[serde(default)]
    pub rag: Option<RagStepSpec>,

    // -- execution-context overrides --
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub providers: Option<Vec<ProviderRef>>,
    #[serde(default)]
    pub servers: Option<Vec<String>>,
    #[serde(default)]
    pub skills: Option<Vec<String>>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Either a reference into the workflow's `loops:` section or an inline
/// loop definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoopRef {
    Named(String),
    Inline(LoopSpec),
}

/// A bounded iterative invocation of another workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoopSpec {
    /// Child workflow name
    pub workflow: String,

    pub mode: LoopMode,

    /// `iterate` mode: a JSON array literal, a `{{var}}` reference, or a
    /// `file://` URL
    #[serde(default)]
    pub items: Option<String>,

    /// `refine` mode: exit condition, evaluated by the LLM
    #[serde(default)]
    pub until: Option<String>,

    /// Parameters passed to the child workflow
    #[serde(default)]
    pub with: HashMap<String, Value>,

    /// Hard cap on child invocations; must be positive
    pub max_iterations: u32,

    #[serde(default)]
    pub on_failure: OnFailure,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default)]
    pub timeout_per_item_ms: Option<u64>,

    #[serde(default)]
    pub total_timeout_ms: Option<u64>,

    /// Loop result is a failure when `succeeded / total` lands below this
    #[serde(default)]
    pub min_success_rate: Option<f64>,

    #[serde(default)]
    pub parallel: bool,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_max_workers() -> usize {
    4
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    Iterate,
    Refine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    Halt,
    Continue,
    Retry,
}

impl Default for OnFailure {
    fn default() -> Self {
        OnFailure::Halt
    }
}

/// Synchronous invocation of another workflow with its own scope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateSpec {
    pub name: String,
    #[serde(default)]
    pub with: HashMap<String, Value>,
}

/// Fan out the same prompt to several providers and vote
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsensusSpec {
    pub prompt: String,
    #[serde(default)]
    pub system: Option<String>,
    pub executions: Vec<ProviderRef>,
    #[serde(default)]
    pub require: ConsensusRequirement,
}

/// Agreement rule for consensus steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ConsensusRequirement {
    Unanimous,
    TwoThirds,
    Majority,
}

impl Default for ConsensusRequirement {
    fn default() -> Self {
        ConsensusRequirement::Majority
    }
}

impl TryFrom<String> for ConsensusRequirement {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "unanimous" => Ok(ConsensusRequirement::Unanimous),
            "2/3" | "two_thirds" => Ok(ConsensusRequirement::TwoThirds),
            "majority" => Ok(ConsensusRequirement::Majority),
            other => Err(format!(
                "unknown consensus requirement '{}' (expected unanimous, 2/3, or majority)",
                other
            )),
        }
    }
}

impl From<ConsensusRequirement> for String {
    fn from(r: ConsensusRequirement) -> String {
        match r {
            ConsensusRequirement::Unanimous => "unanimous".to_string(),
            ConsensusRequirement::TwoThirds => "2/3".to_string(),
            ConsensusRequirement::Majority => "majority".to_string(),
        }
    }
}

/// Embeddings pipeline invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmbeddingsSpec {
    /// Text, a `{{var}}` reference resolving to text or an array, or a
    /// `file://` URL
    pub input: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub chunking: Option<ChunkStrategy>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub chunk_overlap: Option<usize>,
    #[serde(default)]
    pub output_format: Option<OutputFormat>,
    #[serde(default)]
    pub output_file: Option<PathBuf>,
}

/// RAG search invocation against a configured service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RagStepSpec {
    pub service: String,
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub filters: Option<Value>,
    #[serde(default)]
    pub output_format: Option<OutputFormat>,
}

/// Retry/fallback policy for a failing step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OnError {
    #[serde(default)]
    pub retry: u32,
    #[serde(default)]
    pub backoff: Backoff,
    /// Step to jump to after retries are exhausted; its output replaces
    /// the failed step's binding
    #[serde(default)]
    pub fallback: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Exponential,
    Linear,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential
    }
}

/// How a step's result is named and shaped in the scope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub transform: Option<Transform>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    Json,
    Text,
    Compact,
}

/// A compiled step: common fields plus the tagged execution kind
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub needs: Vec<String>,
    pub condition: Option<String>,
    pub for_each: Option<String>,
    pub item_name: Option<String>,
    pub on_error: Option<OnError>,
    pub outputs: Option<OutputSpec>,
    pub overrides: StepOverrides,
    pub kind: StepKind,
}

impl Step {
    /// Name under which the step's result is bound in the scope
    pub fn output_name(&self) -> &str {
        self.outputs
            .as_ref()
            .and_then(|o| o.name.as_deref())
            .unwrap_or(&self.name)
    }
}

/// Context overrides carried by a step. `None` means "inherit".
#[derive(Debug, Clone, Default)]
pub struct StepOverrides {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub providers: Option<Vec<ProviderRef>>,
    pub servers: Option<Vec<String>>,
    pub skills: Option<Vec<String>>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub timeout_secs: Option<u64>,
}

/// The disjoint execution kinds
#[derive(Debug, Clone)]
pub enum StepKind {
    Run {
        prompt: String,
        system: Option<String>,
    },
    Loop(LoopSpec),
    Template(TemplateSpec),
    Consensus(ConsensusSpec),
    Embeddings(EmbeddingsSpec),
    Rag(RagStepSpec),
}

impl StepKind {
    pub fn label(&self) -> &'static str {
        match self {
            StepKind::Run { .. } => "run",
            StepKind::Loop(_) => "loop",
            StepKind::Template(_) => "template",
            StepKind::Consensus(_) => "consensus",
            StepKind::Embeddings(_) => "embeddings",
            StepKind::Rag(_) => "rag",
        }
    }
}

/// The execution settings a step actually runs with after inheritance
#[derive(Debug, Clone, Default)]
pub struct EffectiveContext {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub fallbacks: Vec<ProviderRef>,
    pub servers: Vec<String>,
    pub skills: Vec<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub timeout_secs: Option<u64>,
}

impl ExecutionContext {
    /// Resolve a step's effective context: scalar fields shadow
    /// individually, list fields replace wholesale when the step sets
    /// them.
    pub fn resolve(&self, overrides: &StepOverrides) -> EffectiveContext {
        EffectiveContext {
            provider: overrides.provider.clone().or_else(|| self.provider.clone()),
            model: overrides.model.clone().or_else(|| self.model.clone()),
            fallbacks: overrides
                .providers
                .clone()
                .unwrap_or_else(|| self.providers.clone()),
            servers: overrides
                .servers
                .clone()
                .unwrap_or_else(|| self.servers.clone()),
            skills: overrides
                .skills
                .clone()
                .unwrap_or_else(|| self.skills.clone()),
            temperature: overrides.temperature.or(self.temperature),
            max_tokens: overrides.max_tokens.or(self.max_tokens),
            timeout_secs: overrides.timeout_secs.or(self.timeout_secs),
        }
    }
}

/// Errors raised while loading, compiling, or executing workflows
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow '{workflow}': {message}")]
    Validation { workflow: String, message: String },

    #[error("workflow '{workflow}' has a dependency cycle involving step '{step}'")]
    Cycle { workflow: String, step: String },

    #[error("workflow not found: {0}")]
    NotFound(String),

    #[error("step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    #[error("variable not found: {0}")]
    VariableNotFound(String),

    #[error("scope binding '{0}' already exists")]
    ScopeConflict(String),

    #[error("condition error in '{expr}': {message}")]
    Condition { expr: String, message: String },

    #[error("step '{step}' timed out after {seconds}s")]
    Timeout { step: String, seconds: u64 },

    #[error("template recursion exceeds depth {0}")]
    TemplateDepth(u32),

    #[error("workflow cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_from_yaml() {
        let yaml = r#"
$schema: workflow/v2.0
name: test
context:
  provider: local
  temperature: 0.2
steps:
  - name: a
    run: "say hi"
  - name: b
    run: "echo {{a}}"
    needs: [a]
    temperature: 0.7
"#;
        let workflow: Workflow = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(workflow.name, "test");
        assert_eq!(workflow.steps.len(), 2);
        assert_eq!(workflow.steps[1].needs, vec!["a"]);
    }

    #[test]
    fn test_unknown_step_field_rejected() {
        let yaml = r#"
$schema: workflow/v2.0
name: test
steps:
  - name: a
    run: "x"
    retries: 3
"#;
        let err = serde_yaml::from_str::<Workflow>(yaml).unwrap_err();
        assert!(err.to_string().contains("retries"));
    }

    #[test]
    fn test_context_scalar_shadowing() {
        let context = ExecutionContext {
            provider: Some("p1".to_string()),
            model: Some("m1".to_string()),
            temperature: Some(0.1),
            servers: vec!["fs".to_string(), "web".to_string()],
            ..Default::default()
        };
        let overrides = StepOverrides {
            temperature: Some(0.9),
            ..Default::default()
        };

        let effective = context.resolve(&overrides);
        assert_eq!(effective.provider.as_deref(), Some("p1"));
        assert_eq!(effective.temperature, Some(0.9));
        assert_eq!(effective.servers, vec!["fs", "web"]);
    }

    #[test]
    fn test_step_server_list_replaces() {
        let context = ExecutionContext {
            servers: vec!["fs".to_string(), "web".to_string()],
            ..Default::default()
        };
        let overrides = StepOverrides {
            servers: Some(vec!["db".to_string()]),
            ..Default::default()
        };

        let effective = context.resolve(&overrides);
        assert_eq!(effective.servers, vec!["db"]);
    }

    #[test]
    fn test_consensus_requirement_forms() {
        let spec: ConsensusSpec = serde_yaml::from_str(
            r#"
prompt: "vote"
executions:
  - provider: a
  - provider: b
require: "2/3"
"#,
        )
        .unwrap();
        assert_eq!(spec.require, ConsensusRequirement::TwoThirds);
    }

    #[test]
    fn test_loop_ref_named_and_inline() {
        let named: LoopRef = serde_yaml::from_str("refine_pass").unwrap();
        assert!(matches!(named, LoopRef::Named(_)));

        let inline: LoopRef = serde_yaml::from_str(
            r#"
workflow: child
mode: iterate
items: "[1,2,3]"
max_iterations: 5
"#,
        )
        .unwrap();
        assert!(matches!(inline, LoopRef::Inline(_)));
    }
}
