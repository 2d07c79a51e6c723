//! Workflow execution engine
//!
//! Executes a compiled workflow: steps run in dependency order with
//! condition gates, `for_each` fan-out, retry/fallback policies, and a
//! per-workflow variable scope. Loops, templates, consensus, embeddings,
//! and RAG steps dispatch to their own runners. A root cancellation
//! token per run is derived into every child step, child workflow, and
//! provider/MCP request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::embeddings::{self, PipelineSpec};
use crate::llm::{
    run_tool_loop, AttachedTool, CompletionRequest, LlmError, Message, ProviderFactory,
    ProviderSource, ToolRouter, DEFAULT_TOOL_FOLLOW_UP,
};
use crate::mcp::McpPool;
use crate::rag::{RagSearchArgs, RagService};
use crate::skills::SkillRegistry;

use super::compile::{compile_all, CompiledWorkflow};
use super::consensus::run_consensus;
use super::loops::run_loop;
use super::scope::ItemScope;
use super::subst::{resolve_value, substitute, value_to_string};
use super::{
    cond, Backoff, EffectiveContext, Scope, Step, StepKind, Transform, WorkflowError,
};

/// Concurrency cap for `for_each` fan-out groups
const FAN_OUT_WORKERS: usize = 4;
/// Base delay for step retry backoff
const STEP_RETRY_BASE: Duration = Duration::from_millis(500);

/// Why a step failed; drives retry, fallback, and process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ProviderNotFound,
    Provider,
    Tool,
    Server,
    Timeout,
    Condition,
    Other,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepFailure {
    pub step: String,
    pub message: String,
    pub kind: FailureKind,
}

impl StepFailure {
    fn new(step: &str, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            step: step.to_string(),
            message: message.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub name: String,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The outcome of one workflow run. Step failures do not discard the
/// scope: completed outputs stay visible for inspection.
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub result: Value,
    pub scope: HashMap<String, Value>,
    pub steps: Vec<StepOutcome>,
    pub success: bool,
    pub failure: Option<StepFailure>,
}

pub struct Engine {
    config: Arc<AppConfig>,
    workflows: HashMap<String, Arc<CompiledWorkflow>>,
    providers: Arc<dyn ProviderSource>,
    pool: Arc<McpPool>,
    rag: HashMap<String, Arc<RagService>>,
    skills: SkillRegistry,
}

pub struct EngineBuilder {
    config: Arc<AppConfig>,
    providers: Option<Arc<dyn ProviderSource>>,
    pool: Option<Arc<McpPool>>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            providers: None,
            pool: None,
        }
    }

    /// Inject a provider source; tests use stubs here.
    pub fn providers(mut self, providers: Arc<dyn ProviderSource>) -> Self {
        self.providers = Some(providers);
        self
    }

    pub fn pool(mut self, pool: Arc<McpPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn build(self) -> Result<Arc<Engine>, WorkflowError> {
        let compiled = compile_all(&self.config)?;
        let workflows: HashMap<String, Arc<CompiledWorkflow>> = compiled
            .into_iter()
            .map(|(k, v)| (k, Arc::new(v)))
            .collect();

        let providers = self
            .providers
            .unwrap_or_else(|| Arc::new(ProviderFactory::new(&self.config)) as Arc<dyn ProviderSource>);
        let pool = self
            .pool
            .unwrap_or_else(|| Arc::new(McpPool::new(self.config.servers.clone())));

        let rag = self
            .config
            .rag
            .iter()
            .map(|(name, config)| {
                (
                    name.clone(),
                    Arc::new(RagService::new(
                        name.clone(),
                        config.clone(),
                        pool.clone(),
                        providers.clone(),
                        self.config.settings.expansions.clone(),
                        self.config.settings.max_expansions,
                    )),
                )
            })
            .collect();

        Ok(Arc::new(Engine {
            skills: SkillRegistry::new(self.config.settings.skills.clone()),
            config: self.config,
            workflows,
            providers,
            pool,
            rag,
        }))
    }
}

impl Engine {
    pub fn new(config: AppConfig) -> Result<Arc<Self>, WorkflowError> {
        EngineBuilder::new(config).build()
    }

    pub fn builder(config: AppConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<McpPool> {
        &self.pool
    }

    pub fn workflow_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workflows.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_workflow(&self, name: &str) -> bool {
        self.workflows.contains_key(name)
    }

    fn strict(&self) -> bool {
        self.config.settings.strict_substitution
    }

    /// Run a workflow against an initial input value.
    pub async fn run(
        &self,
        name: &str,
        input: Value,
        cancel: &CancellationToken,
    ) -> Result<WorkflowRun, WorkflowError> {
        self.run_with(name, HashMap::new(), input, cancel, 0).await
    }

    /// Run with explicit initial variables (template/loop/facade entry).
    /// Boxed because templates and loops recurse back into it.
    pub fn run_with<'a>(
        &'a self,
        name: &'a str,
        initial: HashMap<String, Value>,
        input: Value,
        cancel: &'a CancellationToken,
        depth: u32,
    ) -> BoxFuture<'a, Result<WorkflowRun, WorkflowError>> {
        Box::pin(async move {
            let max_depth = self.config.settings.max_template_depth;
            if depth > max_depth {
                return Err(WorkflowError::TemplateDepth(max_depth));
            }
            let compiled = self
                .workflows
                .get(name)
                .ok_or_else(|| WorkflowError::NotFound(name.to_string()))?
                .clone();

            info!(workflow = name, depth, "running workflow");
            let mut scope = Scope::child(compiled.workflow.env.clone(), initial);
            // An explicit `input` from with/input_mapping wins over the
            // caller's raw input value.
            if !scope.contains("input") {
                scope.set_input(input);
            }

            let mut outcomes: Vec<StepOutcome> = Vec::new();
            let mut last_output = Value::Null;

            for &index in &compiled.order {
                if cancel.is_cancelled() {
                    return Err(WorkflowError::Cancelled);
                }
                let step = &compiled.steps[index];

                if let Some(expr) = &step.condition {
                    match cond::evaluate(expr, &scope) {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!(step = %step.name, "condition false, skipping");
                            outcomes.push(StepOutcome {
                                name: step.name.clone(),
                                status: StepStatus::Skipped,
                                duration_ms: 0,
                                error: None,
                            });
                            continue;
                        }
                        Err(e) => {
                            let failure =
                                StepFailure::new(&step.name, FailureKind::Condition, e.to_string());
                            outcomes.push(StepOutcome {
                                name: step.name.clone(),
                                status: StepStatus::Failed,
                                duration_ms: 0,
                                error: Some(failure.message.clone()),
                            });
                            return Ok(WorkflowRun {
                                result: Value::Null,
                                scope: scope.snapshot(),
                                steps: outcomes,
                                success: false,
                                failure: Some(failure),
                            });
                        }
                    }
                }

                let started = Instant::now();
                let result = self
                    .execute_step(&compiled, step, &scope, cancel, depth)
                    .await;
                let duration_ms = started.elapsed().as_millis() as u64;

                match result {
                    Ok(value) => {
                        let value = apply_transform(step, value);
                        scope.bind(step.output_name(), value.clone())?;
                        last_output = value;
                        outcomes.push(StepOutcome {
                            name: step.name.clone(),
                            status: StepStatus::Succeeded,
                            duration_ms,
                            error: None,
                        });
                    }
                    Err(failure) => {
                        if cancel.is_cancelled() {
                            return Err(WorkflowError::Cancelled);
                        }
                        warn!(step = %step.name, error = %failure.message, "step failed");
                        outcomes.push(StepOutcome {
                            name: step.name.clone(),
                            status: StepStatus::Failed,
                            duration_ms,
                            error: Some(failure.message.clone()),
                        });
                        return Ok(WorkflowRun {
                            result: Value::Null,
                            scope: scope.snapshot(),
                            steps: outcomes,
                            success: false,
                            failure: Some(failure),
                        });
                    }
                }
            }

            Ok(WorkflowRun {
                result: last_output,
                scope: scope.snapshot(),
                steps: outcomes,
                success: true,
                failure: None,
            })
        })
    }

    /// One step: `for_each` fan-out plus the retry/fallback policy.
    fn execute_step<'a>(
        &'a self,
        compiled: &'a Arc<CompiledWorkflow>,
        step: &'a Step,
        scope: &'a Scope,
        cancel: &'a CancellationToken,
        depth: u32,
    ) -> BoxFuture<'a, Result<Value, StepFailure>> {
        Box::pin(async move {
            let effective = compiled.workflow.context.resolve(&step.overrides);

            if let Some(for_each) = &step.for_each {
                let collection = resolve_value(for_each, scope, self.strict())
                    .map_err(|e| StepFailure::new(&step.name, FailureKind::Other, e.to_string()))?;
                let items = match collection {
                    Value::Array(items) => items,
                    other => {
                        return Err(StepFailure::new(
                            &step.name,
                            FailureKind::Other,
                            format!("for_each expects an array, got {}", other),
                        ))
                    }
                };

                let item_name = step.item_name.clone().unwrap_or_else(|| "item".to_string());
                // Fan-out siblings run concurrently; results come back in
                // index order so the aggregate binding is deterministic.
                let results: Vec<Result<Value, StepFailure>> =
                    futures_util::stream::iter(items.into_iter().enumerate().map(|(i, item)| {
                        let item_scope = scope.with_item(ItemScope {
                            name: item_name.clone(),
                            item,
                            index: i,
                            iteration: i,
                        });
                        let effective = effective.clone();
                        async move {
                            self.execute_with_retry(compiled, step, &item_scope, &effective, cancel, depth)
                                .await
                        }
                    }))
                    .buffered(FAN_OUT_WORKERS)
                    .collect()
                    .await;

                let mut outputs = Vec::with_capacity(results.len());
                for result in results {
                    outputs.push(result?);
                }
                Ok(Value::Array(outputs))
            } else {
                self.execute_with_retry(compiled, step, scope, &effective, cancel, depth)
                    .await
            }
        })
    }

    /// Retry with configured backoff; after exhaustion, jump to the
    /// fallback step when one is set.
    fn execute_with_retry<'a>(
        &'a self,
        compiled: &'a Arc<CompiledWorkflow>,
        step: &'a Step,
        scope: &'a Scope,
        effective: &'a EffectiveContext,
        cancel: &'a CancellationToken,
        depth: u32,
    ) -> BoxFuture<'a, Result<Value, StepFailure>> {
        Box::pin(async move {
            let retries = step.on_error.as_ref().map(|o| o.retry).unwrap_or(0);
            let backoff = step
                .on_error
                .as_ref()
                .map(|o| o.backoff)
                .unwrap_or(Backoff::Exponential);

            let mut last_failure = None;
            for attempt in 0..=retries {
                if attempt > 0 {
                    let delay = match backoff {
                        Backoff::Exponential => {
                            STEP_RETRY_BASE.saturating_mul(2u32.saturating_pow(attempt - 1))
                        }
                        Backoff::Linear => STEP_RETRY_BASE.saturating_mul(attempt),
                    };
                    warn!(step = %step.name, attempt, "retrying step");
                    tokio::time::sleep(delay).await;
                }
                if cancel.is_cancelled() {
                    return Err(StepFailure::new(&step.name, FailureKind::Other, "cancelled"));
                }

                match self
                    .execute_kind(step, scope, effective, cancel, depth)
                    .await
                {
                    Ok(value) => return Ok(value),
                    Err(failure) => last_failure = Some(failure),
                }
            }
            let failure = last_failure.unwrap();

            if let Some(fallback) = step.on_error.as_ref().and_then(|o| o.fallback.as_deref()) {
                info!(step = %step.name, fallback, "jumping to fallback step");
                let fallback_step = compiled.step(fallback).ok_or_else(|| {
                    StepFailure::new(&step.name, FailureKind::Other, "fallback step missing")
                })?;
                // The fallback sees the failed step's inputs; its output
                // replaces the failed step's binding.
                return self
                    .execute_step(compiled, fallback_step, scope, cancel, depth)
                    .await;
            }

            Err(failure)
        })
    }

    async fn execute_kind(
        &self,
        step: &Step,
        scope: &Scope,
        effective: &EffectiveContext,
        cancel: &CancellationToken,
        depth: u32,
    ) -> Result<Value, StepFailure> {
        let work = self.dispatch_kind(step, scope, effective, cancel, depth);
        match effective.timeout_secs {
            Some(seconds) => {
                match tokio::time::timeout(Duration::from_secs(seconds), work).await {
                    Ok(result) => result,
                    Err(_) => Err(StepFailure::new(
                        &step.name,
                        FailureKind::Timeout,
                        format!("timed out after {}s", seconds),
                    )),
                }
            }
            None => work.await,
        }
    }

    async fn dispatch_kind(
        &self,
        step: &Step,
        scope: &Scope,
        effective: &EffectiveContext,
        cancel: &CancellationToken,
        depth: u32,
    ) -> Result<Value, StepFailure> {
        let strict = self.strict();
        let fail_subst =
            |e: WorkflowError| StepFailure::new(&step.name, FailureKind::Other, e.to_string());

        match &step.kind {
            StepKind::Run { prompt, system } => {
                let prompt = substitute(prompt, scope, strict).map_err(fail_subst)?;
                let system = match system {
                    Some(s) => Some(substitute(s, scope, strict).map_err(fail_subst)?),
                    None => None,
                };
                self.execute_run(step, &prompt, system.as_deref(), effective, cancel)
                    .await
            }

            StepKind::Template(spec) => {
                let mut initial = HashMap::new();
                for (key, value) in &spec.with {
                    initial.insert(key.clone(), resolve_with_param(value, scope, strict).map_err(fail_subst)?);
                }
                let input = scope.lookup("input").unwrap_or(Value::Null);
                let child = cancel.child_token();
                let run = self
                    .run_with(&spec.name, initial, input, &child, depth + 1)
                    .await
                    .map_err(|e| StepFailure::new(&step.name, FailureKind::Other, e.to_string()))?;
                if !run.success {
                    let message = run
                        .failure
                        .map(|f| format!("{} (in step '{}')", f.message, f.step))
                        .unwrap_or_else(|| "child workflow failed".to_string());
                    return Err(StepFailure::new(&step.name, FailureKind::Other, message));
                }
                Ok(run.result)
            }

            StepKind::Loop(spec) => {
                let result = run_loop(self, step, spec, scope, effective, cancel, depth).await?;
                serde_json::to_value(&result)
                    .map_err(|e| StepFailure::new(&step.name, FailureKind::Other, e.to_string()))
            }

            StepKind::Consensus(spec) => {
                let prompt = substitute(&spec.prompt, scope, strict).map_err(fail_subst)?;
                let system = match &spec.system {
                    Some(s) => Some(substitute(s, scope, strict).map_err(fail_subst)?),
                    None => None,
                };
                let result = run_consensus(
                    self.providers.as_ref(),
                    spec,
                    &prompt,
                    system.as_deref(),
                    effective,
                    cancel,
                )
                .await;
                serde_json::to_value(&result)
                    .map_err(|e| StepFailure::new(&step.name, FailureKind::Other, e.to_string()))
            }

            StepKind::Embeddings(spec) => {
                let provider_name = spec
                    .provider
                    .as_deref()
                    .or(effective.provider.as_deref())
                    .or(self.config.embeddings.provider.as_deref())
                    .or(self.config.settings.default_provider.as_deref())
                    .ok_or_else(|| {
                        StepFailure::new(&step.name, FailureKind::Provider, "no provider configured")
                    })?;
                let provider = self
                    .providers
                    .create(provider_name, None)
                    .map_err(|e| self.provider_failure(&step.name, e))?;

                let defaults = &self.config.embeddings;
                let pipeline_spec = PipelineSpec {
                    model: spec.model.clone().or_else(|| defaults.model.clone()),
                    chunking: spec.chunking.unwrap_or(defaults.chunking),
                    chunk_size: spec.chunk_size.unwrap_or(defaults.chunk_size),
                    chunk_overlap: spec.chunk_overlap.unwrap_or(defaults.chunk_overlap),
                    output_format: spec.output_format.unwrap_or(defaults.output_format),
                    output_file: spec.output_file.clone(),
                };
                let input = resolve_value(&spec.input, scope, strict).map_err(fail_subst)?;

                embeddings::run(provider.as_ref(), &input, &pipeline_spec)
                    .await
                    .map_err(|e| StepFailure::new(&step.name, FailureKind::Provider, e.to_string()))
            }

            StepKind::Rag(spec) => {
                let service = self.rag.get(&spec.service).ok_or_else(|| {
                    StepFailure::new(
                        &step.name,
                        FailureKind::Other,
                        format!("unknown rag service '{}'", spec.service),
                    )
                })?;
                let query = substitute(&spec.query, scope, strict).map_err(fail_subst)?;
                service
                    .execute(&query, spec.top_k, spec.filters.clone(), cancel)
                    .await
                    .map_err(|e| StepFailure::new(&step.name, FailureKind::Tool, e.to_string()))
            }
        }
    }

    /// A `run` step: assemble the completion request, gather tools from
    /// the attached MCP servers plus skills and RAG, and drive the
    /// tool-call loop through the fallback chain.
    async fn execute_run(
        &self,
        step: &Step,
        prompt: &str,
        system: Option<&str>,
        effective: &EffectiveContext,
        cancel: &CancellationToken,
    ) -> Result<Value, StepFailure> {
        // System prompt: step text, then skills, then server prompts.
        let mut system_parts: Vec<String> = Vec::new();
        if let Some(s) = system {
            if !s.is_empty() {
                system_parts.push(s.to_string());
            }
        }
        system_parts.extend(self.skills.prompts(&effective.skills));
        system_parts.extend(self.pool.system_prompts(&effective.servers).await);

        let mut tools: Vec<AttachedTool> = Vec::new();
        if !effective.servers.is_empty() {
            let descriptors = self
                .pool
                .tools(&effective.servers)
                .await
                .map_err(|e| StepFailure::new(&step.name, FailureKind::Server, e.to_string()))?;
            tools.extend(descriptors.into_iter().map(|d| AttachedTool {
                server: d.server,
                spec: crate::llm::ToolSpec {
                    name: d.name,
                    description: d.description.unwrap_or_default(),
                    parameters: d.input_schema,
                },
            }));
        }

        let mut rag_routes: HashMap<String, Arc<RagService>> = HashMap::new();
        for (name, service) in &self.rag {
            let exposed = if self.rag.len() == 1 {
                "rag_search".to_string()
            } else {
                format!("rag_search_{}", name.replace(|c: char| !c.is_alphanumeric(), "_"))
            };
            tools.push(AttachedTool {
                server: "__rag".to_string(),
                spec: service.tool_spec(&exposed),
            });
            rag_routes.insert(exposed, service.clone());
        }

        let mut messages = Vec::new();
        if !system_parts.is_empty() {
            messages.push(Message::system(system_parts.join("\n\n")));
        }
        messages.push(Message::user(prompt));
        let request = CompletionRequest {
            messages,
            temperature: effective.temperature,
            max_tokens: effective.max_tokens,
            ..Default::default()
        };

        let max_follow_up = self
            .pool
            .max_tool_follow_up(&effective.servers)
            .await
            .or(self.config.settings.max_tool_follow_up)
            .unwrap_or(DEFAULT_TOOL_FOLLOW_UP);

        let router = EngineRouter {
            pool: self.pool.clone(),
            rag: rag_routes,
        };

        // Primary provider first, then the fallback chain on transient
        // failures. Non-retryable failures short-circuit.
        let mut chain: Vec<(String, Option<String>)> = Vec::new();
        let primary = effective
            .provider
            .clone()
            .or_else(|| self.config.settings.default_provider.clone())
            .ok_or_else(|| {
                StepFailure::new(&step.name, FailureKind::Provider, "no provider configured")
            })?;
        chain.push((primary, effective.model.clone()));
        for fallback in &effective.fallbacks {
            chain.push((fallback.provider.clone(), fallback.model.clone()));
        }

        let last = chain.len() - 1;
        for (i, (provider_name, model)) in chain.into_iter().enumerate() {
            let provider = self
                .providers
                .create(&provider_name, model.as_deref())
                .map_err(|e| self.provider_failure(&step.name, e))?;

            match run_tool_loop(
                provider.as_ref(),
                &router,
                request.clone(),
                &tools,
                max_follow_up,
                cancel,
            )
            .await
            {
                Ok(response) => return Ok(Value::String(response.content)),
                Err(e) if e.is_retryable() && i < last => {
                    warn!(step = %step.name, provider = %provider_name, error = %e,
                          "transient provider failure, trying fallback");
                }
                Err(e) => return Err(self.provider_failure(&step.name, e)),
            }
        }
        unreachable!("fallback chain always returns")
    }

    fn provider_failure(&self, step: &str, error: LlmError) -> StepFailure {
        let kind = match &error {
            LlmError::ProviderNotFound(_) => FailureKind::ProviderNotFound,
            LlmError::Timeout => FailureKind::Timeout,
            _ => FailureKind::Provider,
        };
        StepFailure::new(step, kind, error.to_string())
    }

    pub(super) fn providers(&self) -> &Arc<dyn ProviderSource> {
        &self.providers
    }

    pub(super) fn default_provider(&self) -> Option<&str> {
        self.config.settings.default_provider.as_deref()
    }
}

/// `with:` parameters: strings go through substitution, everything else
/// passes verbatim.
fn resolve_with_param(value: &Value, scope: &Scope, strict: bool) -> Result<Value, WorkflowError> {
    match value {
        Value::String(s) => resolve_value(s, scope, strict),
        other => Ok(other.clone()),
    }
}

fn apply_transform(step: &Step, value: Value) -> Value {
    let transform = step.outputs.as_ref().and_then(|o| o.transform);
    match transform {
        None => value,
        Some(Transform::Text) => Value::String(value_to_string(&value)),
        Some(Transform::Compact) => {
            Value::String(serde_json::to_string(&value).unwrap_or_default())
        }
        Some(Transform::Json) => match value {
            Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
            other => other,
        },
    }
}

/// Routes model tool calls either to the MCP pool or to a synthesized
/// RAG search tool.
struct EngineRouter {
    pool: Arc<McpPool>,
    rag: HashMap<String, Arc<RagService>>,
}

#[async_trait]
impl ToolRouter for EngineRouter {
    async fn call(&self, server: &str, tool: &str, arguments: Value) -> anyhow::Result<String> {
        if server == "__rag" {
            let service = self
                .rag
                .get(tool)
                .ok_or_else(|| anyhow::anyhow!("unknown rag tool '{}'", tool))?;
            let args: RagSearchArgs = serde_json::from_value(arguments)
                .map_err(|e| anyhow::anyhow!("invalid rag_search arguments: {}", e))?;
            let result = service
                .execute(&args.query, args.top_k, None, &CancellationToken::new())
                .await?;
            return Ok(serde_json::to_string(&result)?);
        }
        self.pool
            .call(server, tool, arguments, &CancellationToken::new())
            .await
            .map_err(Into::into)
    }
}
