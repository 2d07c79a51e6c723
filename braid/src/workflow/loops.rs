//! Loop execution
//!
//! Two modes share the infrastructure: `iterate` fans the child workflow
//! over a resolved items array, `refine` re-invokes it feeding each
//! result into the next round until the LLM-evaluated `until` condition
//! is satisfied. Both are hard-capped by `max_iterations`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::llm::{CompletionRequest, Message};

use super::engine::{Engine, FailureKind, StepFailure};
use super::subst::{resolve_value, value_to_string};
use super::{EffectiveContext, LoopMode, LoopSpec, OnFailure, Scope, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationOutcome {
    pub index: usize,
    pub status: IterationStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a loop step binds into the scope
#[derive(Debug, Clone, Serialize)]
pub struct LoopExecutionResult {
    pub success: bool,
    pub mode: LoopMode,
    pub total_items: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub iterations: Vec<IterationOutcome>,
    pub duration_ms: u64,
    /// Iterate: per-index outputs. Refine: the final output.
    pub output: Value,
    /// Monotonically appended successful outputs
    pub accumulated: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_success_rate: Option<f64>,
}

pub async fn run_loop(
    engine: &Engine,
    step: &Step,
    spec: &LoopSpec,
    scope: &Scope,
    effective: &EffectiveContext,
    cancel: &CancellationToken,
    depth: u32,
) -> Result<LoopExecutionResult, StepFailure> {
    let started = Instant::now();
    let work = async {
        match spec.mode {
            LoopMode::Iterate => run_iterate(engine, step, spec, scope, cancel, depth, started).await,
            LoopMode::Refine => {
                run_refine(engine, step, spec, scope, effective, cancel, depth, started).await
            }
        }
    };

    match spec.total_timeout_ms {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), work).await {
            Ok(result) => result,
            Err(_) => Err(StepFailure::new_loop(
                &step.name,
                format!("loop exceeded total timeout of {}ms", ms),
            )),
        },
        None => work.await,
    }
}

impl StepFailure {
    fn new_loop(step: &str, message: String) -> Self {
        StepFailure {
            step: step.to_string(),
            message,
            kind: FailureKind::Other,
        }
    }
}

/// Resolve the `items` expression: a `{{var}}` reference, a JSON array
/// literal, or a `file://` URL.
async fn resolve_items(
    engine: &Engine,
    items: &str,
    scope: &Scope,
) -> Result<Vec<Value>, String> {
    let strict = engine.config().settings.strict_substitution;
    let resolved =
        resolve_value(items, scope, strict).map_err(|e| format!("items: {}", e))?;

    match resolved {
        Value::Array(items) => Ok(items),
        Value::String(s) => {
            let s = s.trim().to_string();
            if let Some(path) = s.strip_prefix("file://") {
                let text = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| format!("items file {}: {}", path, e))?;
                serde_json::from_str::<Vec<Value>>(&text)
                    .map_err(|e| format!("items file is not a JSON array: {}", e))
            } else if s.starts_with('[') {
                serde_json::from_str::<Vec<Value>>(&s)
                    .map_err(|e| format!("items is not a JSON array: {}", e))
            } else {
                Err(format!("items '{}' did not resolve to an array", s))
            }
        }
        other => Err(format!("items resolved to {}, expected an array", other)),
    }
}

/// One child-workflow invocation with the per-iteration retry policy.
async fn run_child(
    engine: &Engine,
    spec: &LoopSpec,
    initial: HashMap<String, Value>,
    input: Value,
    cancel: &CancellationToken,
    depth: u32,
) -> Result<Value, String> {
    let attempts = match spec.on_failure {
        OnFailure::Retry => spec.max_retries + 1,
        _ => 1,
    };

    let mut last_error = String::new();
    for attempt in 0..attempts {
        if attempt > 0 {
            debug!(attempt, "retrying loop iteration");
            tokio::time::sleep(Duration::from_millis(spec.retry_delay_ms)).await;
        }

        let child_cancel = cancel.child_token();
        let run = async {
            engine
                .run_with(&spec.workflow, initial.clone(), input.clone(), &child_cancel, depth + 1)
                .await
        };
        let result = match spec.timeout_per_item_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), run).await {
                Ok(result) => result,
                Err(_) => {
                    child_cancel.cancel();
                    last_error = format!("iteration exceeded {}ms", ms);
                    continue;
                }
            },
            None => run.await,
        };

        match result {
            Ok(run) if run.success => return Ok(run.result),
            Ok(run) => {
                last_error = run
                    .failure
                    .map(|f| f.message)
                    .unwrap_or_else(|| "child workflow failed".to_string());
            }
            Err(e) => last_error = e.to_string(),
        }
    }
    Err(last_error)
}

fn resolve_with(
    engine: &Engine,
    spec: &LoopSpec,
    scope: &Scope,
) -> Result<HashMap<String, Value>, String> {
    let strict = engine.config().settings.strict_substitution;
    let mut with = HashMap::new();
    for (key, value) in &spec.with {
        let resolved = match value {
            Value::String(s) => resolve_value(s, scope, strict).map_err(|e| e.to_string())?,
            other => other.clone(),
        };
        with.insert(key.clone(), resolved);
    }
    Ok(with)
}

#[allow(clippy::too_many_arguments)]
async fn run_iterate(
    engine: &Engine,
    step: &Step,
    spec: &LoopSpec,
    scope: &Scope,
    cancel: &CancellationToken,
    depth: u32,
    started: Instant,
) -> Result<LoopExecutionResult, StepFailure> {
    let items_expr = spec.items.as_deref().unwrap_or_default();
    let mut items = resolve_items(engine, items_expr, scope)
        .await
        .map_err(|m| StepFailure::new_loop(&step.name, m))?;
    if items.len() > spec.max_iterations as usize {
        debug!(
            step = %step.name,
            dropped = items.len() - spec.max_iterations as usize,
            "items truncated to max_iterations"
        );
        items.truncate(spec.max_iterations as usize);
    }
    let total = items.len();
    let with = resolve_with(engine, spec, scope)
        .map_err(|m| StepFailure::new_loop(&step.name, m))?;

    info!(step = %step.name, total, parallel = spec.parallel, "iterate loop");

    let mut outcomes: Vec<IterationOutcome> = Vec::with_capacity(total);
    let mut outputs: Vec<Value> = vec![Value::Null; total];
    let mut halted = None;

    if spec.parallel {
        let results: Vec<(usize, Duration, Result<Value, String>)> =
            futures_util::stream::iter(items.into_iter().enumerate().map(|(i, item)| {
                let mut initial = with.clone();
                initial.insert("item".to_string(), item.clone());
                initial.insert("index".to_string(), Value::from(i));
                async move {
                    let begun = Instant::now();
                    let result = run_child(engine, spec, initial, item, cancel, depth).await;
                    (i, begun.elapsed(), result)
                }
            }))
            .buffered(spec.max_workers.max(1))
            .collect()
            .await;

        for (i, duration, result) in results {
            match result {
                Ok(output) => {
                    outputs[i] = output;
                    outcomes.push(IterationOutcome {
                        index: i,
                        status: IterationStatus::Succeeded,
                        duration_ms: duration.as_millis() as u64,
                        error: None,
                    });
                }
                Err(error) => {
                    outcomes.push(IterationOutcome {
                        index: i,
                        status: IterationStatus::Failed,
                        duration_ms: duration.as_millis() as u64,
                        error: Some(error.clone()),
                    });
                    if spec.on_failure != OnFailure::Continue {
                        halted = Some(error);
                    }
                }
            }
        }
    } else {
        for (i, item) in items.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(StepFailure::new_loop(&step.name, "cancelled".to_string()));
            }
            let mut initial = with.clone();
            initial.insert("item".to_string(), item.clone());
            initial.insert("index".to_string(), Value::from(i));

            let begun = Instant::now();
            match run_child(engine, spec, initial, item, cancel, depth).await {
                Ok(output) => {
                    outputs[i] = output;
                    outcomes.push(IterationOutcome {
                        index: i,
                        status: IterationStatus::Succeeded,
                        duration_ms: begun.elapsed().as_millis() as u64,
                        error: None,
                    });
                }
                Err(error) => {
                    outcomes.push(IterationOutcome {
                        index: i,
                        status: IterationStatus::Failed,
                        duration_ms: begun.elapsed().as_millis() as u64,
                        error: Some(error.clone()),
                    });
                    if spec.on_failure == OnFailure::Continue {
                        continue;
                    }
                    // remaining items are never started
                    for j in i + 1..total {
                        outcomes.push(IterationOutcome {
                            index: j,
                            status: IterationStatus::Skipped,
                            duration_ms: 0,
                            error: None,
                        });
                    }
                    halted = Some(error);
                    break;
                }
            }
        }
    }

    if let Some(error) = halted {
        return Err(StepFailure::new_loop(
            &step.name,
            format!("loop halted: {}", error),
        ));
    }

    finish(spec, LoopMode::Iterate, total, outcomes, outputs, started)
}

#[allow(clippy::too_many_arguments)]
async fn run_refine(
    engine: &Engine,
    step: &Step,
    spec: &LoopSpec,
    scope: &Scope,
    effective: &EffectiveContext,
    cancel: &CancellationToken,
    depth: u32,
    started: Instant,
) -> Result<LoopExecutionResult, StepFailure> {
    let until = spec.until.as_deref().unwrap_or_default();
    let with = resolve_with(engine, spec, scope)
        .map_err(|m| StepFailure::new_loop(&step.name, m))?;
    let input = scope.lookup("input").unwrap_or(Value::Null);

    let mut outcomes: Vec<IterationOutcome> = Vec::new();
    let mut accumulated: Vec<Value> = Vec::new();
    let mut previous = Value::Null;
    let mut satisfied = false;

    for iteration in 0..spec.max_iterations as usize {
        if cancel.is_cancelled() {
            return Err(StepFailure::new_loop(&step.name, "cancelled".to_string()));
        }

        let mut initial = with.clone();
        initial.insert("iteration".to_string(), Value::from(iteration));
        if !previous.is_null() {
            initial.insert("previous_result".to_string(), previous.clone());
        }

        let begun = Instant::now();
        match run_child(engine, spec, initial, input.clone(), cancel, depth).await {
            Ok(output) => {
                outcomes.push(IterationOutcome {
                    index: iteration,
                    status: IterationStatus::Succeeded,
                    duration_ms: begun.elapsed().as_millis() as u64,
                    error: None,
                });
                accumulated.push(output.clone());
                previous = output;
            }
            Err(error) => {
                outcomes.push(IterationOutcome {
                    index: iteration,
                    status: IterationStatus::Failed,
                    duration_ms: begun.elapsed().as_millis() as u64,
                    error: Some(error.clone()),
                });
                if spec.on_failure == OnFailure::Continue {
                    continue;
                }
                return Err(StepFailure::new_loop(
                    &step.name,
                    format!("loop halted: {}", error),
                ));
            }
        }

        if evaluate_until(engine, until, &previous, effective, cancel).await? {
            info!(step = %step.name, iteration, "until condition satisfied");
            satisfied = true;
            break;
        }
    }
    if !satisfied {
        warn!(step = %step.name, "refine loop hit max_iterations without satisfying until");
    }

    let total = outcomes.len();
    let output = previous.clone();
    let mut result = finish(spec, LoopMode::Refine, total, outcomes, accumulated.clone(), started)?;
    result.output = output;
    result.accumulated = accumulated;
    Ok(result)
}

/// The `until` condition is offered to the LLM evaluator: a yes/no
/// instruction over the current accumulated result.
async fn evaluate_until(
    engine: &Engine,
    until: &str,
    current: &Value,
    effective: &EffectiveContext,
    cancel: &CancellationToken,
) -> Result<bool, StepFailure> {
    let provider_name = effective
        .provider
        .as_deref()
        .or_else(|| engine.default_provider())
        .ok_or_else(|| {
            StepFailure::new_loop("until", "no provider configured for until evaluation".to_string())
        })?;
    let provider = engine
        .providers()
        .create(provider_name, effective.model.as_deref())
        .map_err(|e| StepFailure::new_loop("until", e.to_string()))?;

    let request = CompletionRequest {
        messages: vec![
            Message::system(
                "You are a loop-termination evaluator. Reply with exactly YES or NO.",
            ),
            Message::user(format!(
                "Condition: {}\n\nCurrent result:\n{}\n\nIs the condition satisfied?",
                until,
                value_to_string(current)
            )),
        ],
        max_tokens: Some(8),
        ..Default::default()
    };

    let response = tokio::select! {
        _ = cancel.cancelled() => {
            return Err(StepFailure::new_loop("until", "cancelled".to_string()))
        }
        result = provider.complete(request) => {
            result.map_err(|e| StepFailure::new_loop("until", e.to_string()))?
        }
    };

    let verdict = response.content.trim().to_lowercase();
    Ok(verdict.starts_with('y') || verdict == "true")
}

fn finish(
    spec: &LoopSpec,
    mode: LoopMode,
    total: usize,
    outcomes: Vec<IterationOutcome>,
    outputs: Vec<Value>,
    started: Instant,
) -> Result<LoopExecutionResult, StepFailure> {
    let succeeded = outcomes
        .iter()
        .filter(|o| o.status == IterationStatus::Succeeded)
        .count();
    let failed = outcomes
        .iter()
        .filter(|o| o.status == IterationStatus::Failed)
        .count();
    let skipped = outcomes
        .iter()
        .filter(|o| o.status == IterationStatus::Skipped)
        .count();

    let rate = if total == 0 {
        1.0
    } else {
        succeeded as f64 / total as f64
    };
    let success = match spec.min_success_rate {
        Some(min) => rate + f64::EPSILON >= min,
        None => failed == 0,
    };

    let accumulated: Vec<Value> = outputs.iter().filter(|v| !v.is_null()).cloned().collect();
    Ok(LoopExecutionResult {
        success,
        mode,
        total_items: total,
        succeeded,
        failed,
        skipped,
        iterations: outcomes,
        duration_ms: started.elapsed().as_millis() as u64,
        output: Value::Array(outputs),
        accumulated,
        actual_success_rate: spec.min_success_rate.map(|_| rate),
    })
}
