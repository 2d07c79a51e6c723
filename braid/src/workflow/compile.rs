//! Workflow compilation and validation
//!
//! Turns a parsed [`Workflow`] into a [`CompiledWorkflow`]: step names
//! checked for uniqueness, exactly one execution kind per step, `needs`
//! resolved, the graph topologically sorted (a cycle is a load-time
//! error), and loop bounds verified. Cross-workflow and cross-config
//! references are checked by [`compile_all`].

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::Value;

use crate::config::AppConfig;

use super::{
    LoopRef, LoopSpec, RawStep, Step, StepKind, StepOverrides, Workflow, WorkflowError,
    WORKFLOW_SCHEMA,
};

/// A validated, topologically sorted workflow
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    pub key: String,
    pub workflow: Workflow,
    pub steps: Vec<Step>,
    /// Indices into `steps` in topological order
    pub order: Vec<usize>,
    pub index: HashMap<String, usize>,
}

impl CompiledWorkflow {
    /// Canonical serialised form; re-parsing it yields an equal graph.
    pub fn canonical_form(&self) -> Value {
        serde_json::to_value(&self.workflow).unwrap_or(Value::Null)
    }

    /// Graph signature for equality checks: `(name, sorted needs)` in
    /// topological order.
    pub fn graph_signature(&self) -> Vec<(String, Vec<String>)> {
        self.order
            .iter()
            .map(|&i| {
                let step = &self.steps[i];
                let mut needs = step.needs.clone();
                needs.sort();
                (step.name.clone(), needs)
            })
            .collect()
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.index.get(name).map(|&i| &self.steps[i])
    }
}

/// Compile one workflow under its logical key.
pub fn compile(key: &str, workflow: &Workflow) -> Result<CompiledWorkflow, WorkflowError> {
    let fail = |message: String| WorkflowError::Validation {
        workflow: key.to_string(),
        message,
    };

    if workflow.schema != WORKFLOW_SCHEMA {
        return Err(fail(format!(
            "unsupported schema '{}' (expected {})",
            workflow.schema, WORKFLOW_SCHEMA
        )));
    }
    if workflow.steps.is_empty() {
        return Err(fail("workflow has no steps".to_string()));
    }

    // Unique names
    let mut index: HashMap<String, usize> = HashMap::new();
    for (i, raw) in workflow.steps.iter().enumerate() {
        if index.insert(raw.name.clone(), i).is_some() {
            return Err(fail(format!("duplicate step name '{}'", raw.name)));
        }
    }

    for (name, spec) in &workflow.loops {
        validate_loop(key, name, spec)?;
    }

    let mut steps = Vec::with_capacity(workflow.steps.len());
    for raw in &workflow.steps {
        steps.push(lower_step(key, raw, &workflow.loops)?);
    }

    // needs references
    for step in &steps {
        for need in &step.needs {
            if !index.contains_key(need) {
                return Err(fail(format!(
                    "step '{}' needs unknown step '{}'",
                    step.name, need
                )));
            }
        }
        if let Some(on_error) = &step.on_error {
            if let Some(fallback) = &on_error.fallback {
                if !index.contains_key(fallback) {
                    return Err(fail(format!(
                        "step '{}' falls back to unknown step '{}'",
                        step.name, fallback
                    )));
                }
            }
        }
    }

    let order = topo_sort(key, &steps, &index)?;
    let compiled = CompiledWorkflow {
        key: key.to_string(),
        workflow: workflow.clone(),
        steps,
        order,
        index,
    };

    validate_for_each(key, &compiled)?;
    Ok(compiled)
}

fn validate_loop(workflow: &str, context: &str, spec: &LoopSpec) -> Result<(), WorkflowError> {
    if spec.max_iterations == 0 {
        return Err(WorkflowError::Validation {
            workflow: workflow.to_string(),
            message: format!("loop '{}' has max_iterations 0; unbounded iteration is rejected", context),
        });
    }
    match spec.mode {
        super::LoopMode::Iterate => {
            if spec.items.is_none() {
                return Err(WorkflowError::Validation {
                    workflow: workflow.to_string(),
                    message: format!("iterate loop '{}' requires items", context),
                });
            }
        }
        super::LoopMode::Refine => {
            if spec.until.is_none() {
                return Err(WorkflowError::Validation {
                    workflow: workflow.to_string(),
                    message: format!("refine loop '{}' requires until", context),
                });
            }
        }
    }
    if let Some(rate) = spec.min_success_rate {
        if !(0.0..=1.0).contains(&rate) {
            return Err(WorkflowError::Validation {
                workflow: workflow.to_string(),
                message: format!("loop '{}' min_success_rate must be within [0,1]", context),
            });
        }
    }
    Ok(())
}

/// Convert a raw step into the tagged form, enforcing exactly one kind.
fn lower_step(
    workflow: &str,
    raw: &RawStep,
    loops: &HashMap<String, LoopSpec>,
) -> Result<Step, WorkflowError> {
    let fail = |message: String| WorkflowError::Validation {
        workflow: workflow.to_string(),
        message,
    };

    let mut kinds: Vec<StepKind> = Vec::new();
    if let Some(prompt) = &raw.run {
        kinds.push(StepKind::Run {
            prompt: prompt.clone(),
            system: raw.system.clone(),
        });
    }
    if let Some(loop_ref) = &raw.loop_spec {
        let spec = match loop_ref {
            LoopRef::Inline(spec) => spec.clone(),
            LoopRef::Named(name) => loops
                .get(name)
                .cloned()
                .ok_or_else(|| fail(format!("step '{}' references unknown loop '{}'", raw.name, name)))?,
        };
        validate_loop(workflow, &raw.name, &spec)?;
        kinds.push(StepKind::Loop(spec));
    }
    if let Some(template) = &raw.template {
        kinds.push(StepKind::Template(template.clone()));
    }
    if let Some(consensus) = &raw.consensus {
        if consensus.executions.is_empty() {
            return Err(fail(format!("consensus step '{}' has no executions", raw.name)));
        }
        kinds.push(StepKind::Consensus(consensus.clone()));
    }
    if let Some(embeddings) = &raw.embeddings {
        kinds.push(StepKind::Embeddings(embeddings.clone()));
    }
    if let Some(rag) = &raw.rag {
        kinds.push(StepKind::Rag(rag.clone()));
    }

    if kinds.len() != 1 {
        return Err(fail(format!(
            "step '{}' must set exactly one of run/loop/template/consensus/embeddings/rag (found {})",
            raw.name,
            kinds.len()
        )));
    }
    if raw.system.is_some() && raw.run.is_none() {
        return Err(fail(format!(
            "step '{}' sets system without run",
            raw.name
        )));
    }

    Ok(Step {
        name: raw.name.clone(),
        needs: raw.needs.clone(),
        condition: raw.condition.clone(),
        for_each: raw.for_each.clone(),
        item_name: raw.item_name.clone(),
        on_error: raw.on_error.clone(),
        outputs: raw.outputs.clone(),
        overrides: StepOverrides {
            provider: raw.provider.clone(),
            model: raw.model.clone(),
            providers: raw.providers.clone(),
            servers: raw.servers.clone(),
            skills: raw.skills.clone(),
            temperature: raw.temperature,
            max_tokens: raw.max_tokens,
            timeout_secs: raw.timeout_secs,
        },
        kind: kinds.into_iter().next().unwrap(),
    })
}

/// Kahn's algorithm; a leftover node means a cycle.
fn topo_sort(
    workflow: &str,
    steps: &[Step],
    index: &HashMap<String, usize>,
) -> Result<Vec<usize>, WorkflowError> {
    let n = steps.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

    for (i, step) in steps.iter().enumerate() {
        for need in &step.needs {
            let j = index[need];
            in_degree[i] += 1;
            dependents[j].push(i);
        }
    }

    // Seed with declaration order so independent steps keep file order.
    let mut ready: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(i) = ready.pop_front() {
        order.push(i);
        for &d in &dependents[i] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                ready.push_back(d);
            }
        }
    }

    if order.len() != n {
        let stuck = (0..n)
            .find(|&i| in_degree[i] > 0)
            .map(|i| steps[i].name.clone())
            .unwrap_or_default();
        return Err(WorkflowError::Cycle {
            workflow: workflow.to_string(),
            step: stuck,
        });
    }

    Ok(order)
}

/// `for_each` must reference a collection some upstream step (or the
/// initial input / env) can produce.
fn validate_for_each(key: &str, compiled: &CompiledWorkflow) -> Result<(), WorkflowError> {
    for step in &compiled.steps {
        let for_each = match &step.for_each {
            Some(f) => f,
            None => continue,
        };
        let head = for_each
            .trim_start_matches("{{")
            .trim_end_matches("}}")
            .trim()
            .split('.')
            .next()
            .unwrap_or("")
            .to_string();

        if head == "input" || head == "env" {
            continue;
        }
        let producer = match compiled.index.get(&head) {
            Some(&i) => i,
            None => {
                return Err(WorkflowError::Validation {
                    workflow: key.to_string(),
                    message: format!(
                        "step '{}' fans out over '{}' which no step produces",
                        step.name, head
                    ),
                })
            }
        };

        // The producer must be a transitive dependency of the step.
        let mut seen: HashSet<usize> = HashSet::new();
        let mut queue: VecDeque<usize> = VecDeque::new();
        let self_idx = compiled.index[&step.name];
        queue.push_back(self_idx);
        let mut found = false;
        while let Some(i) = queue.pop_front() {
            for need in &compiled.steps[i].needs {
                let j = compiled.index[need];
                if j == producer {
                    found = true;
                    break;
                }
                if seen.insert(j) {
                    queue.push_back(j);
                }
            }
            if found {
                break;
            }
        }
        if !found {
            return Err(WorkflowError::Validation {
                workflow: key.to_string(),
                message: format!(
                    "step '{}' fans out over '{}' but does not depend on it",
                    step.name, head
                ),
            });
        }
    }
    Ok(())
}

/// Compile every workflow in the config and check cross references:
/// child workflows, providers, servers, skills, and RAG services.
pub fn compile_all(
    config: &AppConfig,
) -> Result<HashMap<String, CompiledWorkflow>, WorkflowError> {
    let mut compiled = HashMap::new();
    for (key, workflow) in &config.workflows {
        compiled.insert(key.clone(), compile(key, workflow)?);
    }

    for (key, cw) in &compiled {
        check_context_refs(config, key, &cw.workflow.context)?;
        for step in &cw.steps {
            check_step_refs(config, &compiled, key, step)?;
        }
    }

    Ok(compiled)
}

fn check_context_refs(
    config: &AppConfig,
    key: &str,
    context: &super::ExecutionContext,
) -> Result<(), WorkflowError> {
    let fail = |message: String| WorkflowError::Validation {
        workflow: key.to_string(),
        message,
    };

    if let Some(provider) = &context.provider {
        if !config.providers.contains_key(provider) {
            return Err(fail(format!("context references undeclared provider '{}'", provider)));
        }
    }
    for fallback in &context.providers {
        if !config.providers.contains_key(&fallback.provider) {
            return Err(fail(format!(
                "context fallback references undeclared provider '{}'",
                fallback.provider
            )));
        }
    }
    for server in &context.servers {
        if !config.servers.contains_key(server) {
            return Err(fail(format!("context attaches undeclared MCP server '{}'", server)));
        }
    }
    for skill in &context.skills {
        if !config.settings.skills.contains_key(skill) {
            return Err(fail(format!("context references undeclared skill '{}'", skill)));
        }
    }
    Ok(())
}

fn check_step_refs(
    config: &AppConfig,
    compiled: &HashMap<String, CompiledWorkflow>,
    key: &str,
    step: &Step,
) -> Result<(), WorkflowError> {
    let fail = |message: String| WorkflowError::Validation {
        workflow: key.to_string(),
        message,
    };

    let check_provider = |name: &str| -> Result<(), WorkflowError> {
        if config.providers.contains_key(name) {
            Ok(())
        } else {
            Err(fail(format!(
                "step '{}' references undeclared provider '{}'",
                step.name, name
            )))
        }
    };

    if let Some(p) = &step.overrides.provider {
        check_provider(p)?;
    }
    if let Some(refs) = &step.overrides.providers {
        for r in refs {
            check_provider(&r.provider)?;
        }
    }
    if let Some(servers) = &step.overrides.servers {
        for server in servers {
            if !config.servers.contains_key(server) {
                return Err(fail(format!(
                    "step '{}' attaches undeclared MCP server '{}'",
                    step.name, server
                )));
            }
        }
    }
    if let Some(skills) = &step.overrides.skills {
        for skill in skills {
            if !config.settings.skills.contains_key(skill) {
                return Err(fail(format!(
                    "step '{}' references undeclared skill '{}'",
                    step.name, skill
                )));
            }
        }
    }

    match &step.kind {
        StepKind::Loop(spec) => {
            if !compiled.contains_key(&spec.workflow) {
                return Err(fail(format!(
                    "step '{}' loops over unknown workflow '{}'",
                    step.name, spec.workflow
                )));
            }
        }
        StepKind::Template(spec) => {
            if !compiled.contains_key(&spec.name) {
                return Err(fail(format!(
                    "step '{}' invokes unknown workflow '{}'",
                    step.name, spec.name
                )));
            }
        }
        StepKind::Consensus(spec) => {
            for exec in &spec.executions {
                check_provider(&exec.provider)?;
            }
        }
        StepKind::Rag(spec) => {
            if !config.rag.contains_key(&spec.service) {
                return Err(fail(format!(
                    "step '{}' queries unknown rag service '{}'",
                    step.name, spec.service
                )));
            }
        }
        StepKind::Embeddings(spec) => {
            if let Some(p) = &spec.provider {
                check_provider(p)?;
            }
        }
        StepKind::Run { .. } => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Workflow {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_linear_topo_order() {
        let wf = parse(
            r#"
$schema: workflow/v2.0
name: linear
steps:
  - name: b
    run: "second {{a}}"
    needs: [a]
  - name: a
    run: "first"
"#,
        );
        let compiled = compile("linear", &wf).unwrap();
        let names: Vec<&str> = compiled.order.iter().map(|&i| compiled.steps[i].name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_cycle_rejected() {
        let wf = parse(
            r#"
$schema: workflow/v2.0
name: cyclic
steps:
  - name: a
    run: "x"
    needs: [b]
  - name: b
    run: "y"
    needs: [a]
"#,
        );
        let err = compile("cyclic", &wf).unwrap_err();
        assert!(matches!(err, WorkflowError::Cycle { .. }));
    }

    #[test]
    fn test_exactly_one_kind() {
        let wf = parse(
            r#"
$schema: workflow/v2.0
name: bad
steps:
  - name: a
    run: "x"
    template:
      name: other
"#,
        );
        let err = compile("bad", &wf).unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }

    #[test]
    fn test_unknown_needs_rejected() {
        let wf = parse(
            r#"
$schema: workflow/v2.0
name: bad
steps:
  - name: a
    run: "x"
    needs: [ghost]
"#,
        );
        let err = compile("bad", &wf).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let wf = parse(
            r#"
$schema: workflow/v2.0
name: bad
steps:
  - name: a
    loop:
      workflow: child
      mode: iterate
      items: "[1]"
      max_iterations: 0
"#,
        );
        let err = compile("bad", &wf).unwrap_err();
        assert!(err.to_string().contains("max_iterations"));
    }

    #[test]
    fn test_for_each_requires_upstream_producer() {
        let wf = parse(
            r#"
$schema: workflow/v2.0
name: bad
steps:
  - name: gather
    run: "collect"
  - name: spread
    run: "work on {{item}}"
    for_each: "{{gather.rows}}"
"#,
        );
        let err = compile("bad", &wf).unwrap_err();
        assert!(err.to_string().contains("does not depend"));

        let wf = parse(
            r#"
$schema: workflow/v2.0
name: good
steps:
  - name: gather
    run: "collect"
  - name: spread
    run: "work on {{item}}"
    for_each: "{{gather.rows}}"
    needs: [gather]
"#,
        );
        assert!(compile("good", &wf).is_ok());
    }

    #[test]
    fn test_canonical_round_trip() {
        let wf = parse(
            r#"
$schema: workflow/v2.0
name: rt
steps:
  - name: a
    run: "first"
  - name: b
    run: "second"
    needs: [a]
"#,
        );
        let compiled = compile("rt", &wf).unwrap();
        let canonical = compiled.canonical_form();
        let reparsed: Workflow = serde_json::from_value(canonical).unwrap();
        let recompiled = compile("rt", &reparsed).unwrap();
        assert_eq!(compiled.graph_signature(), recompiled.graph_signature());
    }
}
