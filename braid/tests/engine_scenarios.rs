//! End-to-end engine scenarios with stub providers

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use braid::cli::{exit_code_for_failure, EXIT_PROVIDER_NOT_FOUND};
use braid::config::{AppConfig, InterfaceType, ProviderConfig, ProviderDescriptor, Settings};
use braid::llm::{
    CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, LlmError,
    LlmProvider, ProviderSource, Role, Usage,
};
use braid::workflow::{Engine, Workflow};

/// Behaviour of one stub provider
enum StubBehaviour {
    /// Return the last user prompt verbatim
    Echo,
    /// Return a fixed string
    Fixed(String),
    /// Double the first integer in the prompt
    Double,
    /// Sequence of responses, then repeat the last
    Sequence(Vec<String>),
    /// Always fail with provider-not-found
    Missing,
}

struct StubProvider {
    name: String,
    behaviour: StubBehaviour,
    calls: AtomicU32,
}

#[async_trait]
impl LlmProvider for StubProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        "stub-model"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let is_evaluator = request
            .messages
            .iter()
            .any(|m| m.role == Role::System && m.content.contains("loop-termination evaluator"));

        let content = if is_evaluator {
            // judge only the current result, not the condition text
            let current = prompt.split("Current result:").nth(1).unwrap_or("");
            if current.contains("DONE") {
                "YES".to_string()
            } else {
                "NO".to_string()
            }
        } else {
            match &self.behaviour {
                StubBehaviour::Echo => prompt,
                StubBehaviour::Fixed(s) => s.clone(),
                StubBehaviour::Double => {
                    let n: i64 = prompt
                        .split(|c: char| !c.is_ascii_digit())
                        .find(|s| !s.is_empty())
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0);
                    (n * 2).to_string()
                }
                StubBehaviour::Sequence(items) => {
                    let index = (call as usize).min(items.len() - 1);
                    items[index].clone()
                }
                StubBehaviour::Missing => {
                    return Err(LlmError::ProviderNotFound(self.name.clone()))
                }
            }
        };

        Ok(CompletionResponse {
            id: format!("stub-{}", call),
            content,
            tool_calls: vec![],
            usage: Usage::default(),
        })
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        _sink: mpsc::Sender<String>,
    ) -> Result<CompletionResponse, LlmError> {
        self.complete(request).await
    }

    async fn embed(&self, _request: EmbeddingRequest) -> Result<EmbeddingResponse, LlmError> {
        Err(LlmError::Configuration("stub has no embeddings".to_string()))
    }
}

/// Provider source handing out per-name stubs
struct StubSource {
    providers: HashMap<String, Arc<StubProvider>>,
}

impl StubSource {
    fn new(providers: Vec<(&str, StubBehaviour)>) -> Self {
        Self {
            providers: providers
                .into_iter()
                .map(|(name, behaviour)| {
                    (
                        name.to_string(),
                        Arc::new(StubProvider {
                            name: name.to_string(),
                            behaviour,
                            calls: AtomicU32::new(0),
                        }),
                    )
                })
                .collect(),
        }
    }
}

impl ProviderSource for StubSource {
    fn create(
        &self,
        name: &str,
        _model_override: Option<&str>,
    ) -> Result<Arc<dyn LlmProvider>, LlmError> {
        self.providers
            .get(name)
            .cloned()
            .map(|p| p as Arc<dyn LlmProvider>)
            .ok_or_else(|| LlmError::ProviderNotFound(name.to_string()))
    }
}

fn declare_provider(name: &str) -> (String, ProviderDescriptor) {
    (
        name.to_string(),
        ProviderDescriptor {
            interface_type: InterfaceType::OllamaNative,
            provider_name: name.to_string(),
            config: ProviderConfig::default(),
        },
    )
}

fn build_config(provider_names: &[&str], workflows: Vec<(&str, &str)>) -> AppConfig {
    AppConfig {
        providers: provider_names.iter().map(|n| declare_provider(n)).collect(),
        workflows: workflows
            .into_iter()
            .map(|(name, yaml)| {
                let workflow: Workflow = serde_yaml::from_str(yaml).expect("test workflow parses");
                (name.to_string(), workflow)
            })
            .collect(),
        settings: Settings {
            default_provider: Some("stub".to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn engine_with(
    provider_names: &[&str],
    source: StubSource,
    workflows: Vec<(&str, &str)>,
) -> Arc<Engine> {
    Engine::builder(build_config(provider_names, workflows))
        .providers(Arc::new(source))
        .build()
        .expect("engine builds")
}

/// Scenario: linear two-step workflow against an echo provider.
#[tokio::test]
async fn linear_two_step_workflow() {
    let engine = engine_with(
        &["stub"],
        StubSource::new(vec![("stub", StubBehaviour::Echo)]),
        vec![(
            "linear",
            r#"
$schema: workflow/v2.0
name: linear
context:
  provider: stub
steps:
  - name: a
    run: "say hi"
  - name: b
    run: "echo {{a}}"
    needs: [a]
"#,
        )],
    );

    let run = engine
        .run("linear", Value::Null, &CancellationToken::new())
        .await
        .unwrap();

    assert!(run.success);
    assert_eq!(run.scope["a"], json!("say hi"));
    assert_eq!(run.scope["b"], json!("echo say hi"));
    assert_eq!(run.result, json!("echo say hi"));
}

/// Scenario: iterate loop with parallel fan-out over a child workflow.
#[tokio::test]
async fn loop_iterate_with_fan_out() {
    let engine = engine_with(
        &["stub"],
        StubSource::new(vec![("stub", StubBehaviour::Double)]),
        vec![
            (
                "double",
                r#"
$schema: workflow/v2.0
name: double
context:
  provider: stub
steps:
  - name: calc
    run: "double {{item}}"
"#,
            ),
            (
                "parent",
                r#"
$schema: workflow/v2.0
name: parent
context:
  provider: stub
steps:
  - name: spread
    loop:
      workflow: double
      mode: iterate
      items: "[1,2,3]"
      max_iterations: 10
      parallel: true
      max_workers: 3
"#,
            ),
        ],
    );

    let run = engine
        .run("parent", Value::Null, &CancellationToken::new())
        .await
        .unwrap();

    assert!(run.success, "failure: {:?}", run.failure);
    let loop_result = &run.scope["spread"];
    assert_eq!(loop_result["total_items"], 3);
    assert_eq!(loop_result["succeeded"], 3);
    assert_eq!(loop_result["failed"], 0);
    assert_eq!(loop_result["output"], json!(["2", "4", "6"]));
    assert_eq!(loop_result["success"], true);
}

/// Scenario: consensus 2/3 with three providers answering A, A, B.
#[tokio::test]
async fn consensus_two_thirds() {
    let engine = engine_with(
        &["stub", "p1", "p2", "p3"],
        StubSource::new(vec![
            ("stub", StubBehaviour::Echo),
            ("p1", StubBehaviour::Fixed("A".to_string())),
            ("p2", StubBehaviour::Fixed("A".to_string())),
            ("p3", StubBehaviour::Fixed("B".to_string())),
        ]),
        vec![(
            "vote",
            r#"
$schema: workflow/v2.0
name: vote
context:
  provider: stub
steps:
  - name: decide
    consensus:
      prompt: "answer"
      require: "2/3"
      executions:
        - provider: p1
        - provider: p2
        - provider: p3
"#,
        )],
    );

    let run = engine
        .run("vote", Value::Null, &CancellationToken::new())
        .await
        .unwrap();

    assert!(run.success);
    let consensus = &run.scope["decide"];
    assert_eq!(consensus["success"], true);
    assert_eq!(consensus["result"], "A");
    assert!((consensus["agreement"].as_f64().unwrap() - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(consensus["confidence"], "good");
}

/// Scenario: refine loop exits when the evaluator sees DONE.
#[tokio::test]
async fn refine_until_done() {
    let engine = engine_with(
        &["stub"],
        StubSource::new(vec![(
            "stub",
            StubBehaviour::Sequence(vec!["step1".to_string(), "DONE".to_string()]),
        )]),
        vec![
            (
                "draft",
                r#"
$schema: workflow/v2.0
name: draft
context:
  provider: stub
steps:
  - name: write
    run: "improve {{previous_result}}"
"#,
            ),
            (
                "refiner",
                r#"
$schema: workflow/v2.0
name: refiner
context:
  provider: stub
steps:
  - name: polish
    loop:
      workflow: draft
      mode: refine
      until: "the draft says DONE"
      max_iterations: 5
"#,
            ),
        ],
    );

    let run = engine
        .run("refiner", Value::Null, &CancellationToken::new())
        .await
        .unwrap();

    assert!(run.success, "failure: {:?}", run.failure);
    let loop_result = &run.scope["polish"];
    assert_eq!(loop_result["output"], "DONE");
    // two child invocations: "step1" then "DONE"
    assert_eq!(loop_result["iterations"].as_array().unwrap().len(), 2);
    assert_eq!(loop_result["accumulated"], json!(["step1", "DONE"]));
}

/// Boundary: max_iterations=1 invokes the child exactly once.
#[tokio::test]
async fn max_iterations_one() {
    let engine = engine_with(
        &["stub"],
        StubSource::new(vec![("stub", StubBehaviour::Echo)]),
        vec![
            (
                "child",
                r#"
$schema: workflow/v2.0
name: child
context:
  provider: stub
steps:
  - name: noop
    run: "item {{item}}"
"#,
            ),
            (
                "bounded",
                r#"
$schema: workflow/v2.0
name: bounded
context:
  provider: stub
steps:
  - name: spread
    loop:
      workflow: child
      mode: iterate
      items: "[10, 20, 30]"
      max_iterations: 1
"#,
            ),
        ],
    );

    let run = engine
        .run("bounded", Value::Null, &CancellationToken::new())
        .await
        .unwrap();

    assert!(run.success);
    assert_eq!(run.scope["spread"]["total_items"], 1);
    assert_eq!(run.scope["spread"]["succeeded"], 1);
}

/// Boundary: empty items completes immediately with success.
#[tokio::test]
async fn empty_items_succeeds() {
    let engine = engine_with(
        &["stub"],
        StubSource::new(vec![("stub", StubBehaviour::Echo)]),
        vec![
            (
                "child",
                r#"
$schema: workflow/v2.0
name: child
context:
  provider: stub
steps:
  - name: noop
    run: "x"
"#,
            ),
            (
                "empty",
                r#"
$schema: workflow/v2.0
name: empty
context:
  provider: stub
steps:
  - name: spread
    loop:
      workflow: child
      mode: iterate
      items: "[]"
      max_iterations: 5
      min_success_rate: 0
"#,
            ),
        ],
    );

    let run = engine
        .run("empty", Value::Null, &CancellationToken::new())
        .await
        .unwrap();

    assert!(run.success);
    assert_eq!(run.scope["spread"]["total_items"], 0);
    assert_eq!(run.scope["spread"]["success"], true);
}

/// Conditions gate steps; skipped steps leave no binding.
#[tokio::test]
async fn condition_skips_step() {
    let engine = engine_with(
        &["stub"],
        StubSource::new(vec![("stub", StubBehaviour::Echo)]),
        vec![(
            "gated",
            r#"
$schema: workflow/v2.0
name: gated
context:
  provider: stub
env:
  MODE: fast
steps:
  - name: always
    run: "base"
  - name: never
    run: "skipped work"
    if: "env.MODE == 'slow'"
    needs: [always]
"#,
        )],
    );

    let run = engine
        .run("gated", Value::Null, &CancellationToken::new())
        .await
        .unwrap();

    assert!(run.success);
    assert!(run.scope.contains_key("always"));
    assert!(!run.scope.contains_key("never"));
}

/// for_each fans out over an upstream collection in index order.
#[tokio::test]
async fn for_each_fan_out() {
    let engine = engine_with(
        &["stub"],
        StubSource::new(vec![("stub", StubBehaviour::Echo)]),
        vec![(
            "fan",
            r#"
$schema: workflow/v2.0
name: fan
context:
  provider: stub
steps:
  - name: rows
    run: "ignored"
    outputs:
      transform: json
  - name: spread
    run: "row {{row}} at {{index}}"
    for_each: "{{input}}"
    item_name: row
"#,
        )],
    );

    let run = engine
        .run("fan", json!(["a", "b"]), &CancellationToken::new())
        .await
        .unwrap();

    assert!(run.success, "failure: {:?}", run.failure);
    assert_eq!(run.scope["spread"], json!(["row a at 0", "row b at 1"]));
}

/// Template steps push a child scope and bind its result.
#[tokio::test]
async fn template_invocation() {
    let engine = engine_with(
        &["stub"],
        StubSource::new(vec![("stub", StubBehaviour::Echo)]),
        vec![
            (
                "greet",
                r#"
$schema: workflow/v2.0
name: greet
context:
  provider: stub
steps:
  - name: hello
    run: "hello {{who}}"
"#,
            ),
            (
                "outer",
                r#"
$schema: workflow/v2.0
name: outer
context:
  provider: stub
steps:
  - name: call
    template:
      name: greet
      with:
        who: "world"
"#,
            ),
        ],
    );

    let run = engine
        .run("outer", Value::Null, &CancellationToken::new())
        .await
        .unwrap();

    assert!(run.success);
    assert_eq!(run.scope["call"], json!("hello world"));
}

/// Negative: provider missing at dispatch fails the workflow with the
/// provider-not-found exit code; completed outputs stay visible.
#[tokio::test]
async fn unknown_provider_fails_step() {
    let engine = engine_with(
        &["stub", "ghost"],
        StubSource::new(vec![
            ("stub", StubBehaviour::Echo),
            ("ghost", StubBehaviour::Missing),
        ]),
        vec![(
            "doomed",
            r#"
$schema: workflow/v2.0
name: doomed
context:
  provider: stub
steps:
  - name: fine
    run: "works"
  - name: broken
    run: "boom"
    provider: ghost
    needs: [fine]
"#,
        )],
    );

    let run = engine
        .run("doomed", Value::Null, &CancellationToken::new())
        .await
        .unwrap();

    assert!(!run.success);
    let failure = run.failure.unwrap();
    assert_eq!(failure.step, "broken");
    assert_eq!(exit_code_for_failure(failure.kind), EXIT_PROVIDER_NOT_FOUND);
    // completed outputs preserved for inspection
    assert_eq!(run.scope["fine"], json!("works"));
}

/// Negative: a needs-cycle is rejected at load time.
#[tokio::test]
async fn cycle_rejected_at_load() {
    let config = build_config(
        &["stub"],
        vec![(
            "cyclic",
            r#"
$schema: workflow/v2.0
name: cyclic
context:
  provider: stub
steps:
  - name: a
    run: "x"
    needs: [b]
  - name: b
    run: "y"
    needs: [a]
"#,
        )],
    );

    let error = Engine::builder(config)
        .providers(Arc::new(StubSource::new(vec![("stub", StubBehaviour::Echo)])))
        .build()
        .err()
        .expect("cycle must be rejected");
    assert!(error.to_string().contains("cycle"));
}

/// Fallback chain: transient failure on the primary moves to the next
/// provider.
#[tokio::test]
async fn fallback_chain_on_transient_failure() {
    struct FlakyProvider;

    #[async_trait]
    impl LlmProvider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }
        fn model(&self) -> &str {
            "flaky-model"
        }
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            Err(LlmError::Api {
                status: 503,
                message: "overloaded".to_string(),
            })
        }
        async fn stream(
            &self,
            request: CompletionRequest,
            _sink: mpsc::Sender<String>,
        ) -> Result<CompletionResponse, LlmError> {
            self.complete(request).await
        }
        async fn embed(&self, _request: EmbeddingRequest) -> Result<EmbeddingResponse, LlmError> {
            Err(LlmError::Configuration("none".to_string()))
        }
    }

    struct MixedSource {
        backup: Arc<StubProvider>,
    }

    impl ProviderSource for MixedSource {
        fn create(
            &self,
            name: &str,
            _model: Option<&str>,
        ) -> Result<Arc<dyn LlmProvider>, LlmError> {
            match name {
                "flaky" => Ok(Arc::new(FlakyProvider)),
                "backup" => Ok(self.backup.clone() as Arc<dyn LlmProvider>),
                other => Err(LlmError::ProviderNotFound(other.to_string())),
            }
        }
    }

    let config = build_config(
        &["flaky", "backup"],
        vec![(
            "resilient",
            r#"
$schema: workflow/v2.0
name: resilient
context:
  provider: flaky
  providers:
    - provider: backup
steps:
  - name: ask
    run: "question"
"#,
        )],
    );
    let engine = Engine::builder(config)
        .providers(Arc::new(MixedSource {
            backup: Arc::new(StubProvider {
                name: "backup".to_string(),
                behaviour: StubBehaviour::Fixed("rescued".to_string()),
                calls: AtomicU32::new(0),
            }),
        }))
        .build()
        .unwrap();

    let run = engine
        .run("resilient", Value::Null, &CancellationToken::new())
        .await
        .unwrap();

    assert!(run.success, "failure: {:?}", run.failure);
    assert_eq!(run.scope["ask"], json!("rescued"));
}
