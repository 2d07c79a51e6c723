//! braid - workflow orchestrator for LLM providers and MCP tool servers
//!
//! A slim dispatcher: flags become config overrides, subcommands route
//! to engine entry points, and errors map to the query-mode exit codes.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use braid::cli::{
    exit_code_for_error, exit_code_for_failure, Cli, Commands, EXIT_CONTEXT_FILE_MISSING,
    EXIT_OUTPUT_FORMAT, EXIT_OUTPUT_WRITE,
};
use braid::config::{AppConfig, ChunkStrategy, OutputFormat};
use braid::embeddings::{self, PipelineSpec};
use braid::llm::{CompletionRequest, Message, ProviderFactory, ProviderSource};
use braid::serve::{serve, Facade};
use braid::tasks::TaskManager;
use braid::workflow::Engine;

/// Initialize tracing with the given verbosity level
///
/// Set `LOG_FORMAT=json` for structured JSON output.
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()));

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if use_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match dispatch(cli).await {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("error: {:#}", error);
            std::process::exit(exit_code_for_error(&error));
        }
    }
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let config_path = braid::config::default_config_path(cli.config.clone());
    let config = AppConfig::load(&config_path)?;

    match cli.command {
        Commands::Query {
            prompt,
            workflow,
            provider,
            model,
            context,
            json,
        } => query(config, prompt, workflow, provider, model, context, json).await,
        Commands::Serve { runas } => run_serve(config, runas).await,
        Commands::Embeddings {
            input,
            provider,
            model,
            format,
            output,
        } => run_embeddings(config, input, provider, model, format, output).await,
        Commands::Workflows => {
            let engine = Engine::new(config)?;
            for name in engine.workflow_names() {
                println!("{}", name);
            }
            Ok(0)
        }
    }
}

async fn query(
    config: AppConfig,
    prompt: Option<String>,
    workflow: Option<String>,
    provider: Option<String>,
    model: Option<String>,
    context: Option<PathBuf>,
    json_output: bool,
) -> Result<i32> {
    let mut prompt = match prompt {
        Some(p) => p,
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("reading prompt from stdin")?;
            buffer.trim().to_string()
        }
    };
    if let Some(path) = &context {
        if !path.exists() {
            eprintln!("error: context file not found: {}", path.display());
            return Ok(EXIT_CONTEXT_FILE_MISSING);
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        prompt = format!("{}\n\n{}", prompt, text);
    }

    if let Some(name) = workflow {
        let engine = Engine::new(config)?;
        let cancel = CancellationToken::new();
        let run = engine.run(&name, Value::String(prompt), &cancel).await?;
        let shutdown = engine.pool().shutdown();
        shutdown.await;

        if json_output {
            let document = json!({
                "success": run.success,
                "result": run.result,
                "scope": run.scope,
                "steps": run.steps,
                "error": run.failure,
            });
            println!("{}", serde_json::to_string_pretty(&document)?);
        } else {
            println!("{}", braid::workflow::subst::value_to_string(&run.result));
        }

        return Ok(match run.failure {
            Some(failure) => {
                eprintln!("error: step '{}' failed: {}", failure.step, failure.message);
                exit_code_for_failure(failure.kind)
            }
            None => 0,
        });
    }

    // Bare prompt against one provider
    let factory = ProviderFactory::new(&config);
    let provider_name = provider
        .or_else(|| config.settings.default_provider.clone())
        .context("no provider given and no default_provider configured")?;
    let llm = factory.create(&provider_name, model.as_deref())?;

    let response = llm
        .complete(CompletionRequest {
            messages: vec![Message::user(prompt)],
            ..Default::default()
        })
        .await?;

    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "content": response.content,
                "usage": response.usage,
            }))?
        );
    } else {
        println!("{}", response.content);
    }
    Ok(0)
}

async fn run_serve(config: AppConfig, runas: Option<String>) -> Result<i32> {
    let runas_config = match runas {
        Some(name) => config
            .runas
            .get(&name)
            .cloned()
            .with_context(|| format!("runas '{}' not found", name))?,
        None => {
            let mut entries = config.runas.values();
            match (entries.next(), entries.next()) {
                (Some(only), None) => only.clone(),
                (None, _) => anyhow::bail!("no runas descriptor configured"),
                _ => anyhow::bail!("several runas descriptors configured; pass --runas"),
            }
        }
    };

    let settings = config.settings.clone();
    let engine = Engine::new(config)?;
    let tasks = Arc::new(TaskManager::new(
        settings.task_ttl_default_ms,
        settings.task_ttl_max_ms,
        settings.task_poll_interval_ms,
    ));
    let cleanup = tasks.spawn_cleanup();

    let facade = Arc::new(Facade::new(&runas_config, engine.clone(), tasks, None));
    let cancel = CancellationToken::new();
    let result = serve(facade, settings.socket_dir(), cancel).await;

    cleanup.abort();
    engine.pool().shutdown().await;
    result?;
    Ok(0)
}

async fn run_embeddings(
    config: AppConfig,
    input: String,
    provider: Option<String>,
    model: Option<String>,
    format: Option<String>,
    output: Option<PathBuf>,
) -> Result<i32> {
    let output_format = match format.as_deref() {
        None => config.embeddings.output_format,
        Some("json") => OutputFormat::Json,
        Some("csv") => OutputFormat::Csv,
        Some("compact") => OutputFormat::Compact,
        Some(other) => {
            eprintln!("error: unknown output format '{}'", other);
            return Ok(EXIT_OUTPUT_FORMAT);
        }
    };

    let factory = ProviderFactory::new(&config);
    let provider_name = provider
        .or_else(|| config.embeddings.provider.clone())
        .or_else(|| config.settings.default_provider.clone())
        .context("no provider given and no default_provider configured")?;
    let llm = factory.create(&provider_name, None)?;

    let spec = PipelineSpec {
        model: model.or_else(|| config.embeddings.model.clone()),
        chunking: config.embeddings.chunking,
        chunk_size: config.embeddings.chunk_size,
        chunk_overlap: config.embeddings.chunk_overlap,
        output_format,
        output_file: output.clone(),
    };
    let chunking_label = match spec.chunking {
        ChunkStrategy::Sentence => "sentence",
        ChunkStrategy::Paragraph => "paragraph",
        ChunkStrategy::Fixed => "fixed",
    };
    tracing::info!(chunking = chunking_label, "running embeddings pipeline");

    let document = match embeddings::run(llm.as_ref(), &Value::String(input), &spec).await {
        Ok(document) => document,
        Err(embeddings::EmbeddingsError::Output { path, source }) => {
            eprintln!("error: cannot write {}: {}", path.display(), source);
            return Ok(EXIT_OUTPUT_WRITE);
        }
        Err(e) => return Err(e.into()),
    };

    if output.is_none() {
        match &document {
            Value::String(s) => println!("{}", s),
            other => println!("{}", serde_json::to_string_pretty(other)?),
        }
    }
    Ok(0)
}
