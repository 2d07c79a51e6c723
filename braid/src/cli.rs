//! Command-line definitions and exit-code mapping
//!
//! Subcommands map 1:1 to engine entry points; global flags become
//! `AppConfig` overrides. The exit codes are part of the query-mode
//! contract and are asserted by callers, so keep them stable.

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

use crate::config::ConfigError;
use crate::workflow::engine::FailureKind;
use crate::workflow::WorkflowError;

// Query-mode exit codes
pub const EXIT_GENERAL: i32 = 1;
pub const EXIT_CONFIG_MISSING: i32 = 2;
pub const EXIT_PROVIDER_NOT_FOUND: i32 = 3;
pub const EXIT_CONTEXT_FILE_MISSING: i32 = 4;
pub const EXIT_INITIALIZATION: i32 = 5;
pub const EXIT_LLM_REQUEST: i32 = 6;
pub const EXIT_TOOL_EXECUTION: i32 = 7;
pub const EXIT_SERVER_CONNECTION: i32 = 8;
pub const EXIT_OUTPUT_FORMAT: i32 = 9;
pub const EXIT_OUTPUT_WRITE: i32 = 10;

#[derive(Parser)]
#[command(name = "braid", version, about = "Compose LLM providers and MCP tool servers into workflows")]
pub struct Cli {
    /// Configuration file
    #[arg(long, global = true, env = "BRAID_CONFIG", default_value = "config.yaml")]
    pub config: PathBuf,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// One-shot query against a provider or a workflow
    Query {
        /// Prompt text; read from stdin when omitted
        prompt: Option<String>,

        /// Run a named workflow instead of a bare prompt
        #[arg(long)]
        workflow: Option<String>,

        #[arg(long)]
        provider: Option<String>,

        #[arg(long)]
        model: Option<String>,

        /// Context file whose contents are appended to the prompt
        #[arg(long)]
        context: Option<PathBuf>,

        /// Emit the full result scope as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run as an MCP server exposing workflows as tools
    Serve {
        /// runas descriptor name (defaults to the only one configured)
        #[arg(long)]
        runas: Option<String>,
    },

    /// Run the embeddings pipeline
    Embeddings {
        /// Text, or file://path
        input: String,

        #[arg(long)]
        provider: Option<String>,

        #[arg(long)]
        model: Option<String>,

        /// json | csv | compact
        #[arg(long)]
        format: Option<String>,

        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// List loaded workflows
    Workflows,
}

/// Map a step failure to the query-mode exit code.
pub fn exit_code_for_failure(kind: FailureKind) -> i32 {
    match kind {
        FailureKind::ProviderNotFound => EXIT_PROVIDER_NOT_FOUND,
        FailureKind::Provider | FailureKind::Timeout => EXIT_LLM_REQUEST,
        FailureKind::Tool => EXIT_TOOL_EXECUTION,
        FailureKind::Server => EXIT_SERVER_CONNECTION,
        FailureKind::Condition | FailureKind::Other => EXIT_GENERAL,
    }
}

/// Map a top-level error chain to the exit code.
pub fn exit_code_for_error(error: &anyhow::Error) -> i32 {
    if let Some(config) = error.downcast_ref::<ConfigError>() {
        return match config {
            ConfigError::Missing { .. } => EXIT_CONFIG_MISSING,
            _ => EXIT_INITIALIZATION,
        };
    }
    if let Some(workflow) = error.downcast_ref::<WorkflowError>() {
        return match workflow {
            WorkflowError::NotFound(_) => EXIT_INITIALIZATION,
            WorkflowError::ProviderNotFound(_) => EXIT_PROVIDER_NOT_FOUND,
            _ => EXIT_GENERAL,
        };
    }
    if let Some(llm) = error.downcast_ref::<crate::llm::LlmError>() {
        return match llm {
            crate::llm::LlmError::ProviderNotFound(_) => EXIT_PROVIDER_NOT_FOUND,
            _ => EXIT_LLM_REQUEST,
        };
    }
    if error.downcast_ref::<crate::mcp::McpError>().is_some() {
        return EXIT_SERVER_CONNECTION;
    }
    EXIT_GENERAL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_exit_codes() {
        assert_eq!(
            exit_code_for_failure(FailureKind::ProviderNotFound),
            EXIT_PROVIDER_NOT_FOUND
        );
        assert_eq!(exit_code_for_failure(FailureKind::Tool), EXIT_TOOL_EXECUTION);
        assert_eq!(
            exit_code_for_failure(FailureKind::Server),
            EXIT_SERVER_CONNECTION
        );
        assert_eq!(exit_code_for_failure(FailureKind::Other), EXIT_GENERAL);
    }

    #[test]
    fn test_config_missing_exit_code() {
        let error = anyhow::Error::new(ConfigError::Missing {
            path: PathBuf::from("config.yaml"),
        });
        assert_eq!(exit_code_for_error(&error), EXIT_CONFIG_MISSING);
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["braid", "query", "hello", "--provider", "local"]).unwrap();
        match cli.command {
            Commands::Query {
                prompt, provider, ..
            } => {
                assert_eq!(prompt.as_deref(), Some("hello"));
                assert_eq!(provider.as_deref(), Some("local"));
            }
            _ => panic!("expected query"),
        }
    }
}
