//! The tool-call continuation loop
//!
//! When a provider response requests tool calls, each call is routed to
//! its MCP server, results are appended as tool-role messages in the
//! order of the provider's tool_calls array, and the provider is invoked
//! again with the augmented message list. The loop is bounded by
//! `max_tool_follow_up`; at the cap the latest assistant message is
//! returned even if it still requests tools. Tool failures become error
//! strings in tool-role messages so the model can recover.

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::types::{CompletionRequest, CompletionResponse, Message, ToolSpec};
use super::{LlmError, LlmProvider};

/// AI-level default when neither the server nor the settings set a cap
pub const DEFAULT_TOOL_FOLLOW_UP: u32 = 2;

/// Routes `(server, tool, arguments)` to an MCP connection
#[async_trait]
pub trait ToolRouter: Send + Sync {
    async fn call(&self, server: &str, tool: &str, arguments: Value) -> anyhow::Result<String>;
}

/// A tool offered to the model, tagged with its owning server
#[derive(Debug, Clone)]
pub struct AttachedTool {
    pub server: String,
    pub spec: ToolSpec,
}

/// Run the provider with tool-calling against the router until the model
/// answers without tool calls or the follow-up cap is reached.
pub async fn run_tool_loop(
    provider: &dyn LlmProvider,
    router: &dyn ToolRouter,
    mut request: CompletionRequest,
    tools: &[AttachedTool],
    max_follow_up: u32,
    cancel: &CancellationToken,
) -> Result<CompletionResponse, LlmError> {
    // Tool identity is server x tool; names colliding across servers are
    // exposed qualified so the model can address both.
    let mut routes: std::collections::HashMap<String, (String, String)> =
        std::collections::HashMap::new();
    let mut specs: Vec<ToolSpec> = Vec::with_capacity(tools.len());
    for tool in tools {
        let mut exposed = tool.spec.name.clone();
        if routes.contains_key(&exposed) {
            exposed = format!("{}__{}", tool.server, tool.spec.name);
        }
        routes.insert(exposed.clone(), (tool.server.clone(), tool.spec.name.clone()));
        let mut spec = tool.spec.clone();
        spec.name = exposed;
        specs.push(spec);
    }
    request.tools = specs;

    let mut rounds = 0;
    loop {
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            result = provider.complete(request.clone()) => result?,
        };

        if !response.wants_tools() {
            return Ok(response);
        }
        if rounds >= max_follow_up {
            info!(
                rounds,
                "tool follow-up cap reached, returning latest assistant message"
            );
            return Ok(response);
        }
        rounds += 1;
        debug!(
            round = rounds,
            calls = response.tool_calls.len(),
            "executing tool calls"
        );

        // Independent calls run in parallel; join_all keeps the order of
        // the provider's tool_calls array for reassembly.
        let results: Vec<Result<String, String>> =
            join_all(response.tool_calls.iter().map(|tc| {
                let routes = &routes;
                async move {
                    let (server, tool) = match routes.get(&tc.name) {
                        Some(route) => route.clone(),
                        None => return Err(format!("unknown tool '{}'", tc.name)),
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => Err("tool call cancelled".to_string()),
                        result = router.call(&server, &tool, tc.arguments.clone()) => {
                            result.map_err(|e| e.to_string())
                        }
                    }
                }
            }))
            .await;

        request.messages.push(Message::assistant_with_calls(
            response.content.clone(),
            response.tool_calls.clone(),
        ));
        for (tc, result) in response.tool_calls.iter().zip(results) {
            let text = match result {
                Ok(text) => text,
                Err(e) => format!("Error calling tool {}: {}", tc.name, e),
            };
            request.messages.push(Message::tool(tc.id.clone(), text));
        }

        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
    }
}
