//! Consensus execution
//!
//! Fans the same prompt out to several providers in parallel, groups the
//! normalised responses, and decides pass/fail per the agreement rule.

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::llm::{CompletionRequest, Message, ProviderSource};

use super::{ConsensusRequirement, ConsensusSpec, EffectiveContext};

#[derive(Debug, Clone, Serialize)]
pub struct ConsensusVote {
    pub provider: String,
    pub model: Option<String>,
    pub response: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsensusResult {
    pub success: bool,
    pub result: Value,
    /// Winning-group share of all executions
    pub agreement: f64,
    pub confidence: String,
    pub votes: Vec<ConsensusVote>,
}

/// Run `spec.executions.len()` provider calls in parallel and vote.
/// `prompt`/`system` arrive already substituted.
pub async fn run_consensus(
    providers: &dyn ProviderSource,
    spec: &ConsensusSpec,
    prompt: &str,
    system: Option<&str>,
    effective: &EffectiveContext,
    cancel: &CancellationToken,
) -> ConsensusResult {
    let calls = spec.executions.iter().map(|exec| {
        let mut messages = Vec::new();
        if let Some(system) = system {
            messages.push(Message::system(system));
        }
        messages.push(Message::user(prompt));
        let request = CompletionRequest {
            messages,
            temperature: effective.temperature,
            max_tokens: effective.max_tokens,
            ..Default::default()
        };

        async move {
            let provider = match providers.create(&exec.provider, exec.model.as_deref()) {
                Ok(p) => p,
                Err(e) => {
                    return ConsensusVote {
                        provider: exec.provider.clone(),
                        model: exec.model.clone(),
                        response: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => Err("cancelled".to_string()),
                r = provider.complete(request) => r.map_err(|e| e.to_string()),
            };
            match result {
                Ok(response) => ConsensusVote {
                    provider: exec.provider.clone(),
                    model: exec.model.clone(),
                    response: Some(response.content),
                    error: None,
                },
                Err(error) => {
                    warn!(provider = %exec.provider, %error, "consensus execution failed");
                    ConsensusVote {
                        provider: exec.provider.clone(),
                        model: exec.model.clone(),
                        response: None,
                        error: Some(error),
                    }
                }
            }
        }
    });

    let votes: Vec<ConsensusVote> = join_all(calls).await;
    tally(spec.require, votes)
}

fn normalise(response: &str) -> String {
    response.trim().to_lowercase()
}

fn tally(require: ConsensusRequirement, votes: Vec<ConsensusVote>) -> ConsensusResult {
    let total = votes.len();

    // Group by normalised response; remember the first raw variant.
    let mut groups: Vec<(String, String, usize)> = Vec::new();
    for vote in &votes {
        if let Some(response) = &vote.response {
            let key = normalise(response);
            match groups.iter_mut().find(|(k, _, _)| *k == key) {
                Some((_, _, count)) => *count += 1,
                None => groups.push((key, response.clone(), 1)),
            }
        }
    }
    groups.sort_by(|a, b| b.2.cmp(&a.2));

    let (winner, agreement) = match groups.first() {
        Some((_, raw, count)) => (Value::String(raw.clone()), *count as f64 / total.max(1) as f64),
        None => (Value::Null, 0.0),
    };

    let success = match require {
        ConsensusRequirement::Unanimous => (agreement - 1.0).abs() < f64::EPSILON,
        ConsensusRequirement::TwoThirds => agreement + f64::EPSILON >= 2.0 / 3.0,
        ConsensusRequirement::Majority => agreement > 0.5,
    };
    let confidence = if (agreement - 1.0).abs() < f64::EPSILON {
        "high"
    } else if agreement + f64::EPSILON >= 2.0 / 3.0 {
        "good"
    } else if agreement > 0.5 {
        "fair"
    } else {
        "low"
    };
    debug!(agreement, success, "consensus tallied");

    ConsensusResult {
        success,
        result: winner,
        agreement,
        confidence: confidence.to_string(),
        votes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(response: Option<&str>) -> ConsensusVote {
        ConsensusVote {
            provider: "p".to_string(),
            model: None,
            response: response.map(str::to_string),
            error: None,
        }
    }

    #[test]
    fn test_two_thirds_passes() {
        let result = tally(
            ConsensusRequirement::TwoThirds,
            vec![vote(Some("A")), vote(Some("A")), vote(Some("B"))],
        );
        assert!(result.success);
        assert_eq!(result.result, Value::String("A".to_string()));
        assert!((result.agreement - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(result.confidence, "good");
    }

    #[test]
    fn test_unanimous_requires_all() {
        let result = tally(
            ConsensusRequirement::Unanimous,
            vec![vote(Some("A")), vote(Some("a "))],
        );
        // normalisation folds case and whitespace
        assert!(result.success);
        assert_eq!(result.confidence, "high");

        let result = tally(
            ConsensusRequirement::Unanimous,
            vec![vote(Some("A")), vote(Some("B"))],
        );
        assert!(!result.success);
    }

    #[test]
    fn test_majority_with_failures() {
        let result = tally(
            ConsensusRequirement::Majority,
            vec![vote(Some("A")), vote(Some("A")), vote(None)],
        );
        assert!(result.success);
        assert!((result.agreement - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_all_failed() {
        let result = tally(ConsensusRequirement::Majority, vec![vote(None), vote(None)]);
        assert!(!result.success);
        assert_eq!(result.result, Value::Null);
        assert_eq!(result.confidence, "low");
    }
}
