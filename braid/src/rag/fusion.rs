//! Rank fusion
//!
//! Combines ranked lists from multiple search strategies into one ranked
//! list. Per-source score components are preserved on each fused hit so
//! callers can inspect where a result came from.

use std::collections::HashMap;

use serde_json::Value;

use crate::config::FusionMethod;

/// Default RRF rank constant
pub const RRF_K: f64 = 60.0;

/// One candidate row from a single strategy, already ranked
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub text: String,
    pub metadata: Value,
    pub score: f64,
}

/// One ranked source feeding the fusion
#[derive(Debug, Clone)]
pub struct RankedSource {
    pub name: String,
    pub weight: f64,
    pub hits: Vec<SearchHit>,
}

#[derive(Debug, Clone)]
pub struct FusedHit {
    pub id: String,
    pub text: String,
    pub metadata: Value,
    pub score: f64,
    /// Per-source contribution, keyed by source name
    pub sources: HashMap<String, f64>,
}

/// Fuse ranked sources; the result is sorted by fused score descending.
pub fn fuse(method: FusionMethod, sources: &[RankedSource]) -> Vec<FusedHit> {
    let mut fused: HashMap<String, FusedHit> = HashMap::new();

    for source in sources {
        let max_score = source
            .hits
            .iter()
            .map(|h| h.score)
            .fold(f64::MIN, f64::max)
            .max(f64::EPSILON);

        for (rank, hit) in source.hits.iter().enumerate() {
            let contribution = match method {
                FusionMethod::Rrf => 1.0 / (RRF_K + (rank + 1) as f64),
                FusionMethod::Weighted => (hit.score / max_score) * source.weight,
                FusionMethod::Max | FusionMethod::Avg => hit.score,
            };

            let entry = fused.entry(hit.id.clone()).or_insert_with(|| FusedHit {
                id: hit.id.clone(),
                text: hit.text.clone(),
                metadata: hit.metadata.clone(),
                score: 0.0,
                sources: HashMap::new(),
            });
            entry.sources.insert(source.name.clone(), contribution);

            match method {
                FusionMethod::Rrf | FusionMethod::Weighted => entry.score += contribution,
                FusionMethod::Max => entry.score = entry.score.max(contribution),
                // running mean recomputed below from the components
                FusionMethod::Avg => {}
            }
        }
    }

    if method == FusionMethod::Avg {
        for hit in fused.values_mut() {
            let n = hit.sources.len().max(1) as f64;
            hit.score = hit.sources.values().sum::<f64>() / n;
        }
    }

    let mut out: Vec<FusedHit> = fused.into_values().collect();
    out.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hit(id: &str, score: f64) -> SearchHit {
        SearchHit {
            id: id.to_string(),
            text: format!("text {}", id),
            metadata: json!({}),
            score,
        }
    }

    fn sources() -> Vec<RankedSource> {
        vec![
            RankedSource {
                name: "dense".to_string(),
                weight: 1.0,
                hits: vec![hit("a", 0.9), hit("b", 0.8), hit("c", 0.1)],
            },
            RankedSource {
                name: "sparse".to_string(),
                weight: 0.5,
                hits: vec![hit("b", 0.7), hit("a", 0.2)],
            },
        ]
    }

    #[test]
    fn test_rrf_favours_agreement() {
        let fused = fuse(FusionMethod::Rrf, &sources());
        // a: 1/61 + 1/62, b: 1/62 + 1/61 -> tie broken by map order, both
        // above c: 1/63
        assert_eq!(fused.len(), 3);
        let c = fused.iter().find(|h| h.id == "c").unwrap();
        assert!((c.score - 1.0 / 63.0).abs() < 1e-9);
        assert!(fused[0].score > c.score);
        let a = fused.iter().find(|h| h.id == "a").unwrap();
        assert_eq!(a.sources.len(), 2);
    }

    #[test]
    fn test_weighted_applies_weights() {
        let fused = fuse(FusionMethod::Weighted, &sources());
        let a = fused.iter().find(|h| h.id == "a").unwrap();
        // dense: 0.9/0.9 * 1.0 = 1.0; sparse: 0.2/0.7 * 0.5
        assert!((a.score - (1.0 + 0.2 / 0.7 * 0.5)).abs() < 1e-9);
    }

    #[test]
    fn test_max_takes_best() {
        let fused = fuse(FusionMethod::Max, &sources());
        let b = fused.iter().find(|h| h.id == "b").unwrap();
        assert!((b.score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_avg_means_present_sources() {
        let fused = fuse(FusionMethod::Avg, &sources());
        let b = fused.iter().find(|h| h.id == "b").unwrap();
        assert!((b.score - (0.8 + 0.7) / 2.0).abs() < 1e-9);
        let c = fused.iter().find(|h| h.id == "c").unwrap();
        assert!((c.score - 0.1).abs() < 1e-9);
    }
}
