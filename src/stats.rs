//! Descriptive statistics over fetched analysis payloads.
//!
//! Every function here is pure: same input, same output, no caching.

use serde::Serialize;

use crate::analysis::{
    AnalysisSnapshot, AttentionResult, EmbeddingResult, ProbabilityResult, TokenProbability,
};

const OVERVIEW_TOKENS: usize = 10;
const OVERVIEW_PREDICTIONS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VectorStats {
    pub mean: f64,
    pub std_dev: f64,
    pub max: f64,
    pub min: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatrixStats {
    pub max: f64,
    pub min: f64,
    pub mean: f64,
}

/// Mean, population standard deviation, max and min of one vector.
/// `None` for an empty vector.
pub fn vector_stats(values: &[f32]) -> Option<VectorStats> {
    if values.is_empty() {
        return None;
    }
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut max = f64::NEG_INFINITY;
    let mut min = f64::INFINITY;
    for &value in values {
        let value = f64::from(value);
        sum += value;
        sum_sq += value * value;
        max = max.max(value);
        min = min.min(value);
    }
    let n = values.len() as f64;
    let mean = sum / n;
    // E[x^2] - E[x]^2 can dip below zero by rounding.
    let variance = (sum_sq / n - mean * mean).max(0.0);

    Some(VectorStats {
        mean,
        std_dev: variance.sqrt(),
        max,
        min,
    })
}

/// Max, min and arithmetic mean over every cell of `matrix`.
pub fn matrix_stats(matrix: &[Vec<f32>]) -> Option<MatrixStats> {
    let mut count = 0usize;
    let mut acc = 0.0;
    let mut max = f64::NEG_INFINITY;
    let mut min = f64::INFINITY;
    for &value in matrix.iter().flatten() {
        let value = f64::from(value);
        count += 1;
        acc += value;
        max = max.max(value);
        min = min.min(value);
    }
    if count == 0 {
        None
    } else {
        Some(MatrixStats {
            max,
            min,
            mean: acc / count as f64,
        })
    }
}

/// Heatmap intensity of a cell: `value / matrix_max` clamped to `[0, 1]`,
/// and 0 when the matrix maximum is not positive.
pub fn intensity(value: f32, matrix_max: f64) -> f64 {
    if matrix_max <= 0.0 || !matrix_max.is_finite() {
        return 0.0;
    }
    (f64::from(value) / matrix_max).clamp(0.0, 1.0)
}

pub fn intensity_grid(matrix: &[Vec<f32>]) -> Vec<Vec<f64>> {
    let max = matrix_stats(matrix).map(|s| s.max).unwrap_or(0.0);
    matrix
        .iter()
        .map(|row| row.iter().map(|&value| intensity(value, max)).collect())
        .collect()
}

/// Sum of `probability` over the first `k` ranked entries.
pub fn cumulative_mass(entries: &[TokenProbability], k: usize) -> f64 {
    entries.iter().take(k).map(|entry| entry.probability).sum()
}

/// Derived statistics attached to a snapshot when it is built.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SnapshotAnnotations {
    /// One entry per token, over the combined embedding.
    pub embedding_stats: Vec<Option<VectorStats>>,
    /// One entry per layer, over the head-averaged matrix.
    pub attention_stats: Vec<Option<MatrixStats>>,
    pub top_k: usize,
    pub top_k_mass: Option<f64>,
}

impl SnapshotAnnotations {
    pub fn compute(
        embeddings: Option<&EmbeddingResult>,
        attention: Option<&AttentionResult>,
        probabilities: Option<&ProbabilityResult>,
        top_k: usize,
    ) -> Self {
        let embedding_stats = embeddings
            .map(|e| e.combined_embeddings.iter().map(|v| vector_stats(v)).collect())
            .unwrap_or_default();
        let attention_stats = attention
            .map(|a| {
                a.attention_layers
                    .iter()
                    .map(|layer| matrix_stats(&layer.average_attention))
                    .collect()
            })
            .unwrap_or_default();
        let top_k_mass = probabilities.map(|p| cumulative_mass(&p.top_tokens, top_k));

        Self {
            embedding_stats,
            attention_stats,
            top_k,
            top_k_mass,
        }
    }
}

/// Byte-level BPE marks a leading space with `Ġ`; show it as `▁`.
pub fn display_token(token: &str) -> String {
    token.replace('Ġ', "▁")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub token: String,
    pub percent: f64,
}

/// Headline numbers for the overview panel.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OverviewSummary {
    pub token_count: Option<usize>,
    pub embedding_dim: Option<usize>,
    pub num_layers: Option<usize>,
    pub top_token_count: Option<usize>,
    pub preview_tokens: Vec<String>,
    pub hidden_tokens: usize,
    pub predictions: Vec<Prediction>,
}

impl OverviewSummary {
    pub fn from_snapshot(snapshot: &AnalysisSnapshot) -> Self {
        let tokens = snapshot
            .tokenization
            .as_ref()
            .map(|t| t.tokens.as_slice())
            .unwrap_or_default();
        let predictions = snapshot
            .probabilities
            .as_ref()
            .map(|p| {
                p.top_tokens
                    .iter()
                    .take(OVERVIEW_PREDICTIONS)
                    .map(|entry| Prediction {
                        token: entry.token.clone(),
                        percent: entry.probability * 100.0,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            token_count: snapshot.tokenization.as_ref().map(|t| t.tokens.len()),
            embedding_dim: snapshot.embeddings.as_ref().map(|e| e.embedding_dim),
            num_layers: snapshot.attention.as_ref().map(|a| a.num_layers),
            top_token_count: snapshot.probabilities.as_ref().map(|p| p.top_tokens.len()),
            preview_tokens: tokens
                .iter()
                .take(OVERVIEW_TOKENS)
                .map(|t| display_token(t))
                .collect(),
            hidden_tokens: tokens.len().saturating_sub(OVERVIEW_TOKENS),
            predictions,
        }
    }
}
