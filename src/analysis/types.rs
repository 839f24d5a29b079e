use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    error::{LensError, Result},
    gateway::Endpoint,
    sampling::SamplingConfig,
};

/// The four analysis calls issued per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    Tokenization,
    Embeddings,
    Attention,
    Probabilities,
}

/// How a failed call is treated when the run is merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContributorPolicy {
    /// Failure is recorded in the run's error list.
    Required,
    /// Failure is dropped without a trace in the run result.
    Optional,
}

impl AnalysisKind {
    pub const ALL: [AnalysisKind; 4] = [
        AnalysisKind::Tokenization,
        AnalysisKind::Embeddings,
        AnalysisKind::Attention,
        AnalysisKind::Probabilities,
    ];

    pub fn endpoint(self) -> Endpoint {
        match self {
            AnalysisKind::Tokenization => Endpoint::Tokenize,
            AnalysisKind::Embeddings => Endpoint::Embeddings,
            AnalysisKind::Attention => Endpoint::Attention,
            AnalysisKind::Probabilities => Endpoint::Logits,
        }
    }

    pub fn policy(self) -> ContributorPolicy {
        match self {
            AnalysisKind::Attention => ContributorPolicy::Optional,
            _ => ContributorPolicy::Required,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AnalysisKind::Tokenization => "Tokenization",
            AnalysisKind::Embeddings => "Embeddings",
            AnalysisKind::Attention => "Attention",
            AnalysisKind::Probabilities => "Probabilities",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TextRequest<'a> {
    pub text: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogitsRequest<'a> {
    pub text: &'a str,
    pub temperature: f64,
    pub top_k: u32,
    pub top_p: f64,
}

impl<'a> LogitsRequest<'a> {
    pub fn from_config(config: &'a SamplingConfig) -> Self {
        Self {
            text: &config.prompt,
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
        }
    }
}

/// A response body that can be checked for structural consistency after
/// deserialization.
pub trait AnalysisPayload: DeserializeOwned + Send + 'static {
    fn validate(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub token: String,
    pub token_id: u32,
    pub position: usize,
    pub decoded: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenizationResult {
    #[serde(default)]
    pub original_text: String,
    pub tokens: Vec<String>,
    pub token_info: Vec<TokenInfo>,
    #[serde(default)]
    pub token_ids: Vec<u32>,
    #[serde(default)]
    pub vocab_size: Option<usize>,
}

impl AnalysisPayload for TokenizationResult {
    fn validate(&mut self) -> Result<()> {
        if self.tokens.len() != self.token_info.len() {
            return Err(LensError::Payload(format!(
                "tokenize returned {} tokens but {} token_info records",
                self.tokens.len(),
                self.token_info.len()
            )));
        }
        if let Some((idx, info)) = self
            .token_info
            .iter()
            .enumerate()
            .find(|(idx, info)| info.position != *idx)
        {
            return Err(LensError::Payload(format!(
                "token_info[{idx}] has position {}",
                info.position
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResult {
    pub embedding_dim: usize,
    #[serde(default)]
    pub tokens: Vec<String>,
    pub token_embeddings: Vec<Vec<f32>>,
    pub positional_embeddings: Vec<Vec<f32>>,
    pub combined_embeddings: Vec<Vec<f32>>,
}

impl EmbeddingResult {
    pub fn token_count(&self) -> usize {
        self.combined_embeddings.len()
    }
}

impl AnalysisPayload for EmbeddingResult {
    fn validate(&mut self) -> Result<()> {
        let count = self.token_embeddings.len();
        if self.positional_embeddings.len() != count || self.combined_embeddings.len() != count {
            return Err(LensError::Payload(format!(
                "embedding sequences differ in length ({count}, {}, {})",
                self.positional_embeddings.len(),
                self.combined_embeddings.len()
            )));
        }
        if !self.tokens.is_empty() && self.tokens.len() != count {
            return Err(LensError::Payload(format!(
                "{} tokens but {count} embedding vectors",
                self.tokens.len()
            )));
        }
        let dim = self.embedding_dim;
        let sets = [
            ("token", &self.token_embeddings),
            ("positional", &self.positional_embeddings),
            ("combined", &self.combined_embeddings),
        ];
        for (name, vectors) in sets {
            if let Some(idx) = vectors.iter().position(|v| v.len() != dim) {
                return Err(LensError::Payload(format!(
                    "{name} embedding {idx} has length {}, expected {dim}",
                    vectors[idx].len()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionLayer {
    #[serde(default)]
    pub layer: usize,
    pub num_heads: usize,
    /// One `tokens x tokens` matrix per head.
    pub attention_weights: Vec<Vec<Vec<f32>>>,
    pub average_attention: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionResult {
    pub num_layers: usize,
    #[serde(default)]
    pub tokens: Vec<String>,
    pub attention_layers: Vec<AttentionLayer>,
    /// Set by the service when it could not extract real weights.
    #[serde(default)]
    pub note: Option<String>,
}

impl AttentionResult {
    pub fn num_heads(&self) -> usize {
        self.attention_layers
            .first()
            .map(|layer| layer.num_heads)
            .unwrap_or(0)
    }

    /// Matrix for `(layer, head)`, or the head average when `head` is `None`.
    pub fn matrix(&self, layer: usize, head: Option<usize>) -> Option<&[Vec<f32>]> {
        let layer = self.attention_layers.get(layer)?;
        match head {
            Some(head) => layer.attention_weights.get(head).map(Vec::as_slice),
            None => Some(layer.average_attention.as_slice()),
        }
    }
}

fn check_square(matrix: &[Vec<f32>], size: usize, what: &str) -> Result<()> {
    if matrix.len() != size || matrix.iter().any(|row| row.len() != size) {
        return Err(LensError::Payload(format!(
            "{what} is not a {size}x{size} matrix"
        )));
    }
    if matrix.iter().flatten().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(LensError::Payload(format!(
            "{what} contains negative or non-finite weights"
        )));
    }
    Ok(())
}

impl AnalysisPayload for AttentionResult {
    fn validate(&mut self) -> Result<()> {
        if self.num_layers != self.attention_layers.len() {
            return Err(LensError::Payload(format!(
                "num_layers is {} but {} layers were sent",
                self.num_layers,
                self.attention_layers.len()
            )));
        }
        for (idx, layer) in self.attention_layers.iter().enumerate() {
            let size = if self.tokens.is_empty() {
                layer.average_attention.len()
            } else {
                self.tokens.len()
            };
            if layer.attention_weights.len() != layer.num_heads {
                return Err(LensError::Payload(format!(
                    "layer {idx} declares {} heads but sent {}",
                    layer.num_heads,
                    layer.attention_weights.len()
                )));
            }
            for (head, matrix) in layer.attention_weights.iter().enumerate() {
                check_square(matrix, size, &format!("layer {idx} head {head}"))?;
            }
            check_square(
                &layer.average_attention,
                size,
                &format!("layer {idx} average"),
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenProbability {
    pub token: String,
    pub probability: f64,
    pub logit: f64,
    #[serde(default)]
    pub token_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbabilityResult {
    pub vocab_size: usize,
    pub temperature: f64,
    pub top_tokens: Vec<TokenProbability>,
    #[serde(default)]
    pub input_text: Option<String>,
    #[serde(default)]
    pub next_token: Option<String>,
    #[serde(default)]
    pub next_token_id: Option<u32>,
}

impl AnalysisPayload for ProbabilityResult {
    fn validate(&mut self) -> Result<()> {
        if let Some(entry) = self
            .top_tokens
            .iter()
            .find(|entry| !entry.probability.is_finite() || entry.probability < 0.0)
        {
            return Err(LensError::Payload(format!(
                "token {:?} has probability {}",
                entry.token, entry.probability
            )));
        }
        // Ranking is by probability; restore it if the service did not.
        self.top_tokens
            .sort_by(|a, b| b.probability.total_cmp(&a.probability));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_name: String,
    #[serde(default)]
    pub device: Option<String>,
    pub vocab_size: usize,
    #[serde(default)]
    pub n_layer: Option<usize>,
    #[serde(default)]
    pub n_head: Option<usize>,
    #[serde(default)]
    pub n_embd: Option<usize>,
}
