mod orchestrator;
mod trigger;
mod types;

pub use orchestrator::{AnalysisOrchestrator, AnalysisRun, AnalysisSnapshot, ContributorError};
pub use trigger::AnalysisTrigger;
pub use types::{
    AnalysisKind, AnalysisPayload, AttentionLayer, AttentionResult, ContributorPolicy,
    EmbeddingResult, LogitsRequest, ModelInfo, ProbabilityResult, TextRequest, TokenInfo,
    TokenProbability, TokenizationResult,
};
