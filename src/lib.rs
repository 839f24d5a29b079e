pub mod analysis;
pub mod config;
pub mod error;
pub mod gateway;
pub mod generation;
pub mod sampling;
pub mod state;
pub mod stats;

pub use analysis::{AnalysisOrchestrator, AnalysisRun, AnalysisSnapshot, AnalysisTrigger};
pub use config::AppConfig;
pub use error::{LensError, Result};
pub use gateway::{Endpoint, HttpGateway, InferenceGateway};
pub use generation::{GenerationConsumer, GenerationSummary, SessionState, TokenLedger};
pub use sampling::SamplingConfig;
pub use state::{AppState, ViewStep};
