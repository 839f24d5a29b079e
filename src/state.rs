use std::{fmt, sync::Arc};

use serde::Serialize;

use crate::{
    analysis::{AnalysisRun, AnalysisSnapshot},
    sampling::SamplingConfig,
    stats::OverviewSummary,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewStep {
    Overview,
    Tokenize,
    Embeddings,
    Attention,
    Probabilities,
    Generate,
}

impl ViewStep {
    pub const ALL: [ViewStep; 6] = [
        ViewStep::Overview,
        ViewStep::Tokenize,
        ViewStep::Embeddings,
        ViewStep::Attention,
        ViewStep::Probabilities,
        ViewStep::Generate,
    ];

    pub fn description(self) -> &'static str {
        match self {
            ViewStep::Overview => "See all analysis at once",
            ViewStep::Tokenize => "Break text into tokens",
            ViewStep::Embeddings => "Convert tokens to vectors",
            ViewStep::Attention => "Find token relationships",
            ViewStep::Probabilities => "Calculate next token odds",
            ViewStep::Generate => "Create new text",
        }
    }
}

impl fmt::Display for ViewStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ViewStep::Overview => "Overview",
            ViewStep::Tokenize => "Tokenization",
            ViewStep::Embeddings => "Embeddings",
            ViewStep::Attention => "Attention",
            ViewStep::Probabilities => "Probabilities",
            ViewStep::Generate => "Generate",
        };
        f.write_str(name)
    }
}

/// What the presentation layer reads. Core components hand it finished
/// results; it never reaches back into them.
#[derive(Debug, Clone)]
pub struct AppState {
    pub config: SamplingConfig,
    pub current_step: ViewStep,
    pub auto_analyze: bool,
    snapshot: Option<Arc<AnalysisSnapshot>>,
}

impl AppState {
    pub fn new(config: SamplingConfig, auto_analyze: bool) -> Self {
        Self {
            config,
            current_step: ViewStep::Overview,
            auto_analyze,
            snapshot: None,
        }
    }

    pub fn snapshot(&self) -> Option<&AnalysisSnapshot> {
        self.snapshot.as_deref()
    }

    /// Replaces the snapshot and follows the run's focus hint.
    pub fn apply_run(&mut self, run: &AnalysisRun) {
        self.snapshot = Some(run.snapshot.clone());
        if let Some(step) = run.focus_hint {
            self.current_step = step;
        }
    }

    pub fn overview(&self) -> Option<OverviewSummary> {
        self.snapshot().map(OverviewSummary::from_snapshot)
    }

    pub fn reset(&mut self) {
        self.snapshot = None;
        self.current_step = ViewStep::Generate;
    }
}
