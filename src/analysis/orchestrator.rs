use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    analysis::types::{
        AnalysisKind, AnalysisPayload, AttentionResult, ContributorPolicy, EmbeddingResult,
        LogitsRequest, ModelInfo, ProbabilityResult, TextRequest, TokenizationResult,
    },
    error::{LensError, Result},
    gateway::{Endpoint, InferenceGateway},
    sampling::SamplingConfig,
    state::ViewStep,
    stats::SnapshotAnnotations,
};

/// Results of one analysis run. Each field is present only when its call
/// succeeded with a well-formed payload.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalysisSnapshot {
    pub run_id: u64,
    pub prompt: String,
    pub tokenization: Option<TokenizationResult>,
    pub embeddings: Option<EmbeddingResult>,
    pub attention: Option<AttentionResult>,
    pub probabilities: Option<ProbabilityResult>,
    pub annotations: SnapshotAnnotations,
}

impl AnalysisSnapshot {
    pub fn has(&self, kind: AnalysisKind) -> bool {
        match kind {
            AnalysisKind::Tokenization => self.tokenization.is_some(),
            AnalysisKind::Embeddings => self.embeddings.is_some(),
            AnalysisKind::Attention => self.attention.is_some(),
            AnalysisKind::Probabilities => self.probabilities.is_some(),
        }
    }

    pub fn is_empty(&self) -> bool {
        !AnalysisKind::ALL.iter().any(|kind| self.has(*kind))
    }
}

/// A required call that did not contribute to the snapshot.
#[derive(Debug, Clone)]
pub struct ContributorError {
    pub kind: AnalysisKind,
    pub error: LensError,
}

impl fmt::Display for ContributorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.kind.label(), self.error)
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisRun {
    pub snapshot: Arc<AnalysisSnapshot>,
    pub errors: Vec<ContributorError>,
    /// Where the presentation layer may want to move focus. Advisory only.
    pub focus_hint: Option<ViewStep>,
}

enum SubResult {
    Tokenization(TokenizationResult),
    Embeddings(EmbeddingResult),
    Attention(AttentionResult),
    Probabilities(ProbabilityResult),
}

fn decode<T: AnalysisPayload>(value: Value) -> Result<T> {
    let mut payload: T = serde_json::from_value(value)?;
    payload.validate()?;
    Ok(payload)
}

impl SubResult {
    fn decode(kind: AnalysisKind, value: Value) -> Result<Self> {
        Ok(match kind {
            AnalysisKind::Tokenization => SubResult::Tokenization(decode(value)?),
            AnalysisKind::Embeddings => SubResult::Embeddings(decode(value)?),
            AnalysisKind::Attention => SubResult::Attention(decode(value)?),
            AnalysisKind::Probabilities => SubResult::Probabilities(decode(value)?),
        })
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct AnalysisOrchestrator {
    gateway: Arc<dyn InferenceGateway>,
    latest: RwLock<Option<Arc<AnalysisSnapshot>>>,
    next_run: AtomicU64,
    in_flight: AtomicUsize,
    top_k_mass: usize,
}

impl AnalysisOrchestrator {
    pub fn new(gateway: Arc<dyn InferenceGateway>, top_k_mass: usize) -> Self {
        Self {
            gateway,
            latest: RwLock::new(None),
            next_run: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            top_k_mass,
        }
    }

    /// Snapshot of the most recently completed run.
    pub fn latest(&self) -> Option<Arc<AnalysisSnapshot>> {
        self.latest.read().clone()
    }

    pub fn clear(&self) {
        self.latest.write().take();
    }

    pub fn is_analyzing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    /// Issues the four analysis calls concurrently and merges whatever
    /// settles into a new snapshot. Only validation and setup failures are
    /// returned as `Err`; per-call failures end up in [`AnalysisRun::errors`].
    pub async fn run(&self, config: &SamplingConfig) -> Result<AnalysisRun> {
        let config = config.validated()?;
        let run_id = self.next_run.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight::enter(&self.in_flight);

        let text_body = serde_json::to_value(TextRequest {
            text: &config.prompt,
        })
        .map_err(|e| LensError::Systemic(format!("cannot encode request: {e}")))?;
        let logits_body = serde_json::to_value(LogitsRequest::from_config(&config))
            .map_err(|e| LensError::Systemic(format!("cannot encode request: {e}")))?;

        info!(run_id, prompt_len = config.prompt.len(), "starting analysis run");

        let calls = AnalysisKind::ALL.map(|kind| {
            let body = match kind {
                AnalysisKind::Probabilities => &logits_body,
                _ => &text_body,
            };
            self.fetch(kind, body)
        });
        let settled = join_all(calls).await;

        let run = self.merge(run_id, config.prompt, settled);
        self.latest.write().replace(run.snapshot.clone());

        if !run.errors.is_empty() {
            let messages: Vec<String> = run.errors.iter().map(ToString::to_string).collect();
            warn!(run_id, errors = ?messages, "some analysis steps failed");
        }
        info!(run_id, empty = run.snapshot.is_empty(), "analysis run settled");

        Ok(run)
    }

    async fn fetch(&self, kind: AnalysisKind, body: &Value) -> (AnalysisKind, Result<SubResult>) {
        let result = match self.gateway.post_json(kind.endpoint(), body).await {
            Ok(value) => SubResult::decode(kind, value),
            Err(err) => Err(err),
        };
        (kind, result)
    }

    fn merge(
        &self,
        run_id: u64,
        prompt: String,
        settled: Vec<(AnalysisKind, Result<SubResult>)>,
    ) -> AnalysisRun {
        let mut snapshot = AnalysisSnapshot {
            run_id,
            prompt,
            ..AnalysisSnapshot::default()
        };
        let mut errors = Vec::new();

        for (kind, result) in settled {
            match result {
                Ok(SubResult::Tokenization(r)) => snapshot.tokenization = Some(r),
                Ok(SubResult::Embeddings(r)) => snapshot.embeddings = Some(r),
                Ok(SubResult::Attention(r)) => snapshot.attention = Some(r),
                Ok(SubResult::Probabilities(r)) => snapshot.probabilities = Some(r),
                Err(error) => match kind.policy() {
                    ContributorPolicy::Required => errors.push(ContributorError { kind, error }),
                    ContributorPolicy::Optional => {
                        debug!(run_id, ?kind, %error, "optional analysis unavailable");
                    }
                },
            }
        }

        snapshot.annotations = SnapshotAnnotations::compute(
            snapshot.embeddings.as_ref(),
            snapshot.attention.as_ref(),
            snapshot.probabilities.as_ref(),
            self.top_k_mass,
        );
        let focus_hint = snapshot.tokenization.is_some().then_some(ViewStep::Tokenize);

        AnalysisRun {
            snapshot: Arc::new(snapshot),
            errors,
            focus_hint,
        }
    }

    pub async fn model_info(&self) -> Result<ModelInfo> {
        let value = self.gateway.get_json(Endpoint::ModelInfo).await?;
        Ok(serde_json::from_value(value)?)
    }
}
