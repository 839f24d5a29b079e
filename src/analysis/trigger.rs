use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error};

use crate::{
    analysis::orchestrator::{AnalysisOrchestrator, AnalysisRun},
    config::AppConfig,
    error::Result,
    sampling::SamplingConfig,
};

/// Debounced auto-analysis. Every prompt change cancels the pending timer;
/// a run starts once the prompt has been quiet for the debounce interval.
/// A run that already started is never cancelled by a later change.
pub struct AnalysisTrigger {
    orchestrator: Arc<AnalysisOrchestrator>,
    debounce: Duration,
    min_prompt_chars: usize,
    auto_analyze: AtomicBool,
    pending: Mutex<Option<JoinHandle<()>>>,
    outcomes: mpsc::UnboundedSender<Result<AnalysisRun>>,
}

impl AnalysisTrigger {
    /// The receiver yields the outcome of every debounced run.
    pub fn new(
        orchestrator: Arc<AnalysisOrchestrator>,
        config: &AppConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Result<AnalysisRun>>) {
        let (outcomes, receiver) = mpsc::unbounded_channel();
        let trigger = Self {
            orchestrator,
            debounce: config.debounce,
            min_prompt_chars: config.min_prompt_chars,
            auto_analyze: AtomicBool::new(config.auto_analyze),
            pending: Mutex::new(None),
            outcomes,
        };
        (trigger, receiver)
    }

    pub fn set_auto_analyze(&self, enabled: bool) {
        self.auto_analyze.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.cancel_pending();
        }
    }

    pub fn auto_analyze(&self) -> bool {
        self.auto_analyze.load(Ordering::SeqCst)
    }

    pub fn has_pending(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn qualifies(&self, prompt: &str) -> bool {
        prompt.trim().chars().count() > self.min_prompt_chars
    }

    /// Records a prompt edit. Returns whether a debounced run was scheduled.
    pub fn on_prompt_changed(&self, config: &SamplingConfig) -> bool {
        let mut pending = self.pending.lock();
        if let Some(previous) = pending.take() {
            previous.abort();
        }
        if !self.auto_analyze() || !self.qualifies(&config.prompt) {
            return false;
        }

        let orchestrator = self.orchestrator.clone();
        let outcomes = self.outcomes.clone();
        let config = config.clone();
        let debounce = self.debounce;
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            debug!(?debounce, "prompt settled, analyzing");
            // Detached so that later edits cannot abort a run in flight.
            tokio::spawn(async move {
                let outcome = orchestrator.run(&config).await;
                if let Err(err) = &outcome {
                    if err.is_user_visible() {
                        error!(%err, "analysis failed");
                    }
                }
                let _ = outcomes.send(outcome);
            });
        }));
        true
    }

    /// Explicit analyze command: drops any pending timer and runs now.
    pub async fn trigger_now(&self, config: &SamplingConfig) -> Result<AnalysisRun> {
        self.cancel_pending();
        self.orchestrator.run(config).await
    }

    /// Runs the pending debounced analysis right away instead of waiting out
    /// the timer. `None` when no timer was waiting.
    pub async fn flush_pending(&self, config: &SamplingConfig) -> Option<Result<AnalysisRun>> {
        let handle = self.pending.lock().take()?;
        if handle.is_finished() {
            return None;
        }
        handle.abort();
        debug!("flushing pending analysis");
        Some(self.orchestrator.run(config).await)
    }

    pub fn cancel_pending(&self) {
        if let Some(handle) = self.pending.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for AnalysisTrigger {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::gateway::{
        Endpoint,
        testing::{Scripted, ScriptedGateway},
    };

    fn scripted_run() -> ScriptedGateway {
        script_run(ScriptedGateway::new(), 0)
    }

    /// Queues one full run whose calls settle after `delay_ms`.
    fn script_run(gateway: ScriptedGateway, delay_ms: u64) -> ScriptedGateway {
        let settle = |response: Scripted| {
            if delay_ms == 0 {
                response
            } else {
                Scripted::delayed(delay_ms, response)
            }
        };
        gateway
            .script(
                Endpoint::Tokenize,
                settle(Scripted::Json(json!({
                    "tokens": ["Hello", "Ġworld"],
                    "token_info": [
                        {"token": "Hello", "token_id": 15496, "position": 0, "decoded": "Hello"},
                        {"token": "Ġworld", "token_id": 995, "position": 1, "decoded": " world"}
                    ]
                }))),
            )
            .script(
                Endpoint::Embeddings,
                settle(Scripted::Json(json!({
                    "embedding_dim": 1,
                    "token_embeddings": [[0.1], [0.2]],
                    "positional_embeddings": [[0.0], [0.1]],
                    "combined_embeddings": [[0.1], [0.3]]
                }))),
            )
            .script(
                Endpoint::Attention,
                settle(Scripted::Fail(crate::error::LensError::Transport(
                    "unsupported".into(),
                ))),
            )
            .script(
                Endpoint::Logits,
                settle(Scripted::Json(json!({
                    "vocab_size": 50257,
                    "temperature": 0.8,
                    "top_tokens": [{"token": "!", "probability": 0.3, "logit": 2.0}]
                }))),
            )
    }

    fn trigger(
        gateway: Arc<ScriptedGateway>,
    ) -> (AnalysisTrigger, mpsc::UnboundedReceiver<Result<AnalysisRun>>) {
        let orchestrator = Arc::new(AnalysisOrchestrator::new(gateway, 20));
        AnalysisTrigger::new(orchestrator, &AppConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_edits_collapse_into_one_run() {
        let gateway = Arc::new(scripted_run());
        let (trigger, mut outcomes) = trigger(gateway.clone());

        for prompt in ["Hell", "Hello", "Hello w", "Hello world"] {
            assert!(trigger.on_prompt_changed(&SamplingConfig::with_prompt(prompt)));
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        assert_eq!(gateway.call_count(), 0);

        tokio::time::sleep(Duration::from_millis(800)).await;
        let run = outcomes.recv().await.unwrap().unwrap();

        assert_eq!(gateway.call_count(), 4);
        assert_eq!(run.snapshot.prompt, "Hello world");
        assert!(run.errors.is_empty());
        assert!(!trigger.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn short_prompts_do_not_schedule() {
        let gateway = Arc::new(ScriptedGateway::new());
        let (trigger, _outcomes) = trigger(gateway.clone());

        assert!(!trigger.on_prompt_changed(&SamplingConfig::with_prompt("  abc  ")));
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(gateway.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disabling_auto_analyze_drops_pending_timer() {
        let gateway = Arc::new(ScriptedGateway::new());
        let (trigger, _outcomes) = trigger(gateway.clone());

        assert!(trigger.on_prompt_changed(&SamplingConfig::with_prompt("Hello world")));
        assert!(trigger.has_pending());
        trigger.set_auto_analyze(false);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(gateway.call_count(), 0);
        assert!(!trigger.on_prompt_changed(&SamplingConfig::with_prompt("Hello again")));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_command_runs_immediately() {
        let gateway = Arc::new(scripted_run());
        let (trigger, _outcomes) = trigger(gateway.clone());

        trigger.on_prompt_changed(&SamplingConfig::with_prompt("Hello world"));
        let run = trigger
            .trigger_now(&SamplingConfig::with_prompt("Hello world"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(run.snapshot.tokenization.as_ref().unwrap().tokens.len(), 2);
        assert_eq!(gateway.call_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn edit_during_run_leaves_it_running() {
        let gateway = Arc::new(script_run(script_run(ScriptedGateway::new(), 2_000), 0));
        let orchestrator = Arc::new(AnalysisOrchestrator::new(gateway.clone(), 20));
        let (trigger, mut outcomes) =
            AnalysisTrigger::new(orchestrator.clone(), &AppConfig::default());

        assert!(trigger.on_prompt_changed(&SamplingConfig::with_prompt("Hello world")));
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(gateway.call_count(), 4);
        assert!(orchestrator.is_analyzing());

        assert!(trigger.on_prompt_changed(&SamplingConfig::with_prompt("Hello world again")));

        let newer = outcomes.recv().await.unwrap().unwrap();
        let older = outcomes.recv().await.unwrap().unwrap();
        assert_eq!(newer.snapshot.prompt, "Hello world again");
        assert_eq!(older.snapshot.prompt, "Hello world");
        assert!(older.snapshot.tokenization.is_some());
        assert_eq!(gateway.call_count(), 8);
        assert_eq!(orchestrator.latest().unwrap().prompt, "Hello world");
    }

    #[tokio::test(start_paused = true)]
    async fn flushing_runs_pending_edit_once() {
        let gateway = Arc::new(scripted_run());
        let (trigger, _outcomes) = trigger(gateway.clone());
        let config = SamplingConfig::with_prompt("Hello world");

        trigger.on_prompt_changed(&config);
        let run = trigger.flush_pending(&config).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(run.snapshot.prompt, "Hello world");
        assert_eq!(gateway.call_count(), 4);
        assert!(!trigger.has_pending());
        assert!(trigger.flush_pending(&config).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn run_in_flight_reports_after_trigger_is_dropped() {
        let gateway = Arc::new(script_run(ScriptedGateway::new(), 2_000));
        let (trigger, mut outcomes) = trigger(gateway.clone());
        let config = SamplingConfig::with_prompt("Hello world");

        trigger.on_prompt_changed(&config);
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(trigger.flush_pending(&config).await.is_none());
        drop(trigger);

        let run = outcomes.recv().await.unwrap().unwrap();
        assert_eq!(run.snapshot.prompt, "Hello world");
        assert!(outcomes.recv().await.is_none());
        assert_eq!(gateway.call_count(), 4);
    }
}
