use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{LensError, Result},
    gateway::{ByteStream, Endpoint, InferenceGateway},
    generation::{
        frame::{FrameBuffer, MAX_PENDING_BYTES, StreamEvent, decode_frame},
        ledger::TokenLedger,
    },
    sampling::SamplingConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Streaming,
    Completed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted)
    }

    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Streaming)
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    temperature: f64,
    max_new_tokens: u32,
}

/// Published state of the current generation session.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub session_id: u64,
    pub state: SessionState,
    /// Prompt plus everything generated so far.
    pub text: String,
    pub ledger: TokenLedger,
    pub error: Option<LensError>,
    pub frames_skipped: usize,
}

impl SessionView {
    fn idle() -> Self {
        Self {
            session_id: 0,
            state: SessionState::Idle,
            text: String::new(),
            ledger: TokenLedger::new(),
            error: None,
            frames_skipped: 0,
        }
    }

    fn starting(session_id: u64, prompt: &str) -> Self {
        Self {
            session_id,
            state: SessionState::Starting,
            text: prompt.to_string(),
            ..Self::idle()
        }
    }

    fn abort(&mut self, error: LensError) {
        self.state = SessionState::Aborted;
        self.error = Some(error);
    }

    /// Applies one frame; returns true once the session is complete.
    fn apply_frame(&mut self, frame: &str) -> bool {
        match decode_frame(frame) {
            Ok(Some(StreamEvent::Done { final_text })) => {
                self.text = final_text;
                self.state = SessionState::Completed;
                true
            }
            Ok(Some(StreamEvent::Text { text, token })) => {
                self.text = text;
                if let Some(token) = token {
                    self.ledger.push(token);
                }
                false
            }
            Ok(None) => {
                debug!(session_id = self.session_id, frame, "ignoring frame");
                false
            }
            Err(err) => {
                warn!(session_id = self.session_id, %err, "skipping undecodable frame");
                self.frames_skipped += 1;
                false
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationSummary {
    pub session_id: u64,
    pub state: SessionState,
    pub final_text: String,
    pub new_tokens: usize,
    pub total_chars: usize,
    pub temperature: f64,
    pub tokens_per_second: f64,
    pub frames_skipped: usize,
    #[serde(skip)]
    pub error: Option<LensError>,
}

impl GenerationSummary {
    fn from_view(view: &SessionView, temperature: f64) -> Self {
        Self {
            session_id: view.session_id,
            state: view.state,
            final_text: view.text.clone(),
            new_tokens: view.ledger.len(),
            total_chars: view.text.chars().count(),
            temperature,
            tokens_per_second: view.ledger.tokens_per_second(),
            frames_skipped: view.frames_skipped,
            error: view.error.clone(),
        }
    }
}

enum Read {
    Chunk(bytes::Bytes),
    End,
    Failed(LensError),
    Idle(Duration),
    Cancelled,
}

/// Awaits `work`, giving up with the limit once it has been silent that long.
async fn within_idle_limit<F: Future>(
    idle_timeout: Option<Duration>,
    work: F,
) -> std::result::Result<F::Output, Duration> {
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, work).await.map_err(|_| limit),
        None => Ok(work.await),
    }
}

fn idle_error(limit: Duration) -> LensError {
    LensError::Timeout(format!("no stream data for {}s", limit.as_secs_f64()))
}

async fn read_next(stream: &mut ByteStream, idle_timeout: Option<Duration>) -> Read {
    let next = match within_idle_limit(idle_timeout, stream.next()).await {
        Ok(next) => next,
        Err(limit) => return Read::Idle(limit),
    };
    match next {
        Some(Ok(chunk)) => Read::Chunk(chunk),
        Some(Err(err)) => Read::Failed(err),
        None => Read::End,
    }
}

/// Owns the single current generation session and turns the service's
/// frame stream into a token ledger and a live text buffer.
///
/// Starting a session cancels the previous one; a superseded session never
/// writes to the published view again.
pub struct GenerationConsumer {
    gateway: Arc<dyn InferenceGateway>,
    idle_timeout: Option<Duration>,
    current: RwLock<SessionView>,
    next_session: AtomicU64,
    cancel: Mutex<CancellationToken>,
}

impl GenerationConsumer {
    pub fn new(gateway: Arc<dyn InferenceGateway>, idle_timeout: Option<Duration>) -> Self {
        Self {
            gateway,
            idle_timeout,
            current: RwLock::new(SessionView::idle()),
            next_session: AtomicU64::new(0),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn view(&self) -> SessionView {
        self.current.read().clone()
    }

    pub fn state(&self) -> SessionState {
        self.current.read().state
    }

    /// Stops the current session, if one is running.
    pub fn cancel(&self) {
        self.cancel.lock().cancel();
    }

    fn publish(&self, view: &SessionView) -> bool {
        let mut current = self.current.write();
        if current.session_id != view.session_id {
            return false;
        }
        current.clone_from(view);
        true
    }

    /// Runs one generation session to a terminal state. Only an invalid
    /// prompt is returned as `Err`, before any state changes; transport and
    /// protocol failures end the session as [`SessionState::Aborted`].
    pub async fn generate(&self, config: &SamplingConfig) -> Result<GenerationSummary> {
        let config = config.validated()?;
        let mut view = SessionView::starting(0, &config.prompt);
        // One critical section: the highest id always holds the live token.
        let (session_id, cancel) = {
            let mut slot = self.cancel.lock();
            let session_id = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
            slot.cancel();
            *slot = CancellationToken::new();
            view.session_id = session_id;
            *self.current.write() = view.clone();
            (session_id, slot.clone())
        };
        info!(session_id, max_new_tokens = config.max_new_tokens, "generation session starting");

        self.drive(&mut view, &config, &cancel).await;

        if view.state == SessionState::Aborted {
            if let Some(err) = &view.error {
                warn!(session_id, %err, "generation session aborted");
            }
        } else {
            info!(
                session_id,
                tokens = view.ledger.len(),
                tokens_per_second = view.ledger.tokens_per_second(),
                "generation session completed"
            );
        }
        if !self.publish(&view) {
            debug!(session_id, "session superseded, final state not published");
        }
        Ok(GenerationSummary::from_view(&view, config.temperature))
    }

    async fn drive(
        &self,
        view: &mut SessionView,
        config: &SamplingConfig,
        cancel: &CancellationToken,
    ) {
        let body = match serde_json::to_value(GenerateRequest {
            prompt: &config.prompt,
            temperature: config.temperature,
            max_new_tokens: config.max_new_tokens,
        }) {
            Ok(body) => body,
            Err(e) => return view.abort(LensError::Systemic(format!("cannot encode request: {e}"))),
        };

        let open = self.gateway.post_stream(Endpoint::Generate, &body);
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return view.abort(LensError::Cancelled),
            opened = within_idle_limit(self.idle_timeout, open) => opened,
        };
        let mut stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return view.abort(err),
            Err(limit) => return view.abort(idle_error(limit)),
        };

        view.state = SessionState::Streaming;
        if !self.publish(view) {
            return view.abort(LensError::Cancelled);
        }

        let mut frames = FrameBuffer::new();
        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => Read::Cancelled,
                read = read_next(&mut stream, self.idle_timeout) => read,
            };

            match read {
                Read::Chunk(chunk) => {
                    let done = frames
                        .push(&chunk)
                        .iter()
                        .any(|frame| view.apply_frame(frame));
                    if done {
                        return;
                    }
                    if frames.pending_len() > MAX_PENDING_BYTES {
                        return view.abort(LensError::FrameDecode(format!(
                            "no frame boundary within {MAX_PENDING_BYTES} bytes"
                        )));
                    }
                    if !self.publish(view) {
                        return view.abort(LensError::Cancelled);
                    }
                }
                Read::End => {
                    if let Some(rest) = frames.finish() {
                        if view.apply_frame(&rest) {
                            return;
                        }
                    }
                    return view.abort(LensError::Transport(
                        "stream closed before the done event".into(),
                    ));
                }
                Read::Failed(err) => return view.abort(err),
                Read::Idle(limit) => return view.abort(idle_error(limit)),
                Read::Cancelled => return view.abort(LensError::Cancelled),
            }
        }
    }
}
