use std::{fmt, pin::Pin, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{Client, Response};
use serde_json::Value;
use tracing::debug;

use crate::{
    config::AppConfig,
    error::{LensError, Result},
};

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Routes exposed by the inference service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Tokenize,
    Embeddings,
    Attention,
    Logits,
    Generate,
    ModelInfo,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::Tokenize => "tokenize",
            Endpoint::Embeddings => "embeddings",
            Endpoint::Attention => "attention",
            Endpoint::Logits => "logits",
            Endpoint::Generate => "generate",
            Endpoint::ModelInfo => "models/info",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// "POST JSON, get JSON" and "POST JSON, get bytes" against the service.
/// Implementations own status and transport classification: any non-2xx
/// status comes back as [`LensError::Protocol`].
#[async_trait]
pub trait InferenceGateway: Send + Sync {
    async fn post_json(&self, endpoint: Endpoint, body: &Value) -> Result<Value>;

    async fn post_stream(&self, endpoint: Endpoint, body: &Value) -> Result<ByteStream>;

    async fn get_json(&self, endpoint: Endpoint) -> Result<Value>;
}

pub struct HttpGateway {
    base_url: String,
    http_client: Client,
    request_timeout: Duration,
}

impl HttpGateway {
    pub fn new(config: &AppConfig) -> Result<Self> {
        // No client-wide timeout: it would also bound how long a generation
        // stream may stay open.
        let http_client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| LensError::Systemic(format!("http client setup failed: {e}")))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http_client,
            request_timeout: config.request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: Endpoint) -> String {
        format!("{}/{}", self.base_url, endpoint.path())
    }
}

async fn ensure_success(endpoint: Endpoint, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    debug!(%endpoint, %status, "service rejected request");
    Err(LensError::Protocol { status, message })
}

#[async_trait]
impl InferenceGateway for HttpGateway {
    async fn post_json(&self, endpoint: Endpoint, body: &Value) -> Result<Value> {
        let response = self
            .http_client
            .post(self.url(endpoint))
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await?;
        let response = ensure_success(endpoint, response).await?;
        Ok(response.json::<Value>().await?)
    }

    async fn post_stream(&self, endpoint: Endpoint, body: &Value) -> Result<ByteStream> {
        let response = self
            .http_client
            .post(self.url(endpoint))
            .json(body)
            .send()
            .await?;
        let response = ensure_success(endpoint, response).await?;
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(LensError::from));
        Ok(Box::pin(stream))
    }

    async fn get_json(&self, endpoint: Endpoint) -> Result<Value> {
        let response = self
            .http_client
            .get(self.url(endpoint))
            .timeout(self.request_timeout)
            .send()
            .await?;
        let response = ensure_success(endpoint, response).await?;
        Ok(response.json::<Value>().await?)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-memory gateway for unit tests.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    pub enum Scripted {
        Json(Value),
        Fail(LensError),
        Stream(Vec<Result<Bytes>>),
        /// Stream that yields the chunks and then never ends.
        Hanging(Vec<Result<Bytes>>),
        /// Resolves to the inner response after a delay.
        Delayed(Duration, Box<Scripted>),
        /// The call itself never resolves.
        Stalled,
    }

    impl Scripted {
        pub fn delayed(millis: u64, inner: Scripted) -> Self {
            Scripted::Delayed(Duration::from_millis(millis), Box::new(inner))
        }
    }

    #[derive(Default)]
    pub struct ScriptedGateway {
        responses: Mutex<HashMap<Endpoint, Vec<Scripted>>>,
        pub calls: AtomicUsize,
        pub bodies: Mutex<Vec<(Endpoint, Value)>>,
    }

    impl ScriptedGateway {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn script(self, endpoint: Endpoint, response: Scripted) -> Self {
            self.responses
                .lock()
                .entry(endpoint)
                .or_default()
                .push(response);
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn next(&self, endpoint: Endpoint, body: Option<&Value>) -> Result<Scripted> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(body) = body {
                self.bodies.lock().push((endpoint, body.clone()));
            }
            let mut responses = self.responses.lock();
            let queue = responses
                .get_mut(&endpoint)
                .filter(|queue| !queue.is_empty())
                .ok_or_else(|| LensError::Transport(format!("no script for {endpoint}")))?;
            Ok(queue.remove(0))
        }

        async fn resolve(&self, endpoint: Endpoint, body: Option<&Value>) -> Result<Scripted> {
            let mut scripted = self.next(endpoint, body)?;
            loop {
                match scripted {
                    Scripted::Delayed(delay, inner) => {
                        tokio::time::sleep(delay).await;
                        scripted = *inner;
                    }
                    Scripted::Stalled => scripted = futures::future::pending().await,
                    other => return Ok(other),
                }
            }
        }
    }

    #[async_trait]
    impl InferenceGateway for ScriptedGateway {
        async fn post_json(&self, endpoint: Endpoint, body: &Value) -> Result<Value> {
            match self.resolve(endpoint, Some(body)).await? {
                Scripted::Json(value) => Ok(value),
                Scripted::Fail(err) => Err(err),
                _ => Err(LensError::Transport("scripted stream on json call".into())),
            }
        }

        async fn post_stream(&self, endpoint: Endpoint, body: &Value) -> Result<ByteStream> {
            match self.resolve(endpoint, Some(body)).await? {
                Scripted::Stream(chunks) => Ok(Box::pin(futures::stream::iter(chunks))),
                Scripted::Hanging(chunks) => Ok(Box::pin(
                    futures::stream::iter(chunks).chain(futures::stream::pending()),
                )),
                Scripted::Fail(err) => Err(err),
                _ => Err(LensError::Transport("scripted json on stream".into())),
            }
        }

        async fn get_json(&self, endpoint: Endpoint) -> Result<Value> {
            match self.resolve(endpoint, None).await? {
                Scripted::Json(value) => Ok(value),
                Scripted::Fail(err) => Err(err),
                _ => Err(LensError::Transport("scripted stream on json call".into())),
            }
        }
    }
}
