#![allow(dead_code)]

use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use token_lens::AppConfig;

/// Knobs for the fake inference service.
#[derive(Clone)]
pub struct MockBehaviour {
    pub tokenize: StatusCode,
    pub embeddings: StatusCode,
    pub attention: StatusCode,
    pub logits: StatusCode,
    pub generate: StatusCode,
    /// Raw body chunks for `/generate`, sent with a pause in between.
    pub generate_chunks: Vec<&'static str>,
}

impl Default for MockBehaviour {
    fn default() -> Self {
        Self {
            tokenize: StatusCode::OK,
            embeddings: StatusCode::OK,
            attention: StatusCode::OK,
            logits: StatusCode::OK,
            generate: StatusCode::OK,
            generate_chunks: vec![
                "data: {\"token\": \"\", \"text\": \"Hello\"}\n\n",
                "data: {\"token\": \" world\", \"text\": \"Hello world\"}\n\ndata: {\"tok",
                "en\": \"!\", \"text\": \"Hello world!\"}\n",
                "\ndata: {\"event\": \"done\", \"final_text\": \"Hello world!\"}\n\n",
            ],
        }
    }
}

#[derive(Clone)]
struct MockState {
    behaviour: Arc<MockBehaviour>,
    requests: Arc<Mutex<Vec<(&'static str, Value)>>>,
}

pub struct MockService {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<(&'static str, Value)>>>,
}

impl MockService {
    pub async fn start(behaviour: MockBehaviour) -> Self {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = MockState {
            behaviour: Arc::new(behaviour),
            requests: requests.clone(),
        };
        let router = Router::new()
            .route("/tokenize", post(tokenize))
            .route("/embeddings", post(embeddings))
            .route("/attention", post(attention))
            .route("/logits", post(logits))
            .route("/generate", post(generate))
            .route("/models/info", get(models_info))
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { addr, requests }
    }

    pub fn config(&self) -> AppConfig {
        AppConfig {
            base_url: format!("http://{}", self.addr),
            stream_idle_timeout: Some(Duration::from_secs(5)),
            ..AppConfig::default()
        }
    }

    pub fn requests_to(&self, route: &str) -> Vec<Value> {
        self.requests
            .lock()
            .iter()
            .filter(|(r, _)| *r == route)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

/// Config pointing at a port nobody listens on.
pub async fn unreachable_config() -> AppConfig {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    AppConfig {
        base_url: format!("http://{addr}"),
        ..AppConfig::default()
    }
}

fn record(state: &MockState, route: &'static str, body: &Value) {
    state.requests.lock().push((route, body.clone()));
}

fn failure(status: StatusCode, what: &str) -> Response {
    (status, Json(json!({ "error": format!("{what} failed") }))).into_response()
}

async fn tokenize(State(state): State<MockState>, Json(body): Json<Value>) -> Response {
    record(&state, "tokenize", &body);
    if state.behaviour.tokenize != StatusCode::OK {
        return failure(state.behaviour.tokenize, "Tokenize");
    }
    Json(json!({
        "original_text": body["text"],
        "tokens": ["Hello", "Ġworld"],
        "token_ids": [15496, 995],
        "token_info": [
            {"position": 0, "token": "Hello", "token_id": 15496, "decoded": "Hello"},
            {"position": 1, "token": "Ġworld", "token_id": 995, "decoded": " world"}
        ],
        "vocab_size": 50257
    }))
    .into_response()
}

async fn embeddings(State(state): State<MockState>, Json(body): Json<Value>) -> Response {
    record(&state, "embeddings", &body);
    if state.behaviour.embeddings != StatusCode::OK {
        return failure(state.behaviour.embeddings, "Embeddings");
    }
    Json(json!({
        "tokens": ["Hello", " world"],
        "token_embeddings": [[0.5, -0.5, 1.0], [0.25, 0.0, -0.25]],
        "positional_embeddings": [[0.0, 0.1, 0.0], [0.1, 0.0, 0.1]],
        "combined_embeddings": [[0.5, -0.4, 1.0], [0.35, 0.0, -0.15]],
        "embedding_dim": 3
    }))
    .into_response()
}

async fn attention(State(state): State<MockState>, Json(body): Json<Value>) -> Response {
    record(&state, "attention", &body);
    if state.behaviour.attention != StatusCode::OK {
        return failure(state.behaviour.attention, "Attention");
    }
    Json(json!({
        "tokens": ["Hello", " world"],
        "attention_layers": [
            {
                "layer": 0,
                "num_heads": 2,
                "attention_weights": [
                    [[1.0, 0.0], [0.3, 0.7]],
                    [[1.0, 0.0], [0.5, 0.5]]
                ],
                "average_attention": [[1.0, 0.0], [0.4, 0.6]]
            }
        ],
        "num_layers": 1
    }))
    .into_response()
}

async fn logits(State(state): State<MockState>, Json(body): Json<Value>) -> Response {
    record(&state, "logits", &body);
    if state.behaviour.logits != StatusCode::OK {
        return failure(state.behaviour.logits, "Logits");
    }
    Json(json!({
        "input_text": body["text"],
        "next_token": "!",
        "next_token_id": 0,
        "top_tokens": [
            {"token": "!", "token_id": 0, "probability": 0.5, "logit": -20.1},
            {"token": ",", "token_id": 11, "probability": 0.25, "logit": -20.8},
            {"token": ".", "token_id": 13, "probability": 0.125, "logit": -21.5}
        ],
        "temperature": body["temperature"],
        "vocab_size": 50257
    }))
    .into_response()
}

async fn generate(State(state): State<MockState>, Json(body): Json<Value>) -> Response {
    record(&state, "generate", &body);
    if state.behaviour.generate != StatusCode::OK {
        return failure(state.behaviour.generate, "Generate");
    }
    let chunks = state.behaviour.generate_chunks.clone();
    let stream = futures::stream::iter(chunks).then(|chunk| async move {
        tokio::time::sleep(Duration::from_millis(15)).await;
        Ok::<_, Infallible>(Bytes::from_static(chunk.as_bytes()))
    });
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(stream))
        .unwrap()
}

async fn models_info() -> Json<Value> {
    Json(json!({
        "model_name": "distilgpt2",
        "device": "cpu",
        "vocab_size": 50257,
        "n_layer": 6,
        "n_head": 12,
        "n_embd": 768
    }))
}
