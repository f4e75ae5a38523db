//! Web UI: one page with a prompt box and two sliders, backed by a JSON endpoint

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::Html,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::pipeline::{DalleMiniPipeline, GenerationRequest, DEFAULT_CANDIDATES, DEFAULT_PREDICTIONS};
use crate::strip::encode_png;

const INDEX_HTML: &str = include_str!("../static/index.html");

#[derive(Clone)]
pub struct AppState {
    /// One generation at a time; inference is synchronous and blocking
    pipeline: Arc<Mutex<DalleMiniPipeline>>,
}

impl AppState {
    pub fn new(pipeline: DalleMiniPipeline) -> Self {
        Self {
            pipeline: Arc::new(Mutex::new(pipeline)),
        }
    }
}

/// Request for POST /api/generate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    /// What do you want to see?
    pub prompt: String,

    /// Candidates to generate
    #[serde(default = "default_candidates")]
    pub candidates: usize,

    /// Best predictions to show
    #[serde(default = "default_predictions")]
    pub predictions: usize,

    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default)]
    pub caption: bool,
}

fn default_candidates() -> usize {
    DEFAULT_CANDIDATES
}

fn default_predictions() -> usize {
    DEFAULT_PREDICTIONS
}

impl GenerateRequest {
    fn to_generation(&self) -> GenerationRequest {
        GenerationRequest {
            candidates: self.candidates,
            predictions: self.predictions,
            seed: self.seed,
            caption: self.caption,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionInfo {
    pub candidate: usize,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    /// Base64 PNG of the prediction strip
    pub image: String,
    pub seed: u64,
    pub predictions: Vec<PredictionInfo>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/api/generate", post(generate_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process is stopped
pub async fn serve(pipeline: DalleMiniPipeline, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("🌐 Serving on http://{}", addr);

    axum::serve(listener, router(AppState::new(pipeline)))
        .await
        .context("HTTP server failed")?;
    Ok(())
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health_handler() -> &'static str {
    "ok"
}

/// POST /api/generate - generate candidates, keep the best, return a strip
pub async fn generate_handler(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, (StatusCode, String)> {
    debug!(
        prompt_len = request.prompt.len(),
        candidates = request.candidates,
        predictions = request.predictions,
        "Generation request received"
    );

    let generation = request.to_generation();
    if let Err(e) = generation.validate(&request.prompt) {
        warn!("Generation request rejected: {}", e);
        return Err((StatusCode::BAD_REQUEST, e));
    }

    let pipeline = state.pipeline.clone();
    let prompt = request.prompt.clone();
    let result = tokio::task::spawn_blocking(move || {
        let pipeline = lock_pipeline(&pipeline);
        let predictions = pipeline.run(&prompt, &generation)?;
        let png = encode_png(&predictions.strip)?;
        Ok::<_, anyhow::Error>((predictions, png))
    })
    .await
    .map_err(|e| internal_error(anyhow::anyhow!("generation task panicked: {e}")))?
    .map_err(internal_error)?;

    let (predictions, png) = result;
    Ok(Json(GenerateResponse {
        image: STANDARD.encode(png),
        seed: predictions.seed,
        predictions: predictions
            .predictions
            .iter()
            .map(|p| PredictionInfo {
                candidate: p.candidate,
                score: p.score,
            })
            .collect(),
    }))
}

/// Take the single-flight lock.
///
/// The pipeline is never mutated, so a panic in an earlier request leaves it
/// usable and the poison flag is ignored.
fn lock_pipeline<T>(pipeline: &Mutex<T>) -> MutexGuard<'_, T> {
    pipeline.lock().unwrap_or_else(|poisoned| {
        warn!("Previous generation panicked, reusing the pipeline");
        PoisonError::into_inner(poisoned)
    })
}

fn internal_error(e: anyhow::Error) -> (StatusCode, String) {
    warn!("Generation failed: {:#}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, format!("Image generation failed: {e:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let request: GenerateRequest = serde_json::from_str(r#"{"prompt": "a red cat"}"#).unwrap();
        assert_eq!(request.candidates, 8);
        assert_eq!(request.predictions, 1);
        assert_eq!(request.seed, None);
        assert!(!request.caption);
        assert!(request.to_generation().validate(&request.prompt).is_ok());
    }

    #[test]
    fn test_request_out_of_range_rejected() {
        let request: GenerateRequest =
            serde_json::from_str(r#"{"prompt": "a red cat", "candidates": 100, "seed": 7}"#).unwrap();
        assert_eq!(request.seed, Some(7));
        assert!(request.to_generation().validate(&request.prompt).is_err());
    }

    #[test]
    fn test_response_is_camel_case() {
        let response = GenerateResponse {
            image: "AAAA".to_string(),
            seed: 3,
            predictions: vec![PredictionInfo {
                candidate: 2,
                score: 31.5,
            }],
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["predictions"][0]["candidate"], 2);
        assert_eq!(json["seed"], 3);
    }

    #[test]
    fn test_lock_survives_panicked_generation() {
        let shared = Arc::new(Mutex::new(41u32));

        let poisoner = shared.clone();
        let result = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("inference failed");
        })
        .join();
        assert!(result.is_err());
        assert!(shared.is_poisoned());

        let mut guard = lock_pipeline(&shared);
        *guard += 1;
        drop(guard);
        assert_eq!(*lock_pipeline(&shared), 42);
    }

    #[tokio::test]
    async fn test_index_page_has_controls() {
        let Html(page) = index_handler().await;
        assert!(page.contains("What do you want to see?"));
        assert!(page.contains(r#"id="candidates" type="range" min="1" max="64""#));
        assert!(page.contains(r#"id="predictions" type="range" min="1" max="8""#));
    }
}
