//! HTTP surface: routes, DTOs, error mapping and disconnect tracking.

use axum::{
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, warn};

use crate::{
    engine::Synthesizer,
    error::SynthesisError,
    pipeline::{self, BatchRequest, BatchResult, ClientLiveness, SynthesisRequest, SynthesisResult},
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub synth: Synthesizer,
    pub default_voice: String,
    /// Provider the session ended up on, as logged at startup.
    pub provider: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

pub fn router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/v1/synthesize", post(synthesize))
        .route("/v1/batch_synthesize", post(batch_synthesize))
        .route("/health", get(health))
        .layer(middleware::from_fn(track_disconnect))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Any origin when `origins` is empty, otherwise exactly those origins.
pub fn cors_layer(origins: &[String]) -> anyhow::Result<CorsLayer> {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return Ok(layer.allow_origin(Any));
    }
    let origins = origins
        .iter()
        .map(|o| {
            HeaderValue::from_str(o).map_err(|e| anyhow::anyhow!("invalid CORS origin {o:?}: {e}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(layer.allow_origin(AllowOrigin::list(origins)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Disconnect tracking
// ─────────────────────────────────────────────────────────────────────────────

/// Request extension that reports whether the peer is still waiting.
#[derive(Clone, Debug, Default)]
pub struct ClientConnection(CancellationToken);

impl ClientConnection {
    pub fn new(token: CancellationToken) -> Self {
        Self(token)
    }
}

impl ClientLiveness for ClientConnection {
    fn is_disconnected(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// Runs the rest of the stack in its own task.
///
/// hyper drops this future when the peer goes away; the drop guard then
/// cancels the token while the handler task keeps running to its next
/// checkpoint.
async fn track_disconnect(mut req: Request, next: Next) -> Response {
    let token = CancellationToken::new();
    req.extensions_mut().insert(ClientConnection::new(token.clone()));

    let guard = token.drop_guard();
    let result = tokio::spawn(next.run(req)).await;
    guard.disarm();

    match result {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "request handler task failed");
            ApiError::internal("request handler failed").into_response()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DTOs
// ─────────────────────────────────────────────────────────────────────────────

fn default_speed() -> f32 {
    1.0
}

#[derive(Debug, Deserialize)]
pub struct SynthesizeBody {
    pub text: String,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default = "default_speed")]
    pub speed: f32,
}

#[derive(Debug, Deserialize)]
pub struct BatchSynthesizeBody {
    pub sentences: Vec<String>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default = "default_speed")]
    pub speed: f32,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub provider: String,
    pub sample_rate: u32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn synthesize(
    State(state): State<AppState>,
    Extension(client): Extension<ClientConnection>,
    Json(body): Json<SynthesizeBody>,
) -> Result<Json<SynthesisResult>, ApiError> {
    let request = SynthesisRequest {
        text: body.text,
        voice: body.voice.unwrap_or_else(|| state.default_voice.clone()),
        speed: body.speed,
    };
    let result = pipeline::synthesize(&state.synth, &client, &request).await?;
    Ok(Json(result))
}

async fn batch_synthesize(
    State(state): State<AppState>,
    Extension(client): Extension<ClientConnection>,
    Json(body): Json<BatchSynthesizeBody>,
) -> Result<Json<BatchResult>, ApiError> {
    let request = BatchRequest {
        sentences: body.sentences,
        voice: body.voice.unwrap_or_else(|| state.default_voice.clone()),
        speed: body.speed,
    };
    let result = pipeline::batch_synthesize(&state.synth, &client, &request).await?;
    Ok(Json(result))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        provider: state.provider.clone(),
        sample_rate: state.synth.engine().sample_rate(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Error body is `{"detail": "<message>"}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: msg.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.message }))).into_response()
    }
}

impl From<SynthesisError> for ApiError {
    fn from(err: SynthesisError) -> Self {
        if err.is_client_error() {
            warn!(error = %err, "rejected synthesis request");
            ApiError::bad_request(err.to_string())
        } else {
            error!(error = %err, "synthesis failed");
            ApiError::internal(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let e: ApiError = SynthesisError::EmptyBatch.into();
        assert_eq!(e.status, StatusCode::BAD_REQUEST);
        assert_eq!(e.message, "No sentences provided");

        let e: ApiError = SynthesisError::Internal("Voice 'x' not found".into()).into();
        assert_eq!(e.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(e.message, "Voice 'x' not found");

        let e: ApiError =
            SynthesisError::SampleRateMismatch { index: 2, expected: 24_000, found: 16_000 }.into();
        assert_eq!(e.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_body_defaults() {
        let body: SynthesizeBody = serde_json::from_str(r#"{"text":"hi"}"#).unwrap();
        assert_eq!(body.voice, None);
        assert_eq!(body.speed, 1.0);

        let body: BatchSynthesizeBody =
            serde_json::from_str(r#"{"sentences":["a"],"voice":"af_heart","speed":0.8}"#).unwrap();
        assert_eq!(body.voice.as_deref(), Some("af_heart"));
        assert_eq!(body.speed, 0.8);
    }

    #[test]
    fn test_cors_origins() {
        assert!(cors_layer(&[]).is_ok());
        assert!(cors_layer(&["http://localhost:3000".into()]).is_ok());
        assert!(cors_layer(&["bad\norigin".into()]).is_err());
    }

    #[test]
    fn test_connection_follows_token() {
        let token = CancellationToken::new();
        let conn = ClientConnection::new(token.clone());
        assert!(!conn.is_disconnected());
        token.cancel();
        assert!(conn.is_disconnected());
    }
}
