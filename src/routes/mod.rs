use anyhow::Context;
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue},
    middleware::{self as axum_middleware},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

use crate::auth::{TokenManager, EDITOR_VERSION};
use crate::cache::ModelsCache;
use crate::config::Config;
use crate::error::ApiError;
use crate::middleware;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub proxy_api_key: String,
    pub token_manager: Arc<TokenManager>,
    pub models_cache: ModelsCache,
    pub http_client: reqwest::Client,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        token_manager: Arc<TokenManager>,
        models_cache: ModelsCache,
    ) -> anyhow::Result<Self> {
        // No overall timeout: streamed completions can run for minutes
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            proxy_api_key: config.proxy_api_key.clone(),
            token_manager,
            models_cache,
            http_client,
            config,
        })
    }
}

/// Full application router: health, relay routes, CORS and request tracing
pub fn build_app(state: AppState) -> Router {
    let cors = middleware::cors_layer(&state.config.cors_allowed_origins);

    Router::new()
        .merge(health_routes())
        .merge(model_routes(state.clone()))
        .merge(copilot_routes(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Health check routes (no authentication required)
pub fn health_routes() -> Router {
    Router::new().route("/healthz", any(health_handler))
}

/// Model catalog routes (no authentication required)
pub fn model_routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/models", get(models_handler))
        .with_state(state)
}

/// Copilot relay routes (require authentication)
pub fn copilot_routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/v1/embeddings", post(embeddings_handler))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .with_state(state)
}

/// /healthz - Liveness check, any method
async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// GET /v1/models - cached model catalog
async fn models_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    let body = state.models_cache.get_models().await?;
    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

/// POST /v1/chat/completions - relayed to the Copilot chat endpoint
async fn chat_completions_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let body = apply_default_model(body, state.config.default_model.as_deref())?;
    relay(&state, "/chat/completions", headers, body).await
}

/// POST /v1/embeddings - relayed to the Copilot embeddings endpoint
async fn embeddings_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let body = apply_default_model(body, state.config.default_model.as_deref())?;
    relay(&state, "/embeddings", headers, body).await
}

/// Fill in `model` when the request leaves it null or empty
///
/// Without a configured default the empty field is dropped instead. Bodies
/// that need no change are forwarded byte for byte.
fn apply_default_model(body: Bytes, default_model: Option<&str>) -> Result<Bytes, ApiError> {
    let mut request: serde_json::Map<String, Value> = serde_json::from_slice(&body)
        .map_err(|e| ApiError::ValidationError(format!("Invalid JSON: {}", e)))?;

    let missing = match request.get("model") {
        Some(Value::Null) => true,
        Some(Value::String(model)) => model.is_empty(),
        Some(_) => false,
        None => default_model.is_some(),
    };
    if !missing {
        return Ok(body);
    }

    match default_model {
        Some(model) => {
            request.insert("model".to_string(), Value::String(model.to_string()));
        }
        None => {
            request.remove("model");
        }
    }

    let body = serde_json::to_vec(&request).context("Failed to encode request body")?;
    Ok(Bytes::from(body))
}

/// Forward a request body verbatim and stream the upstream response back
async fn relay(
    state: &AppState,
    path: &str,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let token = state.token_manager.get_token().await?;
    let url = format!("{}{}", state.config.api_base, path);

    tracing::info!("Relaying request to {} ({} bytes)", url, body.len());

    let mut upstream_headers = HeaderMap::new();
    for (name, value) in headers.iter() {
        if !is_request_header_dropped(name) {
            upstream_headers.append(name.clone(), value.clone());
        }
    }
    let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
        .context("Copilot token is not a valid header value")?;
    upstream_headers.insert(header::AUTHORIZATION, bearer);
    upstream_headers.insert(
        HeaderName::from_static("copilot-integration-id"),
        HeaderValue::from_static("vscode-chat"),
    );
    upstream_headers.insert(
        HeaderName::from_static("editor-version"),
        HeaderValue::from_static(EDITOR_VERSION),
    );
    upstream_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );

    let upstream = state
        .http_client
        .post(&url)
        .headers(upstream_headers)
        .body(body)
        .send()
        .await
        .map_err(|e| {
            tracing::error!(url = %url, error = %e, "Failed to contact Copilot API");
            ApiError::Upstream(format!("Failed to contact Copilot API: {}", e))
        })?;

    let status = upstream.status();
    tracing::debug!(status = %status, url = %url, "Copilot API responded");

    let mut response = Response::builder().status(status);
    for (name, value) in upstream.headers() {
        if !is_hop_by_hop(name) {
            response = response.header(name, value);
        }
    }

    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .context("Failed to build relayed response")
        .map_err(ApiError::from)
}

fn is_request_header_dropped(name: &HeaderName) -> bool {
    *name == header::AUTHORIZATION || *name == header::HOST || is_hop_by_hop(name)
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    *name == header::CONNECTION
        || *name == header::CONTENT_LENGTH
        || *name == header::TRANSFER_ENCODING
        || *name == HeaderName::from_static("keep-alive")
}
