// Authentication and CORS middleware

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, Method, Request},
    middleware::Next,
    response::Response,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::error::ApiError;
use crate::routes::AppState;

/// Authentication middleware
///
/// Expects `Authorization: Bearer {COPILOT_TOKEN}`. A missing or malformed
/// header is rejected with 401, a wrong key with 403.
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        None => {
            tracing::warn!(
                "Missing Authorization header: {} {}",
                request.method(),
                request.uri().path()
            );
            Err(ApiError::AuthError(
                "missing or invalid Authorization header".to_string(),
            ))
        }
        Some(key) if !key.is_empty() && key == state.proxy_api_key.as_str() => {
            Ok(next.run(request).await)
        }
        Some(_) => {
            let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
            tracing::warn!(
                "[{}] Access attempt with invalid API key: {} {}",
                request_id,
                request.method(),
                request.uri().path()
            );
            Err(ApiError::Forbidden("invalid access token".to_string()))
        }
    }
}

/// Create CORS middleware layer
///
/// Allows the configured origins (or any origin for `*`). Handles OPTIONS
/// preflight requests automatically.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin: {}", o);
                None
            }
        })
        .collect();

    layer
        .allow_origin(AllowOrigin::list(allowed))
        .allow_credentials(true)
}
