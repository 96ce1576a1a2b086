// Token exchange against the GitHub Copilot token endpoint

use reqwest::Client;

use super::types::{AccessToken, OAuthToken, TokenError};

/// Default token exchange endpoint
pub const DEFAULT_AUTH_URL: &str = "https://api.github.com/copilot_internal/v2/token";

pub const EDITOR_VERSION: &str = concat!("copilot-gateway/", env!("CARGO_PKG_VERSION"));
const EDITOR_PLUGIN_VERSION: &str = "copilot.rs";

/// Pinned GitHub REST API version
pub const GITHUB_API_VERSION: &str = "2022-11-28";

/// Exchange the OAuth token for a fresh Copilot access token
///
/// The timeout is taken from the client; nothing here retries.
pub async fn exchange_token(
    client: &Client,
    auth_url: &str,
    oauth: &OAuthToken,
) -> Result<AccessToken, TokenError> {
    tracing::info!("Refreshing Copilot token via {}...", auth_url);

    let response = client
        .get(auth_url)
        .header("Authorization", format!("token {}", oauth.expose()))
        .header("Accept", "application/json")
        .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
        .header("Editor-Version", EDITOR_VERSION)
        .header("Editor-Plugin-Version", EDITOR_PLUGIN_VERSION)
        .header("User-Agent", EDITOR_VERSION)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::error!(status = status.as_u16(), body = %body, "Copilot token refresh failed");
        return Err(TokenError::Status {
            status: status.as_u16(),
            body,
        });
    }

    let body = response.bytes().await?;
    let token: AccessToken = serde_json::from_slice(&body).map_err(|e| TokenError::Parse {
        origin: auth_url.to_string(),
        detail: e.to_string(),
    })?;
    let token = token.validate(auth_url)?;

    tracing::info!(
        "Copilot token refreshed ({}...), expires: {}",
        token.preview(),
        token
            .expires_at_utc()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| token.expires_at.to_string())
    );

    Ok(token)
}
