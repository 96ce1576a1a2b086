// Shared fixtures for unit tests

use std::sync::Arc;
use tempfile::TempDir;

use crate::auth::{ManagerOptions, OAuthToken, TokenManager};
use crate::cache::ModelsCache;
use crate::config::{CliArgs, Config};
use crate::routes::AppState;
use clap::Parser;

/// App state with a token manager rooted in a fresh temp dir
///
/// `server_url` serves both the token endpoint and the relayed API.
pub(crate) fn test_state(server_url: &str) -> (AppState, TempDir) {
    let dir = tempfile::tempdir().unwrap();

    let mut config = Config::from_args(CliArgs::parse_from([
        "copilot-gateway",
        "-k",
        "test-key-123",
    ]));
    config.config_dir = dir.path().to_path_buf();
    config.auth_url = format!("{server_url}/copilot_internal/v2/token");
    config.api_base = server_url.to_string();
    config.models_url = format!("{server_url}/catalog/models");

    let options = ManagerOptions {
        lock_attempts: 2,
        lock_retry_delay: std::time::Duration::from_millis(10),
        lock_wait: std::time::Duration::from_millis(20),
        ..config.manager_options()
    };
    let manager = TokenManager::new(OAuthToken::new("gho_test"), options).unwrap();

    let models = ModelsCache::new(
        OAuthToken::new("gho_test"),
        &config.models_url,
        config.models_cache_ttl,
    )
    .unwrap();

    let state = AppState::new(Arc::new(config), Arc::new(manager), models).unwrap();
    (state, dir)
}
