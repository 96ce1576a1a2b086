use anyhow::{Context, Result};
use std::sync::Arc;

use copilot_gateway::{
    auth::{self, OAuthToken, TokenManager},
    cache::ModelsCache,
    config::Config,
    routes::{self, AppState},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("🚀 Copilot Gateway starting...");
    tracing::info!(
        "Server configured: {}:{}",
        config.server_host,
        config.server_port
    );

    if config.proxy_api_key_generated {
        tracing::warn!(
            "COPILOT_TOKEN not set, generated access token: {}",
            config.proxy_api_key
        );
    }
    if config.allows_any_origin() {
        tracing::debug!("CORS allows any origin");
    }

    // Initialize authentication
    tracing::info!("Initializing authentication...");
    let credential = match &config.oauth_token {
        Some(token) => OAuthToken::new(token.clone()),
        None => auth::load_oauth_token(&config.config_dir)
            .context("No GitHub OAuth token found; sign in to Copilot or set COPILOT_OAUTH_TOKEN")?,
    };

    let token_manager = Arc::new(
        TokenManager::new(credential.clone(), config.manager_options())
            .context("Failed to initialize token manager")?,
    );
    token_manager.spawn_background();
    tracing::info!(
        "✅ Token manager watching {}",
        token_manager.token_path().display()
    );

    // Test authentication by getting a token
    match token_manager.get_token().await {
        Ok(token) => {
            tracing::info!(
                "✅ Authentication successful (token: {}...)",
                token.chars().take(8).collect::<String>()
            );
        }
        Err(e) => {
            tracing::error!("❌ Authentication failed: {}", e);
            tracing::warn!(
                "Server will start but API requests will fail without a valid Copilot token"
            );
        }
    }

    // Load the model catalog; /v1/models retries in the background on failure
    let models_cache = ModelsCache::new(credential, &config.models_url, config.models_cache_ttl)
        .context("Failed to initialize model catalog cache")?;
    if let Err(e) = models_cache.refresh().await {
        tracing::warn!("Failed to fetch model catalog at startup: {}", e);
    }

    let config = Arc::new(config);
    let app_state = AppState::new(config.clone(), token_manager.clone(), models_cache)?;
    let app = routes::build_app(app_state);

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    print_startup_banner(&config);

    tracing::info!("🚀 Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    token_manager.shutdown().await;
    tracing::info!("👋 Server shutdown complete");

    Ok(())
}

fn print_startup_banner(config: &Config) {
    println!();
    println!("  Copilot Gateway {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Server:      http://{}:{}",
        config.server_host, config.server_port
    );
    println!("  Token file:  {}", config.token_path().display());
    println!("  API base:    {}", config.api_base);
    if let Some(model) = &config.default_model {
        println!("  Default model: {}", model);
    }
    println!("  Log Level:   {}", config.log_level);
    println!();
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
