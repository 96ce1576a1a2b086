use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use std::time::Duration;

use crate::auth::{self, ManagerOptions, DEFAULT_AUTH_URL};
use crate::cache::DEFAULT_MODELS_URL;

/// Default Copilot API base for relayed requests
pub const DEFAULT_API_BASE: &str = "https://api.githubcopilot.com";

/// Copilot Gateway
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Server host address
    #[arg(short = 'H', long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Server port
    #[arg(short, long, env = "COPILOT_SERVER_PORT", default_value = "9191")]
    pub port: u16,

    /// API key clients must present as a Bearer token (random if unset)
    #[arg(short = 'k', long, env = "COPILOT_TOKEN", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Comma-separated list of allowed CORS origins
    #[arg(long, env = "CORS_ALLOWED_ORIGINS", default_value = "*")]
    pub cors_origins: String,

    /// Config root containing github-copilot/ (platform default if unset)
    #[arg(short = 'c', long, env = "COPILOT_CONFIG_DIR")]
    pub config_dir: Option<String>,

    /// GitHub OAuth token; skips the apps.json / hosts.json lookup
    #[arg(long, env = "COPILOT_OAUTH_TOKEN", hide_env_values = true)]
    pub oauth_token: Option<String>,

    /// Copilot token exchange endpoint
    #[arg(long, env = "COPILOT_AUTH_URL", default_value = DEFAULT_AUTH_URL)]
    pub auth_url: String,

    /// Copilot API base URL
    #[arg(long, env = "COPILOT_API_BASE", default_value = DEFAULT_API_BASE)]
    pub api_base: String,

    /// Model injected into requests that do not name one
    #[arg(long, env = "DEFAULT_MODEL")]
    pub default_model: Option<String>,

    /// Model catalog endpoint served at /v1/models
    #[arg(long, env = "MODELS_URL", default_value = DEFAULT_MODELS_URL)]
    pub models_url: String,

    /// Model catalog cache TTL in seconds
    #[arg(long, env = "MODELS_CACHE_TTL", default_value = "21600")]
    pub models_cache_ttl: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Server settings
    pub server_host: String,
    pub server_port: u16,

    // Client authentication
    pub proxy_api_key: String,
    pub proxy_api_key_generated: bool,
    pub cors_allowed_origins: Vec<String>,

    // Copilot credentials
    pub config_dir: PathBuf,
    pub oauth_token: Option<String>,
    pub auth_url: String,
    pub api_base: String,

    // Request defaults and model catalog
    pub default_model: Option<String>,
    pub models_url: String,
    pub models_cache_ttl: Duration,

    pub log_level: String,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Ok(Self::from_args(CliArgs::parse()))
    }

    pub fn from_args(args: CliArgs) -> Self {
        let (proxy_api_key, proxy_api_key_generated) =
            match args.api_key.filter(|k| !k.is_empty()) {
                Some(key) => (key, false),
                None => (uuid::Uuid::new_v4().simple().to_string(), true),
            };

        Config {
            server_host: args.host,
            server_port: args.port,
            proxy_api_key,
            proxy_api_key_generated,
            cors_allowed_origins: parse_origins(&args.cors_origins),
            config_dir: args
                .config_dir
                .map(|s| expand_tilde(&s))
                .unwrap_or_else(auth::default_config_dir),
            oauth_token: args.oauth_token.filter(|t| !t.is_empty()),
            auth_url: args.auth_url,
            api_base: args.api_base.trim_end_matches('/').to_string(),
            default_model: args.default_model.filter(|m| !m.is_empty()),
            models_url: args.models_url,
            models_cache_ttl: Duration::from_secs(args.models_cache_ttl),
            log_level: args.log_level,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server_port == 0 {
            anyhow::bail!("COPILOT_SERVER_PORT must be non-zero");
        }
        if self.proxy_api_key.is_empty() {
            anyhow::bail!("COPILOT_TOKEN cannot be empty");
        }
        for (name, url) in [
            ("COPILOT_AUTH_URL", &self.auth_url),
            ("COPILOT_API_BASE", &self.api_base),
            ("MODELS_URL", &self.models_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                anyhow::bail!("{} must be an http(s) URL, got: {}", name, url);
            }
        }
        Ok(())
    }

    /// Shared token record under the config root
    pub fn token_path(&self) -> PathBuf {
        auth::token_path(&self.config_dir)
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            auth_url: self.auth_url.clone(),
            ..ManagerOptions::new(self.token_path())
        }
    }

    pub fn allows_any_origin(&self) -> bool {
        self.cors_allowed_origins.iter().any(|o| o == "*")
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn parse_origins(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(String::from)
        .collect()
}
