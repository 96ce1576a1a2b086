// Delegated credential discovery from the Copilot editor config files

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::types::{HostRecord, OAuthToken, TokenError};

/// Directory under the config root shared by all Copilot integrations
pub const COPILOT_DIR: &str = "github-copilot";

/// Candidate credential files, in priority order
pub const CREDENTIAL_FILES: [&str; 2] = ["apps.json", "hosts.json"];

/// Host key substring identifying a github.com sign-in
pub const GITHUB_HOST: &str = "github.com";

/// Platform config root: `%LOCALAPPDATA%` on Windows, `~/.config` elsewhere
pub fn default_config_dir() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    if cfg!(windows) {
        match std::env::var_os("LOCALAPPDATA") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => home.join("AppData").join("Local"),
        }
    } else {
        home.join(".config")
    }
}

/// Path of the shared access token record under a config root
pub fn token_path(config_dir: &Path) -> PathBuf {
    config_dir.join(COPILOT_DIR).join("token.json")
}

/// Load the GitHub OAuth token from `apps.json` or `hosts.json`
///
/// Files are tried in order; the first `github.com` entry with a non-empty
/// `oauth_token` wins. Which entry wins among several matches in the same
/// file is unspecified.
pub fn load_oauth_token(config_dir: &Path) -> Result<OAuthToken, TokenError> {
    let dir = config_dir.join(COPILOT_DIR);

    for name in CREDENTIAL_FILES {
        let path = dir.join(name);
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Skipping credential file");
                continue;
            }
        };

        let hosts: HashMap<String, HostRecord> = match serde_json::from_str(&data) {
            Ok(hosts) => hosts,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Ignoring unparsable credential file");
                continue;
            }
        };

        if let Some(token) = find_github_token(hosts) {
            tracing::info!("Loaded GitHub OAuth token from {}", path.display());
            return Ok(token);
        }
    }

    Err(TokenError::NotFound { searched: dir })
}

fn find_github_token(hosts: HashMap<String, HostRecord>) -> Option<OAuthToken> {
    hosts
        .into_iter()
        .filter(|(host, _)| host.contains(GITHUB_HOST))
        .find_map(|(_, record)| record.oauth_token.filter(|t| !t.is_empty()))
        .map(OAuthToken::new)
}
