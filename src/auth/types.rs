// Authentication types

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Tokens expiring within this window are treated as invalid
pub const SAFETY_MARGIN: Duration = Duration::from_secs(120);

/// Long-lived GitHub OAuth token issued to the Copilot editor integration
///
/// Used to mint short-lived Copilot access tokens and to read the model catalog.
#[derive(Clone, PartialEq, Eq)]
pub struct OAuthToken(String);

impl OAuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for OAuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OAuthToken(<redacted>)")
    }
}

/// Short-lived Copilot API bearer token
///
/// This is also the on-disk record shared with sibling processes.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessToken {
    pub token: String,
    /// Unix epoch seconds
    pub expires_at: f64,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_at: f64) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// True while the token has more than `margin` left before expiry
    pub fn is_valid_with(&self, margin: Duration, now: f64) -> bool {
        self.expires_at > now + margin.as_secs_f64()
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_with(SAFETY_MARGIN, epoch_now())
    }

    /// Time left until the token drops out of its validity window
    pub fn refresh_due_in(&self, margin: Duration, now: f64) -> Duration {
        let secs = self.expires_at - now - margin.as_secs_f64();
        if secs.is_finite() && secs > 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            Duration::ZERO
        }
    }

    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt((self.expires_at * 1000.0) as i64)
            .single()
    }

    /// Reject records that deserialized but cannot be a usable token
    pub(crate) fn validate(self, origin: impl Into<String>) -> Result<Self, TokenError> {
        if self.token.is_empty() {
            return Err(TokenError::Parse {
                origin: origin.into(),
                detail: "token is empty".to_string(),
            });
        }
        if !self.expires_at.is_finite() || self.expires_at <= 0.0 {
            return Err(TokenError::Parse {
                origin: origin.into(),
                detail: format!("invalid expires_at: {}", self.expires_at),
            });
        }
        Ok(self)
    }

    /// Short prefix safe to print in logs
    pub fn preview(&self) -> &str {
        let end = self
            .token
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.token.len());
        &self.token[..end]
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &format_args!("{}...", self.preview()))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Current wall-clock time in fractional unix seconds
pub fn epoch_now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Errors from credential loading, token persistence and refresh
#[derive(Error, Debug)]
pub enum TokenError {
    /// No delegated credential could be located
    #[error("GitHub OAuth token not found under {}", searched.display())]
    NotFound { searched: PathBuf },

    /// Filesystem failure on the token store or lock marker
    #[error("token store I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed persisted record or token endpoint response
    #[error("malformed token from {origin}: {detail}")]
    Parse { origin: String, detail: String },

    /// Token endpoint answered with a non-success status
    #[error("token refresh failed: {status} - {body}")]
    Status { status: u16, body: String },

    /// Token endpoint could not be reached
    #[error("token refresh request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Advisory lock stayed held and no sibling produced a valid token
    #[error("token refresh failed: lock unavailable")]
    LockUnavailable,

    /// Refresh completed but left no valid token behind
    #[error("copilot token unavailable after refresh")]
    Unavailable,
}

impl TokenError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for the failure modes of a refresh attempt
    pub fn is_refresh_failure(&self) -> bool {
        matches!(
            self,
            Self::Status { .. } | Self::Transport(_) | Self::LockUnavailable | Self::Unavailable
        )
    }

    /// True if the underlying cause is a missing file
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// One entry of `apps.json` / `hosts.json`
#[derive(Deserialize)]
pub struct HostRecord {
    #[serde(default)]
    pub oauth_token: Option<String>,
}
