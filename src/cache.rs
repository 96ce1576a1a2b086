// Model catalog cache
//
// The catalog is fetched once at startup and served from memory. Once the
// TTL passes, the stale copy keeps being served while a single background
// fetch replaces it.

use bytes::Bytes;
use reqwest::{header, Client};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::auth::{OAuthToken, GITHUB_API_VERSION};

/// GitHub Models catalog endpoint
pub const DEFAULT_MODELS_URL: &str = "https://models.github.ai/catalog/models";

#[derive(Error, Debug)]
pub enum ModelsError {
    #[error("failed to fetch models: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("models API error: {status} - {body}")]
    Status { status: u16, body: String },

    #[error("invalid models JSON: {0}")]
    Invalid(#[from] serde_json::Error),

    #[error("models not available")]
    Unavailable,
}

struct Catalog {
    body: Bytes,
    fetched_at: Instant,
}

struct Inner {
    client: Client,
    url: String,
    credential: OAuthToken,
    ttl: Duration,
    catalog: RwLock<Option<Catalog>>,
    refreshing: AtomicBool,
}

/// Thread-safe cache for the raw model catalog JSON
#[derive(Clone)]
pub struct ModelsCache {
    inner: Arc<Inner>,
}

/// Clears the in-flight marker when the background fetch ends
struct Refreshing(Arc<Inner>);

impl Drop for Refreshing {
    fn drop(&mut self) {
        self.0.refreshing.store(false, Ordering::SeqCst);
    }
}

impl ModelsCache {
    /// Create an empty cache; call [`ModelsCache::refresh`] to populate it
    pub fn new(
        credential: OAuthToken,
        url: impl Into<String>,
        ttl: Duration,
    ) -> Result<Self, ModelsError> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                url: url.into(),
                credential,
                ttl,
                catalog: RwLock::new(None),
                refreshing: AtomicBool::new(false),
            }),
        })
    }

    /// Cached catalog
    ///
    /// An expired or missing catalog schedules a background fetch. Stale
    /// data is still returned; with nothing cached this fails with
    /// [`ModelsError::Unavailable`].
    pub async fn get_models(&self) -> Result<Bytes, ModelsError> {
        let (body, expired) = {
            let catalog = self.inner.catalog.read().await;
            match catalog.as_ref() {
                Some(c) => (Some(c.body.clone()), c.fetched_at.elapsed() > self.inner.ttl),
                None => (None, true),
            }
        };

        if expired {
            self.spawn_refresh();
        }
        body.ok_or(ModelsError::Unavailable)
    }

    fn spawn_refresh(&self) {
        if self.inner.refreshing.swap(true, Ordering::SeqCst) {
            return;
        }

        let cache = self.clone();
        let marker = Refreshing(self.inner.clone());
        tokio::spawn(async move {
            let _marker = marker;
            if let Err(e) = cache.refresh().await {
                tracing::warn!(error = %e, "Background model catalog refresh failed");
            }
        });
    }

    /// Fetch the catalog and replace the cached copy
    pub async fn refresh(&self) -> Result<(), ModelsError> {
        tracing::debug!("Fetching model catalog from {}", self.inner.url);

        let response = self
            .inner
            .client
            .get(&self.inner.url)
            .header(header::ACCEPT, "application/vnd.github+json")
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.inner.credential.expose()),
            )
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelsError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await?;
        let models: Vec<serde_json::Value> = serde_json::from_slice(&body)?;

        *self.inner.catalog.write().await = Some(Catalog {
            body,
            fetched_at: Instant::now(),
        });
        tracing::info!("Model catalog updated. Found {} models.", models.len());
        Ok(())
    }
}
