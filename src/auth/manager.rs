use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::credentials;
use super::lock::{LockGuard, STALE_LOCK_AGE};
use super::refresh::{self, DEFAULT_AUTH_URL};
use super::scheduler;
use super::store::{FileTokenStore, TokenStore};
use super::types::{epoch_now, AccessToken, OAuthToken, TokenError, SAFETY_MARGIN};

/// Timing and location knobs for the token manager
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Shared token record
    pub token_path: PathBuf,
    /// Token exchange endpoint
    pub auth_url: String,
    pub safety_margin: Duration,
    /// Advisory lock attempts before falling back to a sibling's refresh
    pub lock_attempts: u32,
    pub lock_retry_delay: Duration,
    /// Grace period for a sibling holding the lock to finish
    pub lock_wait: Duration,
    /// Proactive loop period when no valid token is known
    pub fallback_refresh_interval: Duration,
    /// Change detector period
    pub poll_interval: Duration,
    pub stale_lock_age: Duration,
    pub request_timeout: Duration,
}

impl ManagerOptions {
    pub fn new(token_path: impl Into<PathBuf>) -> Self {
        Self {
            token_path: token_path.into(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            safety_margin: SAFETY_MARGIN,
            lock_attempts: 5,
            lock_retry_delay: Duration::from_secs(1),
            lock_wait: Duration::from_secs(5),
            fallback_refresh_interval: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
            stale_lock_age: STALE_LOCK_AGE,
            request_timeout: Duration::from_secs(15),
        }
    }

    /// Options for the standard token location under a config root
    pub fn for_config_dir(config_dir: &Path) -> Self {
        Self::new(credentials::token_path(config_dir))
    }
}

/// Per-process token state shared by callers and background tasks
pub(crate) struct ManagerState {
    credential: OAuthToken,
    store: Arc<dyn TokenStore>,
    client: Client,
    pub(crate) options: ManagerOptions,

    /// Current access token
    token: RwLock<Option<AccessToken>>,

    /// Store mtime last seen by the change detector
    last_modified: Mutex<Option<SystemTime>>,

    /// Raised while this process writes the store
    self_writing: AtomicBool,

    /// Serializes refresh attempts within this process
    refresh_gate: Mutex<()>,
}

/// What a caller saw in the cache, read under a single lock
enum Cached {
    Valid(AccessToken),
    /// Missing or inside the safety margin; carries the stale value if any
    Stale(Option<String>),
}

/// Holds the self-write flag up until dropped, on every exit path
struct SelfWrite<'a>(&'a AtomicBool);

impl<'a> SelfWrite<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for SelfWrite<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ManagerState {
    async fn lookup(&self) -> Cached {
        let token = self.token.read().await;
        match token.as_ref() {
            Some(t) if t.is_valid_with(self.options.safety_margin, epoch_now()) => {
                Cached::Valid(t.clone())
            }
            other => Cached::Stale(other.map(|t| t.token.clone())),
        }
    }

    /// Cached token if it is outside the safety margin
    async fn valid_token(&self) -> Option<AccessToken> {
        match self.lookup().await {
            Cached::Valid(token) => Some(token),
            Cached::Stale(_) => None,
        }
    }

    /// Run a store operation on the blocking pool
    async fn blocking<T, F>(&self, op: F) -> Result<T, TokenError>
    where
        F: FnOnce(&dyn TokenStore) -> T + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|e| {
                TokenError::io(self.options.token_path.clone(), std::io::Error::other(e))
            })
    }

    /// Whether `candidate` makes a refresh unnecessary
    ///
    /// A forced refresh only accepts a token other than the one it set out
    /// to replace.
    fn satisfies(&self, candidate: &AccessToken, observed: Option<&str>, force: bool) -> bool {
        candidate.is_valid_with(self.options.safety_margin, epoch_now())
            && (!force || observed != Some(candidate.token.as_str()))
    }

    pub(crate) async fn get_token(&self) -> Result<String, TokenError> {
        let observed = match self.lookup().await {
            Cached::Valid(token) => return Ok(token.token),
            Cached::Stale(observed) => observed,
        };

        tracing::info!("Copilot token missing or expiring, refreshing synchronously");
        self.refresh_from(observed, true).await?;

        self.valid_token()
            .await
            .map(|t| t.token)
            .ok_or(TokenError::Unavailable)
    }

    pub(crate) async fn refresh(&self, force: bool) -> Result<(), TokenError> {
        let observed = match self.lookup().await {
            Cached::Valid(_) if !force => return Ok(()),
            Cached::Valid(token) => Some(token.token),
            Cached::Stale(observed) => observed,
        };
        self.refresh_from(observed, force).await
    }

    /// Refresh unless someone replaced `observed` while we queued
    async fn refresh_from(&self, observed: Option<String>, force: bool) -> Result<(), TokenError> {
        let _gate = self.refresh_gate.lock().await;

        // A caller queued ahead of us on the gate may already have refreshed
        if let Some(current) = self.valid_token().await {
            if self.satisfies(&current, observed.as_deref(), force) {
                tracing::debug!("Token refreshed by a concurrent caller");
                return Ok(());
            }
        }

        let Some(_lock) = self.acquire_lock().await else {
            return self.await_sibling_refresh().await;
        };

        // A sibling process may have refreshed while we were waiting
        match self.blocking(|store| store.read()).await.and_then(|r| r) {
            Ok(disk) if self.satisfies(&disk, observed.as_deref(), force) => {
                tracing::info!("Adopting token refreshed by another process ({}...)", disk.preview());
                self.install(disk).await;
                return Ok(());
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => tracing::warn!(error = %e, "Ignoring unreadable token record"),
        }

        let token =
            refresh::exchange_token(&self.client, &self.options.auth_url, &self.credential).await?;
        self.install(token.clone()).await;
        self.persist(token).await
    }

    async fn acquire_lock(&self) -> Option<LockGuard> {
        let attempts = self.options.lock_attempts.max(1);
        for attempt in 1..=attempts {
            match self.blocking(|store| store.try_lock()).await.and_then(|r| r) {
                Ok(Some(guard)) => return Some(guard),
                Ok(None) => {
                    tracing::debug!(attempt, attempts, "Refresh lock held by another process")
                }
                Err(e) => tracing::warn!(attempt, attempts, error = %e, "Failed to take refresh lock"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.options.lock_retry_delay).await;
            }
        }
        None
    }

    async fn await_sibling_refresh(&self) -> Result<(), TokenError> {
        tracing::warn!(
            wait_secs = self.options.lock_wait.as_secs_f64(),
            "Refresh lock unavailable, waiting for the holder to finish"
        );
        tokio::time::sleep(self.options.lock_wait).await;

        if let Err(e) = self.reload_from_store().await {
            tracing::warn!(error = %e, "Failed to reload token after lock wait");
        }

        if self.valid_token().await.is_some() {
            tracing::info!("Using token refreshed by another process");
            Ok(())
        } else {
            Err(TokenError::LockUnavailable)
        }
    }

    async fn install(&self, token: AccessToken) {
        let mut current = self.token.write().await;
        *current = Some(token);
    }

    async fn persist(&self, token: AccessToken) -> Result<(), TokenError> {
        let _writing = SelfWrite::raise(&self.self_writing);

        let written = self
            .blocking(move |store| store.write(&token).map(|()| store.modified()))
            .await
            .and_then(|r| r);

        match written {
            Ok(modified) => {
                *self.last_modified.lock().await = modified;
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to persist Copilot token");
                Err(e)
            }
        }
    }

    /// Replace the cache with the persisted record unless that would go backwards
    pub(crate) async fn reload_from_store(&self) -> Result<bool, TokenError> {
        let disk = self.blocking(|store| store.read()).await??;
        let mut current = self.token.write().await;

        match current.as_ref() {
            Some(cur) if *cur == disk => Ok(false),
            Some(cur) if cur.expires_at > disk.expires_at => {
                tracing::debug!("Ignoring persisted token older than the cached one");
                Ok(false)
            }
            _ => {
                *current = Some(disk);
                Ok(true)
            }
        }
    }

    /// One change detector pass: pick up external writes, reap dead locks
    pub(crate) async fn poll_store(&self) {
        let modified = self.blocking(|store| store.modified()).await.ok().flatten();
        let should_reload = {
            let mut last = self.last_modified.lock().await;
            if modified.is_some() && modified != *last {
                *last = modified;
                !self.self_writing.load(Ordering::SeqCst)
            } else {
                false
            }
        };

        if should_reload {
            match self.reload_from_store().await {
                Ok(true) => tracing::info!("Reloaded Copilot token written by another process"),
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, "Failed to reload changed token record"),
            }
        }

        let max_age = self.options.stale_lock_age;
        if let Err(e) = self
            .blocking(move |store| store.reap_stale_lock(max_age))
            .await
            .and_then(|r| r)
        {
            tracing::warn!(error = %e, "Failed to remove stale refresh lock");
        }
    }

    /// Sleep before the next proactive refresh
    pub(crate) async fn next_refresh_delay(&self) -> Duration {
        match self.valid_token().await {
            Some(token) => token.refresh_due_in(self.options.safety_margin, epoch_now()),
            None => self.options.fallback_refresh_interval,
        }
    }
}

/// Copilot token manager
/// Serves access tokens to concurrent callers and keeps them fresh across processes
pub struct TokenManager {
    state: Arc<ManagerState>,
    cancel: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl TokenManager {
    /// Load the OAuth token from a config root and build a manager
    pub fn from_config_dir(config_dir: &Path, options: ManagerOptions) -> Result<Self, TokenError> {
        let credential = credentials::load_oauth_token(config_dir)?;
        Self::new(credential, options)
    }

    /// Create a manager backed by the token file in `options`
    pub fn new(credential: OAuthToken, options: ManagerOptions) -> Result<Self, TokenError> {
        let store = Arc::new(FileTokenStore::new(options.token_path.clone()));
        Self::with_store(credential, store, options)
    }

    /// Create a manager over any token store
    ///
    /// An unreadable persisted record is tolerated; the first caller refreshes.
    pub fn with_store(
        credential: OAuthToken,
        store: Arc<dyn TokenStore>,
        options: ManagerOptions,
    ) -> Result<Self, TokenError> {
        let client = Client::builder().timeout(options.request_timeout).build()?;

        let initial = match store.read() {
            Ok(token) => {
                tracing::info!(
                    "Loaded persisted Copilot token ({}...), valid: {}",
                    token.preview(),
                    token.is_valid_with(options.safety_margin, epoch_now())
                );
                Some(token)
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!("No persisted Copilot token yet");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring persisted Copilot token");
                None
            }
        };
        let last_modified = store.modified();

        let state = ManagerState {
            credential,
            store,
            client,
            options,
            token: RwLock::new(initial),
            last_modified: Mutex::new(last_modified),
            self_writing: AtomicBool::new(false),
            refresh_gate: Mutex::new(()),
        };

        Ok(Self {
            state: Arc::new(state),
            cancel: CancellationToken::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Start the proactive refresh and change detector loops
    ///
    /// Must be called from within a tokio runtime. Calling it again is a no-op.
    pub fn spawn_background(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if !tasks.is_empty() || self.cancel.is_cancelled() {
            return;
        }
        tasks.extend(scheduler::spawn(self.state.clone(), self.cancel.clone()));
        tracing::debug!("Token background tasks started");
    }

    /// Get a valid access token, refreshing synchronously if necessary
    pub async fn get_token(&self) -> Result<String, TokenError> {
        self.state.get_token().await
    }

    /// Refresh the access token; `force` skips the validity shortcut
    pub async fn refresh(&self, force: bool) -> Result<(), TokenError> {
        self.state.refresh(force).await
    }

    /// Current cached token, valid or not
    pub async fn cached_token(&self) -> Option<AccessToken> {
        self.state.token.read().await.clone()
    }

    pub fn token_path(&self) -> &Path {
        &self.state.options.token_path
    }

    /// Stop background tasks and wait for them to exit
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Token background task failed");
            }
        }
        tracing::debug!("Token manager shut down");
    }
}

impl Drop for TokenManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::lock::AdvisoryLock;
    use futures::future::join_all;
    use std::fs::OpenOptions;

    const PATH: &str = "/copilot_internal/v2/token";

    fn fast_options(dir: &Path, server_url: &str) -> ManagerOptions {
        ManagerOptions {
            auth_url: format!("{server_url}{PATH}"),
            lock_attempts: 3,
            lock_retry_delay: Duration::from_millis(20),
            lock_wait: Duration::from_millis(150),
            fallback_refresh_interval: Duration::from_secs(60),
            poll_interval: Duration::from_millis(25),
            request_timeout: Duration::from_secs(5),
            ..ManagerOptions::for_config_dir(dir)
        }
    }

    fn token_body(token: &str, ttl: i64) -> String {
        format!(
            r#"{{"token":"{token}","expires_at":{},"refresh_in":1500}}"#,
            epoch_now() as i64 + ttl
        )
    }

    fn seed(options: &ManagerOptions, token: &str, ttl: f64) -> FileTokenStore {
        let store = FileTokenStore::new(options.token_path.clone());
        store
            .write(&AccessToken::new(token, epoch_now() + ttl))
            .unwrap();
        store
    }

    fn manager(options: ManagerOptions) -> TokenManager {
        TokenManager::new(OAuthToken::new("gho_test"), options).unwrap()
    }

    async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_valid_cached_token_skips_network_and_lock() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("GET", PATH).expect(0).create_async().await;
        let dir = tempfile::tempdir().unwrap();
        let options = fast_options(dir.path(), &server.url());
        let store = seed(&options, "tid=cached", 1800.0);

        let manager = manager(options);
        assert_eq!(manager.get_token().await.unwrap(), "tid=cached");
        manager.refresh(false).await.unwrap();

        mock.assert_async().await;
        assert!(!store.lock_path().exists());
    }

    #[tokio::test]
    async fn test_expiring_token_is_refreshed_before_returning() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", PATH)
            .match_header("authorization", "token gho_test")
            .with_status(200)
            .with_body(token_body("tid=fresh", 1800))
            .expect(1)
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let options = fast_options(dir.path(), &server.url());
        let store = seed(&options, "abc", 30.0);

        let manager = manager(options);
        assert_eq!(manager.get_token().await.unwrap(), "tid=fresh");

        mock.assert_async().await;
        assert_eq!(store.read().unwrap().token, "tid=fresh");
        assert!(!store.lock_path().exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_refresh() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", PATH)
            .with_status(200)
            .with_body(token_body("tid=shared", 1800))
            .expect(1)
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(manager(fast_options(dir.path(), &server.url())));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.get_token().await })
            })
            .collect();

        for result in join_all(handles).await {
            assert_eq!(result.unwrap().unwrap(), "tid=shared");
        }
        mock.assert_async().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_managers_sharing_a_path_exchange_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", PATH)
            .with_status(200)
            .with_body(token_body("tid=first", 1800))
            .expect(1)
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let options = fast_options(dir.path(), &server.url());
        let a = manager(options.clone());
        let b = manager(options.clone());

        let (ra, rb) = tokio::join!(a.refresh(true), b.refresh(true));
        ra.unwrap();
        rb.unwrap();

        mock.assert_async().await;
        assert_eq!(a.get_token().await.unwrap(), "tid=first");
        assert_eq!(b.get_token().await.unwrap(), "tid=first");
        assert!(!FileTokenStore::new(options.token_path).lock_path().exists());
    }

    #[tokio::test]
    async fn test_lock_contention_adopts_sibling_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("GET", PATH).expect(0).create_async().await;
        let dir = tempfile::tempdir().unwrap();
        let options = fast_options(dir.path(), &server.url());
        let sibling = FileTokenStore::new(options.token_path.clone());
        let held = sibling.try_lock().unwrap().expect("sibling holds the lock");

        let manager = manager(options);
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            sibling
                .write(&AccessToken::new("tid=sibling", epoch_now() + 1800.0))
                .unwrap();
            held
        });

        manager.refresh(true).await.unwrap();
        assert_eq!(manager.get_token().await.unwrap(), "tid=sibling");

        drop(writer.await.unwrap());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_lock_contention_without_sibling_token_fails() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("GET", PATH).expect(0).create_async().await;
        let dir = tempfile::tempdir().unwrap();
        let options = fast_options(dir.path(), &server.url());
        let _held = FileTokenStore::new(options.token_path.clone())
            .try_lock()
            .unwrap()
            .unwrap();

        let manager = manager(options);
        let err = manager.get_token().await.unwrap_err();

        assert!(matches!(err, TokenError::LockUnavailable));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_failure_fails_closed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", PATH)
            .with_status(401)
            .with_body("Bad credentials")
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let options = fast_options(dir.path(), &server.url());
        let store = seed(&options, "tid=stale", 10.0);

        let manager = manager(options);
        let err = manager.get_token().await.unwrap_err();

        assert!(matches!(err, TokenError::Status { status: 401, .. }));
        assert_eq!(manager.cached_token().await.unwrap().token, "tid=stale");
        assert_eq!(store.read().unwrap().token, "tid=stale");
        assert!(!store.lock_path().exists());
    }

    #[tokio::test]
    async fn test_already_expiring_response_is_unavailable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", PATH)
            .with_status(200)
            .with_body(token_body("tid=short", 60))
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(fast_options(dir.path(), &server.url()));

        assert!(matches!(
            manager.get_token().await.unwrap_err(),
            TokenError::Unavailable
        ));
    }

    #[tokio::test]
    async fn test_invalid_persisted_json_starts_empty() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", PATH)
            .with_status(200)
            .with_body(token_body("tid=fresh", 1800))
            .expect(1)
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let options = fast_options(dir.path(), &server.url());
        let store = FileTokenStore::new(options.token_path.clone());
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "{not json").unwrap();
        assert!(matches!(store.read().unwrap_err(), TokenError::Parse { .. }));

        let manager = manager(options);
        assert!(manager.cached_token().await.is_none());
        assert_eq!(manager.get_token().await.unwrap(), "tid=fresh");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_credential_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let result =
            TokenManager::from_config_dir(dir.path(), ManagerOptions::for_config_dir(dir.path()));
        assert!(matches!(result, Err(TokenError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_reload_never_regresses() {
        let dir = tempfile::tempdir().unwrap();
        let options = fast_options(dir.path(), "http://127.0.0.1:1");
        let store = seed(&options, "tid=newer", 3600.0);
        let manager = manager(options);

        store
            .write(&AccessToken::new("tid=older", epoch_now() + 1800.0))
            .unwrap();
        assert!(!manager.state.reload_from_store().await.unwrap());
        assert_eq!(manager.cached_token().await.unwrap().token, "tid=newer");

        store
            .write(&AccessToken::new("tid=newest", epoch_now() + 7200.0))
            .unwrap();
        assert!(manager.state.reload_from_store().await.unwrap());
        assert_eq!(manager.cached_token().await.unwrap().token, "tid=newest");
    }

    #[tokio::test]
    async fn test_next_refresh_delay() {
        let dir = tempfile::tempdir().unwrap();
        let options = fast_options(dir.path(), "http://127.0.0.1:1");
        let manager = manager(options.clone());
        assert_eq!(
            manager.state.next_refresh_delay().await,
            options.fallback_refresh_interval
        );

        seed(&options, "tid=a", 1000.0);
        manager.state.reload_from_store().await.unwrap();
        let delay = manager.state.next_refresh_delay().await;
        assert!(delay > Duration::from_secs(870) && delay <= Duration::from_secs(880));
    }

    #[tokio::test]
    async fn test_change_detector_picks_up_external_write() {
        let dir = tempfile::tempdir().unwrap();
        let options = fast_options(dir.path(), "http://127.0.0.1:1");
        let store = seed(&options, "tid=ours", 1800.0);
        let manager = manager(options);
        manager.spawn_background();

        tokio::time::sleep(Duration::from_millis(50)).await;
        store
            .write(&AccessToken::new("tid=external", epoch_now() + 3600.0))
            .unwrap();

        let m = &manager;
        assert!(
            eventually(|| async move {
                m.cached_token().await.map(|t| t.token) == Some("tid=external".into())
            })
            .await
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_change_detector_reaps_stale_lock() {
        let dir = tempfile::tempdir().unwrap();
        let options = fast_options(dir.path(), "http://127.0.0.1:1");
        let store = seed(&options, "tid=ours", 1800.0);
        let lock = AdvisoryLock::for_file(store.path());
        std::fs::write(lock.path(), "4242\n").unwrap();
        OpenOptions::new()
            .write(true)
            .open(lock.path())
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(301))
            .unwrap();

        let manager = manager(options);
        manager.spawn_background();

        let lock = &lock;
        assert!(eventually(|| async move { !lock.path().exists() }).await);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_change_detector_keeps_fresh_lock() {
        let dir = tempfile::tempdir().unwrap();
        let options = fast_options(dir.path(), "http://127.0.0.1:1");
        let store = seed(&options, "tid=ours", 1800.0);
        let _held = store.try_lock().unwrap().unwrap();

        let manager = manager(options);
        manager.spawn_background();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(store.lock_path().exists());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_proactive_loop_refreshes_before_expiry() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", PATH)
            .with_status(200)
            .with_body(token_body("tid=proactive", 1800))
            .expect(1)
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let options = fast_options(dir.path(), &server.url());
        let store = seed(&options, "tid=old", 120.3);

        let manager = manager(options);
        manager.spawn_background();

        let store = &store;
        assert!(
            eventually(|| async move {
                store.read().map(|t| t.token).ok() == Some("tid=proactive".into())
            })
            .await
        );
        manager.shutdown().await;
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_sleeping_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = fast_options(dir.path(), "http://127.0.0.1:1");
        options.poll_interval = Duration::from_secs(3600);
        seed(&options, "tid=ours", 7200.0);
        let manager = manager(options);
        manager.spawn_background();
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(1), manager.shutdown())
            .await
            .expect("background tasks did not stop");
    }

    #[tokio::test]
    async fn test_caller_queued_behind_a_refresh_reuses_its_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", PATH)
            .with_status(200)
            .with_body(token_body("tid=winner", 1800))
            .expect(1)
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(fast_options(dir.path(), &server.url()));

        let observed = match manager.state.lookup().await {
            Cached::Stale(observed) => observed,
            Cached::Valid(_) => panic!("cache should start empty"),
        };
        // Another caller finishes its refresh before this one reaches the gate
        manager.refresh(true).await.unwrap();

        manager.state.refresh_from(observed, true).await.unwrap();
        assert_eq!(manager.get_token().await.unwrap(), "tid=winner");
        mock.assert_async().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_repeated_concurrent_batches_exchange_once_each() {
        const ROUNDS: usize = 10;
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", PATH)
            .with_status(200)
            .with_body(token_body("tid=batch", 1800))
            .expect(ROUNDS)
            .create_async()
            .await;

        for _ in 0..ROUNDS {
            let dir = tempfile::tempdir().unwrap();
            let manager = Arc::new(manager(fast_options(dir.path(), &server.url())));
            let handles: Vec<_> = (0..64)
                .map(|_| {
                    let manager = manager.clone();
                    tokio::spawn(async move { manager.get_token().await })
                })
                .collect();

            for result in join_all(handles).await {
                assert_eq!(result.unwrap().unwrap(), "tid=batch");
            }
        }
        mock.assert_async().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_write_releases_self_write_flag() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", PATH)
            .with_status(200)
            .with_body(token_body("tid=fresh", 1800))
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let options = fast_options(dir.path(), &server.url());
        let manager = Arc::new(manager(options.clone()));

        // Park the writer right after the file write
        let held = manager.state.last_modified.lock().await;
        let caller = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_token().await })
        };

        let state = &manager.state;
        let path = &options.token_path;
        assert!(
            eventually(|| async move {
                state.self_writing.load(Ordering::SeqCst) && path.exists()
            })
            .await
        );
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());
        drop(held);

        assert!(!manager.state.self_writing.load(Ordering::SeqCst));

        // Writes by other processes are still picked up
        FileTokenStore::new(options.token_path.clone())
            .write(&AccessToken::new("tid=external", epoch_now() + 3600.0))
            .unwrap();
        manager.state.poll_store().await;
        assert_eq!(
            manager.cached_token().await.map(|t| t.token),
            Some("tid=external".to_string())
        );
    }

    /// Store whose reads block the calling thread until released
    struct GatedStore {
        armed: AtomicBool,
        release: std::sync::Mutex<std::sync::mpsc::Receiver<()>>,
        token: AccessToken,
    }

    impl TokenStore for GatedStore {
        fn read(&self) -> Result<AccessToken, TokenError> {
            if self.armed.load(Ordering::SeqCst) {
                let release = self.release.lock().unwrap();
                release
                    .recv_timeout(Duration::from_secs(2))
                    .map_err(|_| TokenError::LockUnavailable)?;
            }
            Ok(self.token.clone())
        }

        fn write(&self, _token: &AccessToken) -> Result<(), TokenError> {
            Ok(())
        }

        fn modified(&self) -> Option<SystemTime> {
            None
        }

        fn try_lock(&self) -> Result<Option<LockGuard>, TokenError> {
            Ok(None)
        }

        fn reap_stale_lock(&self, _max_age: Duration) -> Result<bool, TokenError> {
            Ok(false)
        }
    }

    // Single-threaded runtime: an inline blocking read would starve the releaser
    #[tokio::test]
    async fn test_store_io_does_not_block_the_runtime() {
        let (tx, rx) = std::sync::mpsc::channel();
        let store = Arc::new(GatedStore {
            armed: AtomicBool::new(false),
            release: std::sync::Mutex::new(rx),
            token: AccessToken::new("tid=disk", epoch_now() + 1800.0),
        });
        let dir = tempfile::tempdir().unwrap();
        let manager = TokenManager::with_store(
            OAuthToken::new("gho_test"),
            store.clone(),
            fast_options(dir.path(), "http://127.0.0.1:1"),
        )
        .unwrap();
        *manager.state.token.write().await = None;
        store.armed.store(true, Ordering::SeqCst);

        let release = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(()).unwrap();
        };
        let (reloaded, ()) = tokio::join!(manager.state.reload_from_store(), release);

        assert!(reloaded.unwrap());
        assert_eq!(manager.get_token().await.unwrap(), "tid=disk");
    }
}
