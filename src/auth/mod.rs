// Authentication module
// Manages the Copilot token lifecycle shared across processes

mod credentials;
mod lock;
mod manager;
mod refresh;
mod scheduler;
mod store;
mod types;

pub use credentials::{default_config_dir, load_oauth_token, token_path};
pub use lock::{AdvisoryLock, LockGuard, STALE_LOCK_AGE};
pub use manager::{ManagerOptions, TokenManager};
pub use refresh::{DEFAULT_AUTH_URL, EDITOR_VERSION, GITHUB_API_VERSION};
pub use store::{FileTokenStore, TokenStore};
pub use types::{epoch_now, AccessToken, OAuthToken, TokenError, SAFETY_MARGIN};
