//! Access token supply and the auth-lost signal.
//!
//! The engine never authenticates itself: it reads whatever tokens the host
//! application holds via [`TokenProvider`], and reports irrecoverable auth
//! failure (refresh rejected) through [`TokenProvider::mark_lost`] so the
//! host can drop to its login screen and the connection layer can stop
//! reconnecting.

use parking_lot::RwLock;
use tokio::sync::watch;

/// Read-only token source shared by the connection and HTTP layers.
///
/// At most one refresh-and-retry happens per original request; when the
/// refresh succeeds the new access token is stored via
/// [`replace_access`](Self::replace_access), and when it is rejected
/// [`mark_lost`](Self::mark_lost) is called exactly once per loss.
pub trait TokenProvider: Send + Sync {
    /// The current access token, or `None` when unauthenticated.
    fn access_token(&self) -> Option<String>;

    /// The current refresh token, or `None` when unauthenticated.
    fn refresh_token(&self) -> Option<String>;

    /// Stores a new access token obtained from a successful refresh.
    fn replace_access(&self, token: String);

    /// Marks the session as lost: both tokens are cleared and any auth-lost
    /// observers are notified.
    fn mark_lost(&self);
}

#[derive(Debug, Default)]
struct TokenState {
    access: Option<String>,
    refresh: Option<String>,
}

/// In-memory [`TokenProvider`] holding one access/refresh pair.
///
/// Hosts with their own credential storage implement [`TokenProvider`]
/// directly; this covers tests and simple embeddings.
pub struct StaticTokens {
    state: RwLock<TokenState>,
    lost_tx: watch::Sender<bool>,
}

impl StaticTokens {
    /// Creates a provider holding the given token pair.
    #[must_use]
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        let (lost_tx, _) = watch::channel(false);
        Self {
            state: RwLock::new(TokenState {
                access: Some(access.into()),
                refresh: Some(refresh.into()),
            }),
            lost_tx,
        }
    }

    /// Creates an unauthenticated provider.
    #[must_use]
    pub fn unauthenticated() -> Self {
        let (lost_tx, _) = watch::channel(false);
        Self {
            state: RwLock::new(TokenState::default()),
            lost_tx,
        }
    }

    /// Watch channel that flips to `true` when the session is lost.
    #[must_use]
    pub fn watch_lost(&self) -> watch::Receiver<bool> {
        self.lost_tx.subscribe()
    }
}

impl TokenProvider for StaticTokens {
    fn access_token(&self) -> Option<String> {
        self.state.read().access.clone()
    }

    fn refresh_token(&self) -> Option<String> {
        self.state.read().refresh.clone()
    }

    fn replace_access(&self, token: String) {
        self.state.write().access = Some(token);
    }

    fn mark_lost(&self) {
        let mut state = self.state.write();
        state.access = None;
        state.refresh = None;
        drop(state);
        tracing::warn!("authentication lost, tokens cleared");
        self.lost_tx.send_replace(true);
    }
}
