//! Shared authorized HTTP layer.
//!
//! Every REST call goes through [`ApiClient::send_authorized`], which
//! injects the bearer token and performs at most one refresh-and-retry on a
//! 401. The retry budget travels in an explicit, immutable
//! [`RequestContext`] value rather than a mutable flag on the request.

use std::sync::Arc;

use reqwest::StatusCode;

use chatloop_proto::auth::{RefreshRequest, RefreshResponse};

use crate::auth::TokenProvider;
use crate::config::SyncConfig;

/// Per-request retry context. A fresh context allows exactly one
/// refresh-and-retry; the retried request gets a context that allows none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    attempt: u8,
}

impl RequestContext {
    /// Context for the original request.
    #[must_use]
    pub const fn initial() -> Self {
        Self { attempt: 0 }
    }

    /// Zero-based attempt number.
    #[must_use]
    pub const fn attempt(self) -> u8 {
        self.attempt
    }

    /// The context for a retry after a token refresh, or `None` when the
    /// retry budget is spent.
    #[must_use]
    pub const fn retry_after_refresh(self) -> Option<Self> {
        if self.attempt == 0 {
            Some(Self { attempt: 1 })
        } else {
            None
        }
    }
}

/// Errors from the authorized HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// The request could not be sent or the response body not read.
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// No access token is available.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The backend rejected both the request and the token refresh; the
    /// session is gone.
    #[error("session expired")]
    AuthLost,
}

/// HTTP client sharing one connection pool, token source, and refresh
/// policy across the query and upload paths.
pub struct ApiClient {
    http: reqwest::Client,
    cfg: Arc<SyncConfig>,
    tokens: Arc<dyn TokenProvider>,
}

impl ApiClient {
    /// Creates a client over the given configuration and token source.
    #[must_use]
    pub fn new(cfg: Arc<SyncConfig>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            http: reqwest::Client::new(),
            cfg,
            tokens,
        }
    }

    /// Builds and sends a bearer-authorized request.
    ///
    /// `build` is called once per attempt so a retried request is rebuilt
    /// from scratch (request bodies are not reusable across sends). On a
    /// 401 the token is refreshed and the request retried exactly once; a
    /// second 401, or a rejected refresh, marks the session lost.
    ///
    /// # Errors
    ///
    /// - [`HttpError::NotAuthenticated`] when no access token is held.
    /// - [`HttpError::AuthLost`] when refresh-and-retry is exhausted.
    /// - [`HttpError::Transport`] for connection-level failures.
    pub async fn send_authorized<F>(&self, build: F) -> Result<reqwest::Response, HttpError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut ctx = RequestContext::initial();
        loop {
            let token = self
                .tokens
                .access_token()
                .ok_or(HttpError::NotAuthenticated)?;
            let response = build(&self.http).bearer_auth(&token).send().await?;
            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }

            let Some(next) = ctx.retry_after_refresh() else {
                tracing::warn!("request unauthorized after refresh, session lost");
                self.tokens.mark_lost();
                return Err(HttpError::AuthLost);
            };
            self.refresh().await?;
            tracing::debug!(attempt = next.attempt(), "retrying request with fresh token");
            ctx = next;
        }
    }

    /// Exchanges the refresh token for a new access token.
    ///
    /// A 4xx refusal here is the definitive "session revoked" signal.
    async fn refresh(&self) -> Result<(), HttpError> {
        let Some(refresh) = self.tokens.refresh_token() else {
            self.tokens.mark_lost();
            return Err(HttpError::AuthLost);
        };

        let response = self
            .http
            .post(self.cfg.refresh_url())
            .json(&RefreshRequest { refresh })
            .send()
            .await?;
        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), "token refresh rejected");
            self.tokens.mark_lost();
            return Err(HttpError::AuthLost);
        }

        let body: RefreshResponse = response.json().await?;
        self.tokens.replace_access(body.access);
        tracing::debug!("access token refreshed");
        Ok(())
    }

    /// The engine configuration this client was built with.
    #[must_use]
    pub fn config(&self) -> &Arc<SyncConfig> {
        &self.cfg
    }
}
