//! Cached bearer credential for the internal token endpoint.
//!
//! [`MachineTokenProvider`] is the single owner of the cached token: callers
//! hold the provider instance, call `get()`, and never touch ambient global
//! state. The token is refreshed once fewer than 30 seconds of validity
//! remain.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

/// Tokens are refreshed this long before their stated expiry.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(30);

const DEFAULT_EXPIRES_IN_SECS: u64 = 300;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum TokenError {
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token endpoint returned status {status}")]
    Status { status: u16 },
    #[error("token response did not contain an access token")]
    MissingAccessToken,
}

/// Successful grant from the token endpoint.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_in: Duration,
}

/// The network side of the client-credentials flow, kept behind a trait so
/// the caching logic is testable without an endpoint.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn fetch(&self) -> Result<TokenGrant, TokenError>;
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
}

/// OAuth2 client-credentials flow over HTTP. Credentials travel as HTTP
/// Basic auth; a 401 is retried once with the credentials in the form body.
pub struct HttpTokenEndpoint {
    http: reqwest::Client,
    config: TokenConfig,
}

impl HttpTokenEndpoint {
    pub fn new(http: reqwest::Client, config: TokenConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn fetch(&self) -> Result<TokenGrant, TokenError> {
        let form = [
            ("grant_type", "client_credentials"),
            ("scope", self.config.scope.as_str()),
        ];
        let mut response = self
            .http
            .post(&self.config.token_url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&form)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            debug!("token endpoint rejected basic auth, retrying with body credentials");
            let fallback = [
                ("grant_type", "client_credentials"),
                ("scope", self.config.scope.as_str()),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ];
            response = self
                .http
                .post(&self.config.token_url)
                .form(&fallback)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await?;
        }

        let status = response.status();
        if !status.is_success() {
            return Err(TokenError::Status {
                status: status.as_u16(),
            });
        }
        let body: TokenResponse = response.json().await?;
        let access_token = body.access_token.ok_or(TokenError::MissingAccessToken)?;
        let expires_in = Duration::from_secs(body.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS));
        Ok(TokenGrant {
            access_token,
            expires_in,
        })
    }
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Single-owner cache around a [`TokenEndpoint`].
pub struct MachineTokenProvider<E: TokenEndpoint> {
    endpoint: E,
    cached: Mutex<Option<CachedToken>>,
}

impl<E: TokenEndpoint> MachineTokenProvider<E> {
    pub fn new(endpoint: E) -> Self {
        Self {
            endpoint,
            cached: Mutex::new(None),
        }
    }

    /// Returns the cached token while more than [`REFRESH_MARGIN`] of
    /// validity remains, otherwise fetches a fresh grant.
    pub async fn get(&self) -> Result<String, TokenError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() + REFRESH_MARGIN < token.expires_at {
                return Ok(token.value.clone());
            }
        }
        let grant = self.endpoint.fetch().await?;
        let value = grant.access_token.clone();
        *cached = Some(CachedToken {
            value: grant.access_token,
            expires_at: Instant::now() + grant.expires_in,
        });
        Ok(value)
    }

    /// Drops the cached token; the next `get()` refetches.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

impl MachineTokenProvider<HttpTokenEndpoint> {
    pub fn from_config(http: reqwest::Client, config: TokenConfig) -> Self {
        Self::new(HttpTokenEndpoint::new(http, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeEndpoint {
        calls: AtomicUsize,
        expires_in: Duration,
    }

    impl FakeEndpoint {
        fn new(expires_in: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                expires_in,
            }
        }
    }

    #[async_trait]
    impl TokenEndpoint for FakeEndpoint {
        async fn fetch(&self) -> Result<TokenGrant, TokenError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TokenGrant {
                access_token: format!("token-{call}"),
                expires_in: self.expires_in,
            })
        }
    }

    #[tokio::test]
    async fn cached_token_is_reused_within_validity_window() {
        let provider = MachineTokenProvider::new(FakeEndpoint::new(Duration::from_secs(300)));
        let first = provider.get().await.unwrap();
        let second = provider.get().await.unwrap();
        assert_eq!(first, "token-1");
        assert_eq!(second, "token-1");
        assert_eq!(provider.endpoint.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn token_near_expiry_is_refreshed() {
        // 10s validity sits inside the 30s refresh margin.
        let provider = MachineTokenProvider::new(FakeEndpoint::new(Duration::from_secs(10)));
        let first = provider.get().await.unwrap();
        let second = provider.get().await.unwrap();
        assert_eq!(first, "token-1");
        assert_eq!(second, "token-2");
        assert_eq!(provider.endpoint.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_a_refetch() {
        let provider = MachineTokenProvider::new(FakeEndpoint::new(Duration::from_secs(300)));
        provider.get().await.unwrap();
        provider.invalidate().await;
        let token = provider.get().await.unwrap();
        assert_eq!(token, "token-2");
    }
}
