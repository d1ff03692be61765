// ABOUTME: Authenticators that supply the one extra header sent with every gateway request.
// ABOUTME: The etcd variant trades username/password for a token, caches it and refetches after a 401.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aviso_core::AuthConfig;
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;

use crate::adapter::{StoreError, StoreResult};

const HANDSHAKE_ATTEMPTS: u32 = 5;
const HANDSHAKE_BASE_DELAY: Duration = Duration::from_millis(200);

/// Supplies an optional `(name, value)` header for gateway requests.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn header(
        &self,
        http: &reqwest::Client,
        base_url: &str,
    ) -> StoreResult<Option<(String, String)>>;

    /// Drop any cached credential so the next `header` call fetches a fresh one.
    async fn invalidate(&self) {}
}

/// Build the authenticator selected by configuration.
pub fn from_config(auth: &AuthConfig) -> Arc<dyn Authenticator> {
    match auth {
        AuthConfig::None => Arc::new(NoAuth),
        AuthConfig::Static { header, value } => Arc::new(StaticAuth {
            header: header.clone(),
            value: value.clone(),
        }),
        AuthConfig::Etcd { username, password } => {
            Arc::new(EtcdTokenAuth::new(username.clone(), password.clone()))
        }
    }
}

pub struct NoAuth;

#[async_trait]
impl Authenticator for NoAuth {
    async fn header(&self, _: &reqwest::Client, _: &str) -> StoreResult<Option<(String, String)>> {
        Ok(None)
    }
}

/// A fixed header, e.g. a bearer token issued out of band.
pub struct StaticAuth {
    header: String,
    value: String,
}

#[async_trait]
impl Authenticator for StaticAuth {
    async fn header(&self, _: &reqwest::Client, _: &str) -> StoreResult<Option<(String, String)>> {
        Ok(Some((self.header.clone(), self.value.clone())))
    }
}

/// etcd's own auth: `auth/authenticate` returns a token sent as `Authorization`.
pub struct EtcdTokenAuth {
    username: String,
    password: String,
    token: Mutex<Option<String>>,
}

#[derive(Deserialize)]
struct AuthenticateResponse {
    token: String,
}

impl EtcdTokenAuth {
    pub fn new(username: String, password: String) -> Self {
        Self {
            username,
            password,
            token: Mutex::new(None),
        }
    }

    async fn authenticate(&self, http: &reqwest::Client, base_url: &str) -> StoreResult<String> {
        let url = format!("{}/v3/auth/authenticate", base_url);
        let body = json!({"name": self.username, "password": self.password});

        let mut attempt = 1;
        loop {
            match self.try_authenticate(http, &url, &body).await {
                Ok(token) => return Ok(token),
                Err(e) if e.is_transient() && attempt < HANDSHAKE_ATTEMPTS => {
                    let delay = jittered(attempt);
                    tracing::warn!(
                        "etcd authentication attempt {} failed, retrying in {:?}: {}",
                        attempt,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_authenticate(
        &self,
        http: &reqwest::Client,
        url: &str,
        body: &serde_json::Value,
    ) -> StoreResult<String> {
        let response = http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("authenticate request failed: {}", e)))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(StoreError::Unavailable(format!("authenticate returned {}", status)));
        }
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(StoreError::Auth(format!(
                "authenticate as '{}' returned {}: {}",
                self.username, status, error_body
            )));
        }

        let parsed: AuthenticateResponse = response.json().await.map_err(|e| {
            StoreError::InvalidResponse(format!("failed to parse authenticate response: {}", e))
        })?;
        Ok(parsed.token)
    }
}

#[async_trait]
impl Authenticator for EtcdTokenAuth {
    async fn header(
        &self,
        http: &reqwest::Client,
        base_url: &str,
    ) -> StoreResult<Option<(String, String)>> {
        let mut cached = self.token.lock().await;
        if cached.is_none() {
            tracing::debug!("requesting etcd token for '{}'", self.username);
            *cached = Some(self.authenticate(http, base_url).await?);
        }
        Ok(cached
            .as_ref()
            .map(|token| ("Authorization".to_string(), token.clone())))
    }

    async fn invalidate(&self) {
        *self.token.lock().await = None;
    }
}

/// Exponential delay for `attempt` with up to 50% random jitter added.
fn jittered(attempt: u32) -> Duration {
    let base = HANDSHAKE_BASE_DELAY * 2u32.saturating_pow(attempt.saturating_sub(1));
    let max_jitter = u64::try_from(base.as_millis() / 2).unwrap_or(0);
    let jitter = rand::thread_rng().gen_range(0..=max_jitter);
    base + Duration::from_millis(jitter)
}
