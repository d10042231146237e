use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use thiserror::Error;

const SECRET_STORE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
    #[error("secret not found at {0}")]
    NotFound(String),
    #[error("secret store authentication failed: {0}")]
    Auth(String),
}

/// Provider credential scoped to a single request frame. The key lives in
/// a `SecretString`, so `Debug` output is redacted and the pipeline drops
/// the whole record before its handler returns.
#[derive(Debug)]
pub struct EphemeralCredential {
    api_key: SecretString,
    fetched_at: Instant,
}

impl EphemeralCredential {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key: SecretString::from(api_key),
            fetched_at: Instant::now(),
        }
    }

    pub(crate) fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }

    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }
}

/// Seam over the external secret store. Implementations hand out a fresh
/// [`EphemeralCredential`] per call; the core never caches one.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn fetch(&self, path: &str) -> Result<EphemeralCredential, SecretStoreError>;
}

/// Vault-compatible secret store driven over its HTTP API: AppRole login
/// once at startup, KV v2 reads per request.
pub struct VaultClient {
    http: reqwest::Client,
    addr: String,
    token: Option<SecretString>,
}

impl VaultClient {
    pub fn new(addr: impl Into<String>) -> Result<Self, SecretStoreError> {
        let http = reqwest::Client::builder()
            .timeout(SECRET_STORE_TIMEOUT)
            .build()
            .map_err(|err| SecretStoreError::Unavailable(err.to_string()))?;
        Ok(Self {
            http,
            addr: addr.into(),
            token: None,
        })
    }

    /// AppRole login. Called exactly once, before the client is shared.
    pub async fn authenticate(
        &mut self,
        role_id: &str,
        secret_id: &str,
    ) -> Result<(), SecretStoreError> {
        let url = format!("{}/v1/auth/approle/login", self.addr.trim_end_matches('/'));
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({
                "role_id": role_id,
                "secret_id": secret_id,
            }))
            .send()
            .await
            .map_err(|err| SecretStoreError::Unavailable(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SecretStoreError::Auth(format!(
                "approle login returned {status}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| SecretStoreError::Auth(err.to_string()))?;
        let client_token = body
            .get("auth")
            .and_then(|auth| auth.get("client_token"))
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                SecretStoreError::Auth("approle login response missing client_token".to_string())
            })?;

        self.token = Some(SecretString::from(client_token.to_string()));
        Ok(())
    }

    /// `secret/infrastructure/openai` → `GET /v1/secret/data/infrastructure/openai`.
    fn data_url(&self, path: &str) -> Result<String, SecretStoreError> {
        let (mount, rest) = path
            .split_once('/')
            .filter(|(mount, rest)| !mount.is_empty() && !rest.is_empty())
            .ok_or_else(|| SecretStoreError::NotFound(path.to_string()))?;
        Ok(format!(
            "{}/v1/{mount}/data/{rest}",
            self.addr.trim_end_matches('/')
        ))
    }
}

#[async_trait]
impl SecretStore for VaultClient {
    async fn fetch(&self, path: &str) -> Result<EphemeralCredential, SecretStoreError> {
        let token = self
            .token
            .as_ref()
            .ok_or_else(|| SecretStoreError::Auth("secret store not authenticated".to_string()))?;

        let response = self
            .http
            .get(self.data_url(path)?)
            .header("X-Vault-Token", token.expose_secret())
            .send()
            .await
            .map_err(|err| SecretStoreError::Unavailable(err.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SecretStoreError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            return Err(SecretStoreError::Unavailable(format!(
                "secret store returned {status}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| SecretStoreError::Unavailable(err.to_string()))?;
        let api_key = body
            .get("data")
            .and_then(|data| data.get("data"))
            .and_then(|data| data.get("api_key"))
            .and_then(Value::as_str)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| SecretStoreError::NotFound(path.to_string()))?;

        Ok(EphemeralCredential::new(api_key.to_string()))
    }
}

/// Fixed path-to-key map for tests and single-tenant local runs.
#[derive(Clone, Default)]
pub struct StaticSecrets {
    secrets: HashMap<String, String>,
}

impl std::fmt::Debug for StaticSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let paths: Vec<&str> = self.secrets.keys().map(|path| path.as_str()).collect();
        f.debug_struct("StaticSecrets").field("paths", &paths).finish()
    }
}

impl StaticSecrets {
    pub fn with_secret(mut self, path: impl Into<String>, api_key: impl Into<String>) -> Self {
        self.secrets.insert(path.into(), api_key.into());
        self
    }
}

#[async_trait]
impl SecretStore for StaticSecrets {
    async fn fetch(&self, path: &str) -> Result<EphemeralCredential, SecretStoreError> {
        self.secrets
            .get(path)
            .map(|api_key| EphemeralCredential::new(api_key.clone()))
            .ok_or_else(|| SecretStoreError::NotFound(path.to_string()))
    }
}
