use std::collections::BTreeMap;
use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;

/// Static provider credentials must never reach the gateway process; keys
/// are fetched just-in-time from the secret store instead.
const FORBIDDEN_VARS: &[&str] = &["OPENAI_API_KEY", "ANTHROPIC_API_KEY"];

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_TOTAL_BUDGET_SECS: u64 = 10;
const DEFAULT_RETRY_WAIT_MIN_SECS: u64 = 2;
const DEFAULT_RETRY_WAIT_MAX_SECS: u64 = 10;
const DEFAULT_BUDGET_CHECK_TIMEOUT_MS: u64 = 500;
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 300;
const DEFAULT_ACCOUNTING_WORKERS: usize = 2;
const DEFAULT_ACCOUNTING_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {name}: {reason}")]
    InvalidVar { name: &'static str, reason: String },
    #[error(
        "static provider credential {0} present in environment; \
         provider keys must come from the secret store"
    )]
    ForbiddenVar(&'static str),
}

/// Environment lookup with an overlay map, so configuration can be loaded
/// from a plain map in tests without touching process state.
#[derive(Clone, Default)]
pub struct Env {
    overlay: BTreeMap<String, String>,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&str> = self.overlay.keys().map(|key| key.as_str()).collect();
        f.debug_struct("Env").field("overlay_keys", &keys).finish()
    }
}

impl Env {
    pub fn process() -> Self {
        Self::default()
    }

    pub fn from_map(overlay: BTreeMap<String, String>) -> Self {
        Self { overlay }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.overlay.get(key) {
            return Some(value.clone());
        }
        std::env::var(key)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }
}

#[derive(Clone, Debug)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub total_budget: Duration,
    pub wait_min: Duration,
    pub wait_max: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            total_budget: Duration::from_secs(DEFAULT_RETRY_TOTAL_BUDGET_SECS),
            wait_min: Duration::from_secs(DEFAULT_RETRY_WAIT_MIN_SECS),
            wait_max: Duration::from_secs(DEFAULT_RETRY_WAIT_MAX_SECS),
        }
    }
}

/// Process configuration. Secret-bearing fields are `SecretString`, so a
/// `Debug` dump of the whole struct stays safe to log.
#[derive(Clone, Debug)]
pub struct Settings {
    pub listen_addr: String,
    pub redis_url: String,
    pub vault_addr: String,
    pub vault_role_id: String,
    pub vault_secret_id: SecretString,
    pub gateway_access_token: SecretString,
    pub retry: RetrySettings,
    pub budget_check_timeout: Duration,
    pub upstream_timeout: Duration,
    pub accounting_workers: usize,
    pub accounting_queue_capacity: usize,
    pub openai_base_url: Option<String>,
    pub anthropic_base_url: Option<String>,
    pub log_json: bool,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(&Env::process())
    }

    pub fn load(env: &Env) -> Result<Self, ConfigError> {
        for name in FORBIDDEN_VARS {
            if env.get(name).is_some() {
                return Err(ConfigError::ForbiddenVar(name));
            }
        }

        Ok(Self {
            listen_addr: env
                .get("GATEWAY_LISTEN_ADDR")
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string()),
            redis_url: required(env, "REDIS_URL")?,
            vault_addr: required(env, "VAULT_ADDR")?,
            vault_role_id: required(env, "VAULT_ROLE_ID")?,
            vault_secret_id: SecretString::from(required(env, "VAULT_SECRET_ID")?),
            gateway_access_token: SecretString::from(required(env, "GATEWAY_ACCESS_TOKEN")?),
            retry: RetrySettings {
                max_attempts: parsed(
                    env,
                    "RETRY_STOP_AFTER_ATTEMPT",
                    DEFAULT_RETRY_MAX_ATTEMPTS,
                )?,
                total_budget: Duration::from_secs(parsed(
                    env,
                    "RETRY_STOP_AFTER_DELAY",
                    DEFAULT_RETRY_TOTAL_BUDGET_SECS,
                )?),
                wait_min: Duration::from_secs(parsed(
                    env,
                    "RETRY_WAIT_MIN",
                    DEFAULT_RETRY_WAIT_MIN_SECS,
                )?),
                wait_max: Duration::from_secs(parsed(
                    env,
                    "RETRY_WAIT_MAX",
                    DEFAULT_RETRY_WAIT_MAX_SECS,
                )?),
            },
            budget_check_timeout: Duration::from_millis(parsed(
                env,
                "BUDGET_CHECK_TIMEOUT_MS",
                DEFAULT_BUDGET_CHECK_TIMEOUT_MS,
            )?),
            upstream_timeout: Duration::from_secs(parsed(
                env,
                "UPSTREAM_TIMEOUT_SECS",
                DEFAULT_UPSTREAM_TIMEOUT_SECS,
            )?),
            accounting_workers: parsed(env, "ACCOUNTING_WORKERS", DEFAULT_ACCOUNTING_WORKERS)?,
            accounting_queue_capacity: parsed(
                env,
                "ACCOUNTING_QUEUE_CAPACITY",
                DEFAULT_ACCOUNTING_QUEUE_CAPACITY,
            )?,
            openai_base_url: env.get("OPENAI_BASE_URL"),
            anthropic_base_url: env.get("ANTHROPIC_BASE_URL"),
            log_json: env
                .get("LOG_FORMAT")
                .map(|value| value.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }
}

fn required(env: &Env, name: &'static str) -> Result<String, ConfigError> {
    env.get(name).ok_or(ConfigError::MissingVar(name))
}

fn parsed<T: std::str::FromStr>(
    env: &Env,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env.get(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|err| ConfigError::InvalidVar {
            name,
            reason: format!("{err}"),
        }),
    }
}
