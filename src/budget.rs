use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;

fn budget_key(project_id: &str) -> String {
    format!("budget:{project_id}:remaining")
}

fn usage_key(project_id: &str) -> String {
    format!("usage:{project_id}:total")
}

#[derive(Debug, Error)]
pub enum BudgetStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("budget store unavailable: {0}")]
    Unavailable(String),
}

/// Seam over the shared KV store holding the per-project counters. The
/// store only moves integers; admission policy lives in [`BudgetManager`].
#[async_trait]
pub trait BudgetStore: Send + Sync {
    /// Current value of `budget:{P}:remaining`, or `None` when the key is
    /// absent. A present-but-garbled value reads as zero (fail closed).
    async fn remaining_tokens(&self, project_id: &str) -> Result<Option<i64>, BudgetStoreError>;

    /// Atomically decrement the remaining budget and grow the usage
    /// accumulator by the same amount. Both land or neither does.
    async fn record_usage(&self, project_id: &str, tokens: u64) -> Result<(), BudgetStoreError>;
}

/// Production store: one process-wide redis client, a multiplexed
/// connection per call, atomic pipelined writes.
#[derive(Clone, Debug)]
pub struct RedisBudgetStore {
    client: redis::Client,
}

impl RedisBudgetStore {
    pub fn connect(url: impl AsRef<str>) -> Result<Self, BudgetStoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> Result<(), BudgetStoreError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get("budget:__ping__:remaining").await?;
        Ok(())
    }
}

#[async_trait]
impl BudgetStore for RedisBudgetStore {
    async fn remaining_tokens(&self, project_id: &str) -> Result<Option<i64>, BudgetStoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.get(budget_key(project_id)).await?;
        match raw {
            None => Ok(None),
            Some(value) => match value.trim().parse::<i64>() {
                Ok(remaining) => Ok(Some(remaining)),
                Err(_) => {
                    tracing::warn!(project_id, "unparsable budget value; treating as exhausted");
                    Ok(Some(0))
                }
            },
        }
    }

    async fn record_usage(&self, project_id: &str, tokens: u64) -> Result<(), BudgetStoreError> {
        let mut conn = self.connection().await?;
        let delta = i64::try_from(tokens).unwrap_or(i64::MAX);
        let _: () = redis::pipe()
            .atomic()
            .decr(budget_key(project_id), delta)
            .incr(usage_key(project_id), delta)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// In-memory store with the same fail-closed semantics. Used by tests and
/// by local single-process deployments that have no redis at hand.
#[derive(Clone, Debug, Default)]
pub struct MemoryBudgetStore {
    inner: Arc<Mutex<MemoryCounters>>,
}

#[derive(Debug, Default)]
struct MemoryCounters {
    remaining: HashMap<String, i64>,
    usage: HashMap<String, u64>,
}

impl MemoryBudgetStore {
    pub fn set_remaining(&self, project_id: impl Into<String>, tokens: i64) {
        let mut inner = self.inner.lock().expect("budget counters poisoned");
        inner.remaining.insert(project_id.into(), tokens);
    }

    pub fn remaining(&self, project_id: &str) -> Option<i64> {
        let inner = self.inner.lock().expect("budget counters poisoned");
        inner.remaining.get(project_id).copied()
    }

    pub fn usage_total(&self, project_id: &str) -> u64 {
        let inner = self.inner.lock().expect("budget counters poisoned");
        inner.usage.get(project_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl BudgetStore for MemoryBudgetStore {
    async fn remaining_tokens(&self, project_id: &str) -> Result<Option<i64>, BudgetStoreError> {
        Ok(self.remaining(project_id))
    }

    async fn record_usage(&self, project_id: &str, tokens: u64) -> Result<(), BudgetStoreError> {
        let delta = i64::try_from(tokens).unwrap_or(i64::MAX);
        let mut inner = self.inner.lock().expect("budget counters poisoned");
        let remaining = inner.remaining.entry(project_id.to_string()).or_insert(0);
        *remaining = remaining.saturating_sub(delta);
        let usage = inner.usage.entry(project_id.to_string()).or_insert(0);
        *usage = usage.saturating_add(tokens);
        Ok(())
    }
}

const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_millis(500);

/// Admission gate. `check` is read-only and bounded; every failure mode
/// (absent key, garbled value, store error, timeout) reads as "no budget".
#[derive(Clone)]
pub struct BudgetManager {
    store: Arc<dyn BudgetStore>,
    check_timeout: Duration,
}

impl BudgetManager {
    pub fn new(store: Arc<dyn BudgetStore>) -> Self {
        Self {
            store,
            check_timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }

    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    /// True iff the project can afford `estimated_tokens` right now. Two
    /// concurrent admissions may both pass on the same balance; accounting
    /// is unconditional and absorbs the overrun.
    pub async fn check(&self, project_id: &str, estimated_tokens: u64) -> bool {
        let lookup = tokio::time::timeout(
            self.check_timeout,
            self.store.remaining_tokens(project_id),
        )
        .await;

        let remaining = match lookup {
            Err(_) => {
                tracing::warn!(project_id, "budget check timed out; treating as exhausted");
                return false;
            }
            Ok(Err(err)) => {
                tracing::warn!(project_id, error = %err, "budget check failed; treating as exhausted");
                return false;
            }
            Ok(Ok(remaining)) => remaining.unwrap_or(0),
        };

        remaining >= i64::try_from(estimated_tokens).unwrap_or(i64::MAX)
    }
}
