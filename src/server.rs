use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::SecretString;
use serde::Serialize;

use crate::accounting::AccountingManager;
use crate::budget::{BudgetManager, BudgetStore};
use crate::config::Settings;
use crate::pipeline;
use crate::retry::RetryPolicy;
use crate::routing::ProviderRouter;
use crate::secrets::SecretStore;

const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_ACCOUNTING_WORKERS: usize = 2;
const DEFAULT_ACCOUNTING_QUEUE_CAPACITY: usize = 1024;

/// Process-wide services handed to the pipeline explicitly: the budget
/// store and secret store are shared and long-lived, everything the
/// pipeline creates on top of them is per-request.
#[derive(Clone)]
pub struct AppState {
    pub(crate) gateway_token: SecretString,
    pub(crate) model_router: Arc<ProviderRouter>,
    pub(crate) budget: BudgetManager,
    pub(crate) accounting: AccountingManager,
    pub(crate) secrets: Arc<dyn SecretStore>,
    pub(crate) retry: RetryPolicy,
    pub(crate) upstream_timeout: Duration,
}

impl AppState {
    pub fn new(
        gateway_token: SecretString,
        budget_store: Arc<dyn BudgetStore>,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        Self {
            gateway_token,
            model_router: Arc::new(ProviderRouter::with_defaults(None, None)),
            budget: BudgetManager::new(budget_store.clone()),
            accounting: AccountingManager::spawn(
                budget_store,
                DEFAULT_ACCOUNTING_WORKERS,
                DEFAULT_ACCOUNTING_QUEUE_CAPACITY,
            ),
            secrets,
            retry: RetryPolicy::default(),
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
        }
    }

    pub fn from_settings(
        settings: &Settings,
        budget_store: Arc<dyn BudgetStore>,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        Self {
            gateway_token: settings.gateway_access_token.clone(),
            model_router: Arc::new(ProviderRouter::with_defaults(
                settings.openai_base_url.as_deref(),
                settings.anthropic_base_url.as_deref(),
            )),
            budget: BudgetManager::new(budget_store.clone())
                .with_check_timeout(settings.budget_check_timeout),
            accounting: AccountingManager::spawn(
                budget_store,
                settings.accounting_workers,
                settings.accounting_queue_capacity,
            ),
            secrets,
            retry: RetryPolicy::from_settings(&settings.retry),
            upstream_timeout: settings.upstream_timeout,
        }
    }

    pub fn with_model_router(mut self, model_router: ProviderRouter) -> Self {
        self.model_router = Arc::new(model_router);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_budget_check_timeout(mut self, timeout: Duration) -> Self {
        self.budget = self.budget.with_check_timeout(timeout);
        self
    }

    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Startup already proved the KV store reachable and the secret store
/// authenticated; health stays a liveness probe with no dependency checks.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(pipeline::chat_completions))
        .with_state(state)
}
