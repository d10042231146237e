use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::budget::BudgetStore;

const RECORD_ATTEMPTS: u32 = 3;
const RECORD_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One post-response usage update. Trace id rides along for log
/// correlation only.
#[derive(Clone, Debug)]
pub struct UsageRecord {
    pub project_id: String,
    pub total_tokens: u64,
    pub trace_id: Option<String>,
}

/// Fire-and-forget accounting. Records go through a bounded queue into a
/// fixed worker pool; a full queue drops the record with a warning. The
/// workers are detached tasks, so a caller disconnect never cancels an
/// update that is already owed.
#[derive(Clone)]
pub struct AccountingManager {
    tx: mpsc::Sender<UsageRecord>,
}

impl AccountingManager {
    pub fn spawn(store: Arc<dyn BudgetStore>, workers: usize, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<UsageRecord>(queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        for _ in 0..workers.max(1) {
            let store = store.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let record = { rx.lock().await.recv().await };
                    let Some(record) = record else {
                        break;
                    };
                    apply_with_retry(store.as_ref(), &record).await;
                }
            });
        }

        Self { tx }
    }

    /// Never blocks and never fails the caller. Zero-token records are
    /// dropped up front since they would not move either counter.
    pub fn record(&self, record: UsageRecord) {
        if record.total_tokens == 0 {
            tracing::debug!(
                project_id = %record.project_id,
                "skipping accounting record with zero tokens"
            );
            return;
        }
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                tracing::warn!(
                    project_id = %record.project_id,
                    tokens = record.total_tokens,
                    "accounting queue full; dropping usage record"
                );
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                tracing::warn!(
                    project_id = %record.project_id,
                    tokens = record.total_tokens,
                    "accounting workers gone; dropping usage record"
                );
            }
        }
    }
}

async fn apply_with_retry(store: &dyn BudgetStore, record: &UsageRecord) {
    for attempt in 1..=RECORD_ATTEMPTS {
        match store
            .record_usage(&record.project_id, record.total_tokens)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    project_id = %record.project_id,
                    tokens = record.total_tokens,
                    trace_id = record.trace_id.as_deref(),
                    "recorded usage"
                );
                return;
            }
            Err(err) if attempt < RECORD_ATTEMPTS => {
                tracing::debug!(
                    project_id = %record.project_id,
                    attempt,
                    error = %err,
                    "accounting write failed; retrying"
                );
                tokio::time::sleep(RECORD_RETRY_DELAY).await;
            }
            Err(err) => {
                tracing::warn!(
                    project_id = %record.project_id,
                    tokens = record.total_tokens,
                    trace_id = record.trace_id.as_deref(),
                    error = %err,
                    "dropping usage record after {RECORD_ATTEMPTS} attempts"
                );
            }
        }
    }
}
