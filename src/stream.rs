use axum::body::Body;
use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::Value;

use crate::accounting::{AccountingManager, UsageRecord};
use crate::usage::{parse_usage, ObservedUsage};

const EVENT_DATA_MAX_BYTES: usize = 256 * 1024;
const LINE_MAX_BYTES: usize = 64 * 1024;

pub(crate) type UpstreamByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Watches the forwarded SSE bytes for a usage object. The payload itself
/// is never rewritten. Chunks are cut into lines as they arrive and fed to
/// a small per-event accumulator: `data:` lines collect into one payload,
/// a blank line closes the event, and the most recent usage wins
/// (providers report it in the terminal chunk, some mid-stream).
#[derive(Default)]
struct UsageTracker {
    pending_line: BytesMut,
    event_data: String,
    discarding: bool,
    observed: Option<ObservedUsage>,
}

impl UsageTracker {
    fn ingest(&mut self, chunk: &Bytes) {
        self.pending_line.extend_from_slice(chunk.as_ref());
        while let Some(pos) = self.pending_line.iter().position(|b| *b == b'\n') {
            let line = self.pending_line.split_to(pos + 1);
            self.consume_line(&line[..line.len() - 1]);
        }
        // A line this long cannot carry usage we would trust; skip the
        // rest of the event it belongs to and keep memory bounded.
        if self.pending_line.len() > LINE_MAX_BYTES {
            self.pending_line.clear();
            self.event_data.clear();
            self.discarding = true;
        }
    }

    fn consume_line(&mut self, line: &[u8]) {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            self.flush_event();
            return;
        }
        if self.discarding {
            return;
        }
        let Some(payload) = line.strip_prefix(b"data:") else {
            // event:, id:, retry:, and comment lines are irrelevant here.
            return;
        };
        let Ok(payload) = std::str::from_utf8(payload) else {
            self.event_data.clear();
            self.discarding = true;
            return;
        };
        let payload = payload.trim();
        if payload.is_empty() {
            return;
        }
        if self.event_data.len() + payload.len() > EVENT_DATA_MAX_BYTES {
            self.event_data.clear();
            self.discarding = true;
            return;
        }
        if !self.event_data.is_empty() {
            self.event_data.push('\n');
        }
        self.event_data.push_str(payload);
    }

    fn flush_event(&mut self) {
        let data = std::mem::take(&mut self.event_data);
        self.discarding = false;
        if data.is_empty() || data == "[DONE]" {
            return;
        }
        if data.starts_with('{') {
            if let Some(found) = usage_from_event(&data) {
                self.observed = Some(found);
            }
        }
    }

    fn observed_total(&self) -> Option<u64> {
        self.observed.and_then(|usage| usage.total_tokens)
    }
}

fn usage_from_event(data: &str) -> Option<ObservedUsage> {
    let value: Value = serde_json::from_str(data).ok()?;
    let usage = value.get("usage")?;
    if usage.is_null() {
        return None;
    }
    let parsed = parse_usage(usage);
    parsed.total_tokens.map(|_| parsed)
}

/// Accounting hand-off armed exactly once per stream, on every exit path:
/// clean close, mid-stream error, or the caller walking away (the stream
/// state is dropped and the `Drop` impl fires).
pub struct StreamFinalizer {
    accounting: AccountingManager,
    project_id: String,
    fallback_tokens: u64,
    trace_id: Option<String>,
}

impl StreamFinalizer {
    pub fn new(
        accounting: AccountingManager,
        project_id: String,
        fallback_tokens: u64,
        trace_id: Option<String>,
    ) -> Self {
        Self {
            accounting,
            project_id,
            fallback_tokens,
            trace_id,
        }
    }

    fn finish(self, observed_total: Option<u64>) {
        let total_tokens = match observed_total {
            Some(total) => total,
            None => {
                tracing::debug!(
                    project_id = %self.project_id,
                    fallback = self.fallback_tokens,
                    "stream closed without usage; accounting the admission estimate"
                );
                self.fallback_tokens
            }
        };
        self.accounting.record(UsageRecord {
            project_id: self.project_id,
            total_tokens,
            trace_id: self.trace_id,
        });
    }
}

struct ForwardState {
    upstream: UpstreamByteStream,
    tracker: UsageTracker,
    finalizer: Option<StreamFinalizer>,
}

impl ForwardState {
    fn finalize(&mut self) {
        if let Some(finalizer) = self.finalizer.take() {
            finalizer.finish(self.tracker.observed_total());
        }
    }
}

impl Drop for ForwardState {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// Verbatim pass-through of the upstream SSE byte stream into a response
/// body, scheduling accounting when the stream ends however it ends.
pub fn forward(upstream: UpstreamByteStream, finalizer: StreamFinalizer) -> Body {
    let state = ForwardState {
        upstream,
        tracker: UsageTracker::default(),
        finalizer: Some(finalizer),
    };

    Body::from_stream(futures_util::stream::try_unfold(
        state,
        |mut state| async move {
            match state.upstream.next().await {
                Some(Ok(chunk)) => {
                    state.tracker.ingest(&chunk);
                    Ok(Some((chunk, state)))
                }
                Some(Err(err)) => {
                    state.finalize();
                    Err(err)
                }
                None => {
                    state.finalize();
                    Ok(None)
                }
            }
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::stream;
    use http_body_util::BodyExt;

    use crate::budget::MemoryBudgetStore;

    #[test]
    fn tracker_reads_usage_from_terminal_chunk() {
        let mut tracker = UsageTracker::default();
        tracker.ingest(&Bytes::from_static(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
        ));
        assert_eq!(tracker.observed_total(), None);

        tracker.ingest(&Bytes::from_static(
            b"data: {\"choices\":[],\"usage\":{\"total_tokens\":20}}\n\ndata: [DONE]\n\n",
        ));
        assert_eq!(tracker.observed_total(), Some(20));
    }

    #[test]
    fn tracker_handles_events_split_across_chunks() {
        let mut tracker = UsageTracker::default();
        tracker.ingest(&Bytes::from_static(b"data: {\"usage\":{\"tot"));
        tracker.ingest(&Bytes::from_static(b"al_tokens\":9}}\n"));
        assert_eq!(tracker.observed_total(), None);
        tracker.ingest(&Bytes::from_static(b"\n"));
        assert_eq!(tracker.observed_total(), Some(9));
    }

    #[test]
    fn tracker_accepts_crlf_delimiters_and_multi_line_data() {
        let mut tracker = UsageTracker::default();
        tracker.ingest(&Bytes::from_static(
            b"event: done\r\ndata: {\"usage\":\r\ndata: {\"total_tokens\":5}}\r\n\r\n",
        ));
        assert_eq!(tracker.observed_total(), Some(5));
    }

    #[test]
    fn later_usage_wins() {
        let mut tracker = UsageTracker::default();
        tracker.ingest(&Bytes::from_static(
            b"data: {\"usage\":{\"total_tokens\":3}}\n\ndata: {\"usage\":{\"total_tokens\":11}}\n\n",
        ));
        assert_eq!(tracker.observed_total(), Some(11));
    }

    #[test]
    fn null_usage_is_ignored() {
        let mut tracker = UsageTracker::default();
        tracker.ingest(&Bytes::from_static(b"data: {\"usage\":null}\n\n"));
        assert_eq!(tracker.observed_total(), None);
    }

    fn finalizer_for(store: &MemoryBudgetStore, fallback: u64) -> StreamFinalizer {
        let accounting = AccountingManager::spawn(Arc::new(store.clone()), 1, 16);
        StreamFinalizer::new(accounting, "proj_C".to_string(), fallback, None)
    }

    async fn wait_for_usage(store: &MemoryBudgetStore, expected: u64) {
        for _ in 0..200 {
            if store.usage_total("proj_C") == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "usage never reached {expected}, got {}",
            store.usage_total("proj_C")
        );
    }

    #[tokio::test]
    async fn forwards_bytes_verbatim_and_accounts_observed_usage() {
        let store = MemoryBudgetStore::default();
        store.set_remaining("proj_C", 100);

        let chunks: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: {\"id\":\"a\"}\n\n")),
            Ok(Bytes::from_static(
                b"data: {\"id\":\"c\",\"usage\":{\"total_tokens\":20}}\n\n",
            )),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ];
        let expected: Vec<u8> = chunks
            .iter()
            .map(|chunk| chunk.as_ref().unwrap().to_vec())
            .collect::<Vec<_>>()
            .concat();

        let body = forward(
            stream::iter(chunks).boxed(),
            finalizer_for(&store, 7),
        );
        let collected = body.collect().await.expect("body").to_bytes();
        assert_eq!(collected.as_ref(), expected.as_slice());

        wait_for_usage(&store, 20).await;
        assert_eq!(store.remaining("proj_C"), Some(80));
    }

    #[tokio::test]
    async fn broken_stream_accounts_best_effort_fallback() {
        let store = MemoryBudgetStore::default();
        store.set_remaining("proj_C", 100);

        let chunks: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: {\"id\":\"a\"}\n\n")),
            Err(std::io::Error::other("connection reset")),
        ];
        let body = forward(stream::iter(chunks).boxed(), finalizer_for(&store, 7));
        assert!(body.collect().await.is_err());

        wait_for_usage(&store, 7).await;
    }

    #[tokio::test]
    async fn dropped_stream_still_accounts() {
        let store = MemoryBudgetStore::default();
        store.set_remaining("proj_C", 100);

        let chunks: Vec<std::io::Result<Bytes>> =
            vec![Ok(Bytes::from_static(b"data: {\"id\":\"a\"}\n\n"))];
        let body = forward(stream::iter(chunks).boxed(), finalizer_for(&store, 7));
        // Caller walks away without reading a single frame.
        drop(body);

        wait_for_usage(&store, 7).await;
    }
}
