use axum::body::Body;
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;
use tracing::Instrument as _;

use crate::accounting::UsageRecord;
use crate::server::AppState;
use crate::stream::StreamFinalizer;
use crate::upstream::UpstreamClient;
use crate::{schema, stream, usage, GatewayError, Result};

pub(crate) const PROJECT_ID_HEADER: &str = "x-coreason-project-id";
pub(crate) const TRACE_ID_HEADER: &str = "x-coreason-trace-id";

/// Entry point. Everything the request logs runs inside one span carrying
/// the trace id, so mid-request events (retries, budget warnings,
/// accounting hand-off) stay correlated.
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let span = tracing::info_span!(
        "gateway.chat_completions",
        trace_id = tracing::field::Empty,
        project_id = tracing::field::Empty,
        model = tracing::field::Empty,
    );
    handle(state, headers, body).instrument(span).await
}

/// The request pipeline: Auth → Project → Parse → Estimate → Admission →
/// Route → Credential → Execute → Respond/Account. Steps run in this order
/// and short-circuit; no outbound I/O happens before admission passes.
/// The provider credential is confined to this frame — it is moved into
/// the per-request upstream client and dropped before the handler returns.
async fn handle(state: AppState, headers: HeaderMap, body: Bytes) -> Result<Response> {
    let trace_id = extract_trace_id(&headers);
    if let Some(trace_id) = trace_id.as_deref() {
        tracing::Span::current().record("trace_id", tracing::field::display(trace_id));
    }

    authorize(&headers, &state.gateway_token)?;
    let project_id = require_project_id(&headers)?;
    tracing::Span::current().record("project_id", tracing::field::display(&project_id));

    let request = schema::parse_request(&body)?;
    tracing::Span::current().record("model", tracing::field::display(&request.model));
    let estimated_tokens = schema::estimate_tokens(&request.messages);

    tracing::debug!(
        stream = request.is_streaming(),
        estimated_tokens,
        "admitting chat completion request"
    );

    if !state.budget.check(&project_id, estimated_tokens).await {
        return Err(GatewayError::BudgetExceeded { project_id });
    }

    let descriptor = state
        .model_router
        .resolve(&request.model)
        .cloned()
        .ok_or(GatewayError::ModelUnknown)?;

    let credential = state
        .secrets
        .fetch(&descriptor.secret_path)
        .await
        .map_err(|err| {
            tracing::error!(
                provider = %descriptor.provider_id,
                error = %err,
                "credential fetch failed"
            );
            GatewayError::SecretsUnavailable
        })?;

    let upstream = UpstreamClient::new(&descriptor, credential, state.upstream_timeout)?;
    let response = state.retry.run(|| upstream.execute(body.clone())).await?;

    let http_status = response.status();
    let content_type = response.headers().get(CONTENT_TYPE).cloned();

    if request.is_streaming() {
        let upstream_stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed();
        // The response body owns its connection; release the client (and
        // with it the credential) before the stream is handed back.
        drop(upstream);

        let finalizer = StreamFinalizer::new(
            state.accounting.clone(),
            project_id,
            estimated_tokens,
            trace_id,
        );
        let body = stream::forward(upstream_stream, finalizer);
        return streaming_response(http_status, content_type, body);
    }

    let response_bytes = response.bytes().await.map_err(|err| {
        GatewayError::UpstreamError(format!("failed reading upstream body: {err}"))
    })?;
    drop(upstream);

    let observed = usage::total_tokens_from_body(&response_bytes);
    if observed.is_none() {
        tracing::debug!(
            fallback = estimated_tokens,
            "upstream response lacks usage; accounting the admission estimate"
        );
    }
    state.accounting.record(UsageRecord {
        project_id,
        total_tokens: observed.unwrap_or(estimated_tokens),
        trace_id,
    });

    buffered_response(http_status, content_type, response_bytes)
}

fn authorize(headers: &HeaderMap, expected: &SecretString) -> Result<()> {
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or(GatewayError::AuthInvalid)?;
    let (scheme, token) = header.split_once(' ').ok_or(GatewayError::AuthInvalid)?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(GatewayError::AuthInvalid);
    }
    if !constant_time_eq(token, expected.expose_secret()) {
        return Err(GatewayError::AuthInvalid);
    }
    Ok(())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn require_project_id(headers: &HeaderMap) -> Result<String> {
    headers
        .get(PROJECT_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or(GatewayError::ProjectMissing)
}

/// A malformed trace id is logged and ignored; it never fails a request.
fn extract_trace_id(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(TRACE_ID_HEADER)?.to_str().ok()?;
    match uuid::Uuid::parse_str(raw.trim()) {
        Ok(trace_id) => Some(trace_id.to_string()),
        Err(_) => {
            tracing::warn!(raw, "ignoring malformed trace id header");
            None
        }
    }
}

fn buffered_response(
    status: reqwest::StatusCode,
    content_type: Option<HeaderValue>,
    body: Bytes,
) -> Result<Response> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    let content_type =
        content_type.unwrap_or_else(|| HeaderValue::from_static("application/json"));
    response.headers_mut().insert(CONTENT_TYPE, content_type);
    Ok(response)
}

fn streaming_response(
    status: reqwest::StatusCode,
    content_type: Option<HeaderValue>,
    body: Body,
) -> Result<Response> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    let content_type =
        content_type.unwrap_or_else(|| HeaderValue::from_static("text/event-stream"));
    response.headers_mut().insert(CONTENT_TYPE, content_type);
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value.parse().unwrap());
        headers
    }

    #[test]
    fn authorize_accepts_exact_bearer_token() {
        let expected = SecretString::from("gate_OK".to_string());
        assert!(authorize(&headers_with_auth("Bearer gate_OK"), &expected).is_ok());
        assert!(authorize(&headers_with_auth("bearer gate_OK"), &expected).is_ok());
    }

    #[test]
    fn authorize_rejects_bad_tokens_and_schemes() {
        let expected = SecretString::from("gate_OK".to_string());
        assert!(authorize(&HeaderMap::new(), &expected).is_err());
        assert!(authorize(&headers_with_auth("Bearer wrong"), &expected).is_err());
        assert!(authorize(&headers_with_auth("Basic gate_OK"), &expected).is_err());
        assert!(authorize(&headers_with_auth("gate_OK"), &expected).is_err());
        assert!(authorize(&headers_with_auth("Bearer "), &expected).is_err());
        assert!(authorize(&headers_with_auth("Bearer gate_OK extra"), &expected).is_err());
    }

    #[test]
    fn project_id_must_be_present_and_non_empty() {
        let mut headers = HeaderMap::new();
        assert!(require_project_id(&headers).is_err());

        headers.insert(PROJECT_ID_HEADER, "  ".parse().unwrap());
        assert!(require_project_id(&headers).is_err());

        headers.insert(PROJECT_ID_HEADER, "proj_A".parse().unwrap());
        assert_eq!(require_project_id(&headers).unwrap(), "proj_A");
    }

    #[test]
    fn malformed_trace_id_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(TRACE_ID_HEADER, "not-a-uuid".parse().unwrap());
        assert_eq!(extract_trace_id(&headers), None);

        headers.insert(
            TRACE_ID_HEADER,
            "6f1c0f77-2b2f-4f10-a572-7d320f0e0f0e".parse().unwrap(),
        );
        assert_eq!(
            extract_trace_id(&headers).as_deref(),
            Some("6f1c0f77-2b2f-4f10-a572-7d320f0e0f0e")
        );
    }
}
