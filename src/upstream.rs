use std::time::Duration;

use bytes::Bytes;

use crate::routing::ProviderDescriptor;
use crate::secrets::EphemeralCredential;
use crate::{GatewayError, Result};

const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// HTTP client bound to one provider credential for exactly one request.
/// Constructed inside the pipeline frame and dropped there; never pooled,
/// never reused.
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
    credential: EphemeralCredential,
}

impl UpstreamClient {
    pub fn new(
        descriptor: &ProviderDescriptor,
        credential: EphemeralCredential,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| GatewayError::Internal(format!("upstream client build: {err}")))?;
        Ok(Self {
            client,
            base_url: descriptor.base_url.trim_end_matches('/').to_string(),
            credential,
        })
    }

    /// POST the caller's body to `{base_url}/chat/completions` and classify
    /// the outcome. Success means a 2xx whose body has not been touched
    /// yet, so both buffered and streaming reads stay available.
    pub async fn execute(&self, body: Bytes) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(url)
            .bearer_auth(self.credential.api_key())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        classify_response(response).await
    }
}

fn classify_transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        GatewayError::UpstreamUnreachable(err.to_string())
    } else {
        GatewayError::UpstreamError(err.to_string())
    }
}

async fn classify_response(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status.as_u16() {
        429 => Err(GatewayError::UpstreamRateLimit),
        400 => Err(GatewayError::UpstreamRejected(
            error_body_text(response).await,
        )),
        401 | 403 => Err(GatewayError::UpstreamAuth),
        500..=599 => Err(GatewayError::UpstreamInternal(
            error_body_text(response).await,
        )),
        _ => Err(GatewayError::UpstreamError(format!(
            "unexpected status {status}: {}",
            error_body_text(response).await
        ))),
    }
}

async fn error_body_text(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.bytes().await.unwrap_or_default();
    let truncated = &body[..body.len().min(MAX_ERROR_BODY_BYTES)];
    let text = String::from_utf8_lossy(truncated).trim().to_string();
    if text.is_empty() {
        format!("upstream returned {status}")
    } else {
        text
    }
}
