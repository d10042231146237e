use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Request-scoped failure taxonomy. Each variant renders as a fixed HTTP
/// status with a `{"detail": ...}` body. Variants carrying an inner string
/// keep it for logs; the caller-visible detail is the display string.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invalid Gateway Access Token")]
    AuthInvalid,
    #[error("Missing project identifier")]
    ProjectMissing,
    #[error("{0}")]
    SchemaInvalid(String),
    #[error("Unsupported model architecture")]
    ModelUnknown,
    #[error("Budget exceeded for Project ID {project_id}")]
    BudgetExceeded { project_id: String },
    #[error("Security subsystem unavailable")]
    SecretsUnavailable,
    #[error("Upstream provider rate limit exceeded")]
    UpstreamRateLimit,
    #[error("Upstream provider rejected request: {0}")]
    UpstreamRejected(String),
    #[error("Upstream authentication failed")]
    UpstreamAuth,
    /// Upstream 5xx. Retryable until attempts or the retry window run out.
    #[error("Upstream provider error: {0}")]
    UpstreamInternal(String),
    /// Upstream responded with a status the gateway has no mapping for.
    #[error("Upstream provider error: {0}")]
    UpstreamError(String),
    /// Connect/timeout failure before or during the upstream exchange.
    #[error("Upstream provider unreachable")]
    UpstreamUnreachable(String),
    #[error("Internal gateway error")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::AuthInvalid => StatusCode::UNAUTHORIZED,
            Self::ProjectMissing | Self::SchemaInvalid(_) | Self::ModelUnknown => {
                StatusCode::BAD_REQUEST
            }
            Self::BudgetExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::SecretsUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamRateLimit => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamRejected(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamAuth | Self::UpstreamInternal(_) | Self::UpstreamError(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::UpstreamUnreachable(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Transient upstream outcomes worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamRateLimit | Self::UpstreamInternal(_) | Self::UpstreamUnreachable(_)
        )
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorBody {
    pub detail: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match &self {
            GatewayError::Internal(detail) => {
                tracing::error!(%detail, "request failed with internal error");
            }
            GatewayError::UpstreamUnreachable(detail) => {
                tracing::warn!(%detail, "upstream unreachable");
            }
            GatewayError::UpstreamAuth => {
                tracing::error!("upstream rejected the injected credential");
            }
            other => {
                tracing::debug!(error = %other, "request rejected");
            }
        }
        let body = ErrorBody {
            detail: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert_eq!(GatewayError::AuthInvalid.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            GatewayError::ProjectMissing.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::SchemaInvalid("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(GatewayError::ModelUnknown.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            GatewayError::BudgetExceeded {
                project_id: "p".into()
            }
            .status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            GatewayError::SecretsUnavailable.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::UpstreamRateLimit.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::UpstreamInternal("boom".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::UpstreamUnreachable("connect refused".into()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::Internal("oops".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn retry_predicate_covers_transient_kinds_only() {
        assert!(GatewayError::UpstreamRateLimit.is_retryable());
        assert!(GatewayError::UpstreamInternal("500".into()).is_retryable());
        assert!(GatewayError::UpstreamUnreachable("connect".into()).is_retryable());

        assert!(!GatewayError::AuthInvalid.is_retryable());
        assert!(!GatewayError::UpstreamRejected("too long".into()).is_retryable());
        assert!(!GatewayError::UpstreamAuth.is_retryable());
        assert!(!GatewayError::UpstreamError("418".into()).is_retryable());
    }

    #[test]
    fn internal_detail_is_not_leaked_in_display() {
        let err = GatewayError::Internal("redis connection pool exhausted".into());
        assert_eq!(err.to_string(), "Internal gateway error");
    }

    #[test]
    fn unreachable_detail_is_not_leaked_in_display() {
        let err = GatewayError::UpstreamUnreachable("tcp connect error".into());
        assert_eq!(err.to_string(), "Upstream provider unreachable");
    }
}
