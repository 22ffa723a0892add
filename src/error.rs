use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::relay::RelayError;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Too many requests")]
    RateLimited { retry_after_secs: u64 },
    #[error("Service not found")]
    ServiceNotFound,
    #[error("Internal service communication error: {0}")]
    Relay(#[from] RelayError),
    #[error("Request body too large")]
    PayloadTooLarge,
    #[error("Invalid request body")]
    InvalidBody(String),
    #[error("Rate limiter unavailable")]
    LimiterUnavailable(String),
    #[error("Internal gateway error")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ServiceNotFound => StatusCode::NOT_FOUND,
            Self::Relay(_) => StatusCode::BAD_GATEWAY,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidBody(_) => StatusCode::BAD_REQUEST,
            Self::LimiterUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Text for logs. Unlike `Display`, this keeps the detail of internal faults.
    pub fn detail(&self) -> String {
        match self {
            Self::InvalidBody(msg) | Self::LimiterUnavailable(msg) | Self::Internal(msg) => {
                msg.clone()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, Json(ErrorBody {
            error: self.to_string(),
        }))
            .into_response();

        if let Self::RateLimited { retry_after_secs } = self
            && let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, v);
        }

        response
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        Self::LimiterUnavailable(err.to_string())
    }
}
