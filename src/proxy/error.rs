//! Proxy error types and response handling.
//!
//! Error bodies always take the shape
//! `{"type":"error","error":{"type":"...","message":"..."}}` as described in
//! the external interface contract.

use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
};
use serde::Serialize;

/// Errors that can occur while handling a proxied request.
#[derive(Debug)]
pub enum ProxyError {
    /// Malformed client input: bad JSON, oversize body, unsupported path.
    ClientInput { status: StatusCode, message: String },
    /// Upstream returned an error, or a network error occurred talking to it.
    Upstream { status: StatusCode, message: String },
    /// Internal invariant violation (should never be reachable in practice).
    Internal(String),
}

impl ProxyError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::ClientInput {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::ClientInput {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            message: message.into(),
        }
    }

    /// Upstream network failure: per the failure model, always capped to 502.
    pub fn upstream_network(message: impl Into<String>) -> Self {
        Self::Upstream {
            status: StatusCode::BAD_GATEWAY,
            message: message.into(),
        }
    }

    pub fn upstream_status(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            message: message.into(),
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::ClientInput { .. } => "proxy_error",
            Self::Upstream { .. } => "api_error",
            Self::Internal(_) => "proxy_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::ClientInput { status, .. } => *status,
            Self::Upstream { status, .. } => *status,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> &str {
        match self {
            Self::ClientInput { message, .. } => message,
            Self::Upstream { message, .. } => message,
            Self::Internal(message) => message,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    #[serde(rename = "type")]
    body_type: &'static str,
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    #[serde(rename = "type")]
    error_type: &'static str,
    message: &'a str,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        let status = self.status();
        let error_type = self.error_type();
        let message = self.message().to_string();

        if matches!(self, Self::Internal(_)) {
            tracing::error!(%message, "internal invariant violation");
        } else {
            tracing::warn!(%status, %message, "proxy error");
        }

        let body = ErrorBody {
            body_type: "error",
            error: ErrorDetail {
                error_type,
                message: &message,
            },
        };

        let json = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());

        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Body::from(json))
            .unwrap_or_else(|_| Response::new(Body::from("internal error building error response")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_request_maps_to_400() {
        let err = ProxyError::bad_request("Invalid JSON");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error_type(), "proxy_error");
    }

    #[test]
    fn upstream_network_caps_to_502() {
        let err = ProxyError::upstream_network("connection reset");
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.error_type(), "api_error");
    }
}
