//! Relay-level failure kinds surfaced to HTTP callers.
//!
//! Plain enum, no `thiserror`: each variant already knows its status code and
//! wire error string, so a derive macro would add indirection rather than
//! remove it.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug)]
pub enum RelayError {
    InvalidSubdomain,
    WebsocketRequired,
    BodyTooLarge,
    RateLimited,
    AgentOffline,
    GatewayTimeout,
    TunnelClosed,
    TunnelSendFailed,
}

impl RelayError {
    fn status(&self) -> StatusCode {
        match self {
            RelayError::InvalidSubdomain | RelayError::WebsocketRequired => StatusCode::BAD_REQUEST,
            RelayError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            RelayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            RelayError::AgentOffline | RelayError::TunnelClosed | RelayError::TunnelSendFailed => {
                StatusCode::BAD_GATEWAY
            }
            RelayError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            RelayError::InvalidSubdomain => "invalid_subdomain",
            RelayError::WebsocketRequired => "websocket_required",
            RelayError::BodyTooLarge => "body_too_large",
            RelayError::RateLimited => "rate_limited",
            RelayError::AgentOffline => "agent_offline",
            RelayError::GatewayTimeout => "gateway_timeout",
            RelayError::TunnelClosed => "tunnel_closed",
            RelayError::TunnelSendFailed => "tunnel_send_failed",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody { error: self.code() };
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_offline_is_bad_gateway() {
        assert_eq!(RelayError::AgentOffline.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(RelayError::AgentOffline.code(), "agent_offline");
    }

    #[test]
    fn body_too_large_is_413() {
        assert_eq!(RelayError::BodyTooLarge.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
