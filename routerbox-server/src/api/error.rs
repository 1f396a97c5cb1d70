// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::llm::ProviderError;
use crate::rate_limit::RateLimitError;
use crate::router::RouterError;
use crate::tool_runtime::ToolError;
use axum::{
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use routerbox_core::{ErrorBody, RouterboxError};
use thiserror::Error;
use tracing::{debug, error};

pub const RATE_LIMIT_CODE: &str = "rate_limit_exceeded";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<RouterboxError> for ApiError {
    fn from(err: RouterboxError) -> Self {
        Self::Router(RouterError::Request(err))
    }
}

/// Status, error type, code and optional retry hint for one error
struct Classified {
    status: StatusCode,
    error_type: &'static str,
    code: Option<&'static str>,
    retry_after_secs: Option<u64>,
}

impl Classified {
    fn new(status: StatusCode, error_type: &'static str, code: Option<&'static str>) -> Self {
        Self {
            status,
            error_type,
            code,
            retry_after_secs: None,
        }
    }

    fn rate_limited(retry_after_secs: u64) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            error_type: "rate_limit_error",
            code: Some(RATE_LIMIT_CODE),
            retry_after_secs: Some(retry_after_secs.max(1)),
        }
    }
}

fn classify_request(err: &RouterboxError) -> Classified {
    let status = match err {
        RouterboxError::Validation(_) | RouterboxError::Json(_) => StatusCode::BAD_REQUEST,
        RouterboxError::ModelNotFound(_) | RouterboxError::ToolNotFound(_) => StatusCode::NOT_FOUND,
        RouterboxError::ModelDisabled(_) => StatusCode::FORBIDDEN,
        _ => return Classified::new(StatusCode::INTERNAL_SERVER_ERROR, "server_error", Some(err.code())),
    };
    Classified::new(status, "invalid_request_error", Some(err.code()))
}

fn classify_provider(err: &ProviderError) -> Classified {
    match err {
        ProviderError::Api { status, .. } => {
            let status = StatusCode::from_u16(*status)
                .ok()
                .filter(|s| s.is_client_error() || s.is_server_error())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            Classified::new(status, "upstream_error", None)
        }
        ProviderError::NotConfigured(_) => {
            Classified::new(StatusCode::SERVICE_UNAVAILABLE, "server_error", Some("provider_not_configured"))
        }
        ProviderError::Local(_) => {
            Classified::new(StatusCode::BAD_GATEWAY, "local_inference_error", Some("local_inference_failed"))
        }
        ProviderError::Http(e) if e.is_timeout() => {
            Classified::new(StatusCode::GATEWAY_TIMEOUT, "upstream_error", Some("upstream_timeout"))
        }
        ProviderError::Http(_) | ProviderError::Decode(_) | ProviderError::Stream(_) => {
            Classified::new(StatusCode::BAD_GATEWAY, "upstream_error", None)
        }
    }
}

fn classify_tool(err: &ToolError) -> Classified {
    let status = match err {
        ToolError::ExecutionNotFound(_) | ToolError::NotFound(_) => StatusCode::NOT_FOUND,
        ToolError::InvalidState { .. } => StatusCode::CONFLICT,
        ToolError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
        ToolError::ConcurrencyExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let error_type = if status.is_server_error() {
        "server_error"
    } else {
        "invalid_request_error"
    };
    Classified::new(status, error_type, None)
}

impl ApiError {
    fn classify(&self) -> Classified {
        match self {
            ApiError::Router(RouterError::Request(e)) => classify_request(e),
            ApiError::Router(RouterError::RateLimited { retry_after_secs }) => {
                Classified::rate_limited(*retry_after_secs)
            }
            ApiError::Router(RouterError::Queue(RateLimitError::Shutdown)) => {
                Classified::new(StatusCode::SERVICE_UNAVAILABLE, "server_error", Some("shutting_down"))
            }
            ApiError::Router(RouterError::Queue(e)) => Classified::rate_limited(e.retry_after_secs()),
            ApiError::Router(RouterError::Provider(e)) => classify_provider(e),
            ApiError::Tool(e) => classify_tool(e),
            ApiError::BadRequest(_) => {
                Classified::new(StatusCode::BAD_REQUEST, "invalid_request_error", Some("invalid_request"))
            }
            ApiError::NotFound(_) => Classified::new(StatusCode::NOT_FOUND, "invalid_request_error", None),
            ApiError::Timeout(_) => Classified::new(StatusCode::GATEWAY_TIMEOUT, "timeout_error", Some("timeout")),
            ApiError::Internal(_) => Classified::new(StatusCode::INTERNAL_SERVER_ERROR, "server_error", None),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.classify().status
    }
}

impl ApiError {
    /// Log the failure and split it into status, body and retry hint
    pub(crate) fn into_parts(self) -> (StatusCode, ErrorBody, Option<u64>) {
        let classified = self.classify();
        let message = self.to_string();
        if classified.status.is_server_error() {
            error!(status = %classified.status, error = %message, "Request failed");
        } else {
            debug!(status = %classified.status, error = %message, "Request rejected");
        }
        let body = ErrorBody::new(message, classified.error_type, classified.code);
        (classified.status, body, classified.retry_after_secs)
    }
}

pub(crate) fn set_retry_after(headers: &mut HeaderMap, retry_after_secs: Option<u64>) {
    if let Some(secs) = retry_after_secs {
        headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body, retry_after_secs) = self.into_parts();
        let mut response = (status, Json(body)).into_response();
        set_retry_after(response.headers_mut(), retry_after_secs);
        response
    }
}
