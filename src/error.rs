//! Error handling and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No access token could be obtained for the upstream
    TokenUnavailable,
    /// Failed to reach the upstream registry
    ConnectionFailed,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::TokenUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::TokenUnavailable => "TOKEN_UNAVAILABLE",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    let mut response = Response::new(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed());
    *response.status_mut() = code.status_code();
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    headers.insert(
        "x-proxy-error",
        hyper::header::HeaderValue::from_static(code.as_header_value()),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::TokenUnavailable.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ProxyErrorCode::ConnectionFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_error_code_header_values() {
        assert_eq!(ProxyErrorCode::TokenUnavailable.as_header_value(), "TOKEN_UNAVAILABLE");
        assert_eq!(ProxyErrorCode::ConnectionFailed.as_header_value(), "CONNECTION_FAILED");
        assert_eq!(
            serde_json::to_string(&ProxyErrorCode::ConnectionFailed).unwrap(),
            "\"CONNECTION_FAILED\""
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::TokenUnavailable, "Unable to fetch token");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"TOKEN_UNAVAILABLE\""));
        assert!(json.contains("\"message\":\"Unable to fetch token\""));
        assert!(json.contains("\"status\":500"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to reach registry");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "CONNECTION_FAILED"
        );
    }
}
