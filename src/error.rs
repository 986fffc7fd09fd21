//! Error replies the dispatcher sends to clients
//!
//! Failures surface as a small JSON body plus an `X-Proxy-Error` header so
//! callers and load-test tooling can tell a balancer-side rejection from a
//! backend's own error page.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes the dispatcher can return to clients
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// No healthy backend was available to take the request
    NoBackendAvailable,
    /// The selected backend failed while proxying the request
    UpstreamFailed,
}

impl GatewayErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::NoBackendAvailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::UpstreamFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::NoBackendAvailable => "NO_BACKEND_AVAILABLE",
            GatewayErrorCode::UpstreamFailed => "UPSTREAM_FAILED",
        }
    }
}

/// Wire shape of the JSON body.
#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    code: GatewayErrorCode,
    message: &'a str,
    status: u16,
}

impl<'a> ErrorBody<'a> {
    fn render(code: GatewayErrorCode, message: &'a str) -> String {
        let body = ErrorBody {
            code,
            message,
            status: code.status_code().as_u16(),
        };
        // Serializing a struct of copyable fields and a str cannot fail;
        // fall back to the bare code if it somehow does.
        serde_json::to_string(&body)
            .unwrap_or_else(|_| format!(r#"{{"code":"{}"}}"#, code.as_header_value()))
    }
}

/// Build the full error reply for one dispatch failure.
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl AsRef<str>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let json = ErrorBody::render(code, message.as_ref());
    let body = Full::new(Bytes::from(json))
        .map_err(|never| match never {})
        .boxed();

    match Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(body)
    {
        Ok(response) => response,
        // Unreachable: status and headers above are statically valid.
        Err(_) => {
            let mut response = Response::new(
                Full::new(Bytes::new()).map_err(|never| match never {}).boxed(),
            );
            *response.status_mut() = code.status_code();
            response
        }
    }
}
