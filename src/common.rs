use crate::error::GatewayError;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};

/// Body type of every response the gateway writes: either a small in-memory
/// body or the upstream body streamed through untouched.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub const INDEX_BODY: &str = "Service is running!";
pub const ROBOTS_BODY: &str = "User-agent: *\nDisallow: /";

pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Common response builder utilities to eliminate code duplication
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Creates a response with the given status, content type and body
    pub fn text(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<ProxyBody> {
        let mut response = Response::new(full(body));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        response
    }

    /// `/` and `/index.html`
    pub fn index() -> Response<ProxyBody> {
        Self::text(StatusCode::OK, "text/html", INDEX_BODY)
    }

    /// `/robots.txt`, disallowing every crawler
    pub fn robots() -> Response<ProxyBody> {
        Self::text(StatusCode::OK, "text/plain", ROBOTS_BODY)
    }

    /// Creates a not found response
    pub fn not_found() -> Response<ProxyBody> {
        Self::error(StatusCode::NOT_FOUND, "Not Found")
    }

    /// Creates a standard internal server error response
    pub fn internal_server_error() -> Response<ProxyBody> {
        Self::error(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
    }

    /// Creates a bad gateway response
    pub fn bad_gateway() -> Response<ProxyBody> {
        Self::error(StatusCode::BAD_GATEWAY, "Bad Gateway")
    }

    /// Creates a generic error response with custom status and message
    pub fn error(status: StatusCode, message: &str) -> Response<ProxyBody> {
        Self::text(status, "text/plain; charset=utf-8", format!("{}\n", message))
    }

    /// Maps a request-level error to the response the caller sees. Internal
    /// details stay in the log, not in the body.
    pub fn from_error(error: &GatewayError) -> Response<ProxyBody> {
        match error.status_code() {
            StatusCode::NOT_FOUND => Self::not_found(),
            StatusCode::BAD_GATEWAY => Self::bad_gateway(),
            StatusCode::GATEWAY_TIMEOUT => Self::error(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout"),
            _ => Self::internal_server_error(),
        }
    }
}
