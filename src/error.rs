use hyper::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No route for path: {0}")]
    RouteNotFound(String),

    #[error("Invalid target URL {url}: {reason}")]
    TargetUrl { url: String, reason: String },

    #[error("Transport construction failed: {0}")]
    TransportConstruction(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Upstream timed out after {0}s")]
    Timeout(u64),
}

impl GatewayError {
    /// Status code returned to the caller when this error ends a request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::TargetUrl { .. }
            | GatewayError::TransportConstruction(_)
            | GatewayError::Config(_)
            | GatewayError::Io(_)
            | GatewayError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
