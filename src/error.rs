use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-wide error types.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("upstream resolution failed: {0}")]
    UpstreamResolution(String),

    #[error("error transforming request: {0}")]
    Director(String),

    #[error("proxy error: {0}")]
    Gateway(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// The status rendered to the client when this error terminates a request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::UpstreamResolution(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Gateway(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Director(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "status": status.as_u16(),
            }
        }));
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
