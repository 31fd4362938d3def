use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

/// Failures on the streaming path. Only the first three surface as HTTP
/// statuses before bytes start flowing; everything else is either logged and
/// mapped to 500 or converted into an in-stream offline item upstream of here.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("missing or invalid query parameter: {0}")]
    BadRequest(&'static str),

    #[error("channel {0} not found")]
    NotFound(String),

    #[error("ffmpeg executable not found at {0}")]
    EncoderMissing(String),

    #[error("channel lineup is empty")]
    LineupEmpty,

    #[error("lineup items sum to {actual}ms but channel duration is {expected}ms")]
    LineupDurationMismatch { expected: i64, actual: i64 },

    #[error("redirect cycle: {path}")]
    RedirectCycle { path: String },

    /// The configured error screen mode is `kill`: refuse instead of synthesizing.
    #[error("error screen mode is 'kill', refusing to synthesize a stream")]
    EncoderRefused,
}

impl StreamError {
    pub fn status(&self) -> StatusCode {
        match self {
            StreamError::BadRequest(_) => StatusCode::BAD_REQUEST,
            StreamError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("stream request failed: {}", self);
        }
        Response::builder()
            .status(status)
            .header("Cache-Control", "no-store")
            .body(Body::from(self.to_string()))
            .unwrap()
    }
}
