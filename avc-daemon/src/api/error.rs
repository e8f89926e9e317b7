use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::downloader::DownloadError;
use crate::session::SessionError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    pub error: Option<String>,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    InternalServerError(String),
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        let message = e.to_string();
        match e {
            SessionError::Duplicate | SessionError::Busy | SessionError::NotConnected => {
                ApiError::Conflict(message)
            }
            SessionError::NoPendingDownload => ApiError::NotFound(message),
            SessionError::Connectivity(_) => ApiError::Unavailable(message),
            SessionError::Download(DownloadError::Busy | DownloadError::Stopping) => {
                ApiError::Conflict(message)
            }
            SessionError::Download(DownloadError::NotActive) => ApiError::NotFound(message),
            SessionError::Download(_) | SessionError::Lwm2m(_) | SessionError::Stopped => {
                ApiError::InternalServerError(message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let error_response = ErrorResponse {
            success: false,
            error: status.canonical_reason().map(str::to_owned),
            message,
        };

        (status, Json(error_response)).into_response()
    }
}
