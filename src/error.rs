//! Error types for zoneroute

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found {0}")]
    UnknownHost(String),

    #[error("Not valid ip: {0}")]
    InvalidClientIp(String),

    #[error("No live node after {0}")]
    NoLiveNode(String),

    #[error("No live server in node {0}")]
    NoLiveServer(String),

    #[error("Invalid admin field: {0}")]
    AdminField(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::UnknownHost(_) | Error::AdminField(_) => StatusCode::NOT_FOUND,
            Error::InvalidClientIp(_) => StatusCode::BAD_REQUEST,
            Error::NoLiveNode(_) | Error::NoLiveServer(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
        }));
        (status, body).into_response()
    }
}
