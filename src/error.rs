use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("store error: {0}")]
    StoreTransient(String),
    #[error("store error: {0}")]
    StoreFatal(String),
    #[error("codec response timed out after {0} ms")]
    CodecTimeout(u64),
    #[error("codec dispatch failed: {0}")]
    CodecDispatchFailed(String),
    #[error("search cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ProviderError {
    /// Only transient store failures are eligible for the SSE retry loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreTransient(_))
    }

    /// Short machine-readable kind carried on the terminal SSE error frame.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::StoreTransient(_) => "store_transient",
            Self::StoreFatal(_) => "store_fatal",
            Self::CodecTimeout(_) => "codec_timeout",
            Self::CodecDispatchFailed(_) => "codec_dispatch_failed",
            Self::Cancelled => "cancelled",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }
}

impl From<toml::de::Error> for ProviderError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    message: &'a str,
}

impl IntoResponse for ProviderError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Config(_) | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Cancelled => StatusCode::REQUEST_TIMEOUT,
            Self::StoreTransient(_)
            | Self::StoreFatal(_)
            | Self::CodecTimeout(_)
            | Self::CodecDispatchFailed(_)
            | Self::Io(_)
            | Self::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = self.to_string();
        (status, Json(ErrorBody { message: &message })).into_response()
    }
}
