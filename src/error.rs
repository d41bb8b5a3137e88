use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FleetError>;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("invalid device id: {0:?}")]
    InvalidDeviceId(String),
    #[error("unknown command kind: {0}")]
    InvalidCommandType(String),
    #[error("unknown priority: {0}")]
    InvalidPriority(String),
    #[error("unknown command status: {0}")]
    InvalidStatus(String),
    #[error("command not found")]
    CommandNotFound,
    #[error("illegal status transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },
    #[error("delivery channel unavailable for device {0}")]
    ChannelUnavailable(String),
    #[error("retry limit reached after {0} attempts")]
    RetryLimitExceeded(u32),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<toml::de::Error> for FleetError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for FleetError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rocksdb::Error> for FleetError {
    fn from(err: rocksdb::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    message: &'a str,
}

impl IntoResponse for FleetError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Config(_) => StatusCode::BAD_REQUEST,
            Self::DeviceNotFound(_) | Self::CommandNotFound => StatusCode::NOT_FOUND,
            Self::InvalidDeviceId(_)
            | Self::InvalidCommandType(_)
            | Self::InvalidPriority(_)
            | Self::InvalidStatus(_) => StatusCode::BAD_REQUEST,
            Self::IllegalTransition { .. } => StatusCode::CONFLICT,
            Self::ChannelUnavailable(_) | Self::RetryLimitExceeded(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Storage(_) | Self::Serialization(_) | Self::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = self.to_string();
        (status, Json(ErrorBody { message: &message })).into_response()
    }
}
