//! Per-message processing failures.
//!
//! A [`ProcessingError`] fails one message (or one request of a message);
//! it never stops a worker.

use thiserror::Error;

use crate::model::MappingType;
use crate::platform::PlatformError;

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("protobuf decode error: {0}")]
    Protobuf(#[from] prost::DecodeError),
    #[error("invalid source path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("target template is not a JSON object")]
    InvalidTargetTemplate,
    #[error("no payload processor registered for mapping type {0}")]
    NoProcessor(MappingType),
    #[error("{processor} processor cannot handle this payload")]
    UnexpectedPayload { processor: &'static str },
    #[error("mapping does not reference a processor extension")]
    MissingExtensionRef,
    #[error("processor extension {name}/{event} is not loaded")]
    ExtensionUnavailable { name: String, event: String },
    #[error("processor extension failed: {0}")]
    Extension(String),
    #[error("device identifier is missing from the payload")]
    MissingDeviceIdentifier,
    #[error("device with external id {0} does not exist")]
    DeviceNotFound(String),
    #[error(transparent)]
    Platform(#[from] PlatformError),
}
