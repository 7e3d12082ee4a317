use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CamlinkError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Actuator error: {0}")]
    Actuator(#[from] ActuatorError),

    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

impl CamlinkError {
    pub fn component<S: Into<String>>(component: S, message: S) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }
}

/// Shared state store failures. Reads never fail; only writes surface here.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to write slot '{slot}': {source}")]
    Write {
        slot: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to prepare store directory {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Channel-level failures. These are recovered by the failover policy and
/// never reach the arbiter as user-facing errors on their own.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Connection to {endpoint} failed: {details}")]
    Connect { endpoint: String, details: String },

    #[error("Channel disconnected")]
    Disconnected,

    #[error("Request failed: {details}")]
    Request { details: String },

    #[error("Unexpected response: {details}")]
    Protocol { details: String },

    #[error("Operation timed out after {timeout:?}")]
    Timeout { timeout: Duration },
}

/// User-visible capture outcomes that are not successes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Camera is busy")]
    Busy,

    #[error("A capture is already in flight")]
    AlreadyCapturing,

    #[error("Capture did not complete within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Capture could not be delivered: {details}")]
    Undelivered { details: String },

    #[error("Capture failed on the camera: {details}")]
    Failed { details: String },
}

/// Failures reported by the camera actuator.
#[derive(Error, Debug, Clone)]
pub enum ActuatorError {
    #[error("Actuator is busy")]
    Busy,

    #[error("Capture command failed: {details}")]
    CommandFailed { details: String },
}

pub type Result<T> = std::result::Result<T, CamlinkError>;
