//! Error taxonomy for a load run
//!
//! Only [`EngineError`] is fatal to a run. Step failures and transport failures
//! inside an iteration are recorded as failed checks and never escape the worker.

use std::time::Duration;
use thiserror::Error;

/// Configuration problems, detected before any network call is made
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("resource count {resources} does not evenly divide identity count {users}")]
    UnevenPartition { users: usize, resources: usize },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("expected {expected} stream ids but got {actual}")]
    StreamIdCount { expected: usize, actual: usize },

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },

    #[error("invalid ramp stage {0:?} (expected <duration>:<target>)")]
    InvalidStage(String),

    #[error("at least one ramp stage is required")]
    NoStages,

    #[error("unknown scenario {0:?}")]
    UnknownScenario(String),

    #[error("scenario {0:?} has no steps")]
    EmptyScenario(String),

    #[error("failed to load scenario file {path}: {reason}")]
    ScenarioFile { path: String, reason: String },

    #[error("excluded ordinal {ordinal} is outside the identity pool of {users}")]
    ExcludedOrdinal { ordinal: usize, users: usize },
}

/// Provisioning escalated to a run-fatal failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisioningError {
    #[error("only {active} of {attempted} identities logged in (at least {required} required)")]
    InsufficientSessions {
        active: usize,
        required: usize,
        attempted: usize,
    },

    #[error("login endpoint unreachable for all {attempted} identities: {last_error}")]
    Unreachable { attempted: usize, last_error: String },

    #[error("provisioning cancelled with {pending} of {attempted} logins unresolved")]
    Cancelled { attempted: usize, pending: usize },
}

/// Failure of a single network call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("cancelled")]
    Cancelled,

    #[error("failed to build client: {0}")]
    Client(String),
}

impl TransportError {
    /// Connection-level failures mean the target could not be reached at all
    pub fn is_unreachable(&self) -> bool {
        matches!(self, TransportError::Connect(_) | TransportError::Timeout(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if err.is_builder() {
            TransportError::Client(err.to_string())
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Io(e) => TransportError::Connect(e.to_string()),
            other => TransportError::WebSocket(other.to_string()),
        }
    }
}

/// Errors that abort the whole run
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("provisioning failed: {0}")]
    Provisioning(#[from] ProvisioningError),

    #[error("stream preparation failed: {0}")]
    Preparation(String),

    #[error("transport setup failed: {0}")]
    Client(#[from] TransportError),
}
