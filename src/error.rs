use thiserror::Error;

/// Main error type for the orchestrator crate
#[derive(Error, Debug)]
pub enum DaqflowError {
    // Transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    // Orchestrator protocol errors
    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Lifecycle / configuration errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid lifecycle transition: {0}")]
    InvalidState(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for DaqflowError
pub type Result<T> = std::result::Result<T, DaqflowError>;

/// Errors raised on the decision and token paths.
///
/// These mirror the anomalies the orchestrator reports through its log
/// stream; only `AssignedTriggerDecisionNotFound` is ever returned to a
/// caller, the rest are logged and the offending message dropped.
#[derive(Error, Debug, Clone)]
pub enum OrchestratorError {
    #[error("run number mismatch: received {received}, expected {expected} (source: {origin})")]
    RunNumberMismatch {
        received: u64,
        expected: u64,
        origin: String,
    },

    #[error("token from unknown destination: {destination}")]
    UnknownTokenSource { destination: String },

    #[error("no outstanding trigger decision {trigger_number} at destination {destination}")]
    AssignedTriggerDecisionNotFound {
        trigger_number: u64,
        destination: String,
    },

    #[error("trigger record builder {destination}: {status}")]
    TriggerRecordBuilderAppUpdate { destination: String, status: String },

    #[error("trigger decision {trigger_number} never completed before stop")]
    IncompleteTriggerDecision { trigger_number: u64 },
}

/// Errors surfaced by the named-connection transport
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("connection not found: {name}")]
    ConnectionNotFound { name: String },

    #[error("connection {name} carries a different message type")]
    TypeMismatch { name: String },

    #[error("connection already open: {name}")]
    AlreadyOpen { name: String },

    #[error("send on {name} timed out after {timeout_ms}ms")]
    SendTimeout { name: String, timeout_ms: u64 },

    #[error("receive on {name} timed out after {timeout_ms}ms")]
    RecvTimeout { name: String, timeout_ms: u64 },

    #[error("connection {name} is closed")]
    Closed { name: String },

    #[error("a callback owns the receive stream of {name}")]
    CallbackBound { name: String },
}
