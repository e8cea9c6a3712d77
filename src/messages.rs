//! Wire messages exchanged with the trigger logic and the record builders.

use serde::{Deserialize, Serialize};

/// A directive from upstream trigger logic to build one event record.
///
/// The orchestrator routes on `run_number` and `trigger_number` only; the
/// remaining fields are opaque payload forwarded to the chosen builder
/// untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDecision {
    pub run_number: u64,
    pub trigger_number: u64,
    pub trigger_timestamp: u64,
    pub trigger_type: u16,
    /// Component readout requests for this decision; opaque to the
    /// orchestrator.
    #[serde(default)]
    pub readout_windows: Vec<serde_json::Value>,
}

/// Completion receipt emitted by a trigger record builder once it has
/// assembled the record for one decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerDecisionToken {
    pub run_number: u64,
    pub trigger_number: u64,
    /// Logical name of the builder that completed the decision.
    pub decision_destination: String,
}

/// Backpressure signal to the trigger logic.
///
/// `busy = true` asks the source to stop emitting decisions; `false`
/// releases it. Emitted only on transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerInhibit {
    pub busy: bool,
    pub run_number: u64,
}
