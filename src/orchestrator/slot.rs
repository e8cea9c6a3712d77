//! Per-destination assignment tracking with busy/free hysteresis

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::OrchestratorError;
use crate::messages::TriggerDecision;

/// Caller-supplied hook that annotates a completed assignment (latency
/// metrics, bookkeeping) before it is handed back.
pub type MetadataFunction = dyn Fn(&mut AssignedTriggerDecision, Instant) + Send + Sync;

/// A decision handed to one trigger record builder, awaiting its token.
#[derive(Debug, Clone)]
pub struct AssignedTriggerDecision {
    pub decision: TriggerDecision,
    /// The builder the decision was handed to.
    pub connection_name: String,
    /// Stamped when the network send succeeded.
    pub assigned_time: Instant,
    /// Filled by the metadata hook at completion; `Null` in the core.
    pub completion_metadata: Value,
}

struct SlotState {
    outstanding: HashMap<u64, AssignedTriggerDecision>,
    busy: bool,
}

/// Availability state for one configured trigger record builder.
///
/// Busy is hysteretic: the slot turns busy once `busy_threshold`
/// assignments are outstanding and frees up only when the count falls back
/// to `free_threshold`.
pub struct DestinationSlot {
    name: String,
    busy_threshold: usize,
    free_threshold: usize,
    state: Mutex<SlotState>,
    in_error: AtomicBool,
    completed_records: AtomicU64,
    waiting_time_us: AtomicU64,
}

impl DestinationSlot {
    pub fn new(name: &str, busy_threshold: usize, free_threshold: usize) -> Self {
        Self {
            name: name.to_string(),
            busy_threshold,
            free_threshold,
            state: Mutex::new(SlotState {
                outstanding: HashMap::new(),
                busy: false,
            }),
            in_error: AtomicBool::new(false),
            completed_records: AtomicU64::new(0),
            waiting_time_us: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn is_busy(&self) -> bool {
        self.state.lock().await.busy
    }

    pub async fn used_slots(&self) -> usize {
        self.state.lock().await.outstanding.len()
    }

    /// Build a tentative assignment. Nothing is tracked until
    /// [`add_assignment`](Self::add_assignment) confirms the send went out.
    pub fn make_assignment(&self, decision: TriggerDecision) -> AssignedTriggerDecision {
        AssignedTriggerDecision {
            decision,
            connection_name: self.name.clone(),
            assigned_time: Instant::now(),
            completion_metadata: Value::Null,
        }
    }

    /// Track a successfully transmitted assignment.
    pub async fn add_assignment(&self, mut assignment: AssignedTriggerDecision) {
        assignment.assigned_time = Instant::now();
        let trigger_number = assignment.decision.trigger_number;
        let mut state = self.state.lock().await;
        if state.outstanding.insert(trigger_number, assignment).is_some() {
            warn!(
                destination = %self.name,
                trigger_number,
                "replaced an assignment that was still outstanding"
            );
        }
        self.apply_hysteresis(&mut state);
    }

    /// Remove and return the assignment matching `trigger_number`, applying
    /// the metadata hook on the way out.
    pub async fn complete_assignment(
        &self,
        trigger_number: u64,
        metadata_fn: Option<&MetadataFunction>,
    ) -> Result<AssignedTriggerDecision, OrchestratorError> {
        let mut state = self.state.lock().await;
        let mut assignment = state.outstanding.remove(&trigger_number).ok_or_else(|| {
            OrchestratorError::AssignedTriggerDecisionNotFound {
                trigger_number,
                destination: self.name.clone(),
            }
        })?;
        self.apply_hysteresis(&mut state);
        drop(state);

        if let Some(annotate) = metadata_fn {
            annotate(&mut assignment, Instant::now());
        }
        Ok(assignment)
    }

    /// Remove and return every outstanding assignment. Stop-drain only.
    pub async fn flush(&self) -> Vec<AssignedTriggerDecision> {
        let mut state = self.state.lock().await;
        let drained = state.outstanding.drain().map(|(_, a)| a).collect();
        self.apply_hysteresis(&mut state);
        drained
    }

    pub fn is_in_error(&self) -> bool {
        self.in_error.load(Ordering::SeqCst)
    }

    pub fn set_in_error(&self, value: bool) {
        self.in_error.store(value, Ordering::SeqCst);
    }

    /// Record a completed trigger record and how long its token took.
    pub fn record_completion(&self, waited: Duration) {
        self.completed_records.fetch_add(1, Ordering::Relaxed);
        self.waiting_time_us
            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn drain_completed_records(&self) -> u64 {
        self.completed_records.swap(0, Ordering::Relaxed)
    }

    pub fn drain_waiting_time_us(&self) -> u64 {
        self.waiting_time_us.swap(0, Ordering::Relaxed)
    }

    fn apply_hysteresis(&self, state: &mut SlotState) {
        let used = state.outstanding.len();
        if used >= self.busy_threshold {
            state.busy = true;
        } else if used <= self.free_threshold {
            state.busy = false;
        }
    }
}
