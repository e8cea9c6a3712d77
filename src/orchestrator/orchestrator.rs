//! Trigger decision orchestrator
//!
//! The orchestrator owns the destination registry and the two inbound
//! callback paths. The decision path selects a destination round-robin,
//! transmits with retries, and records the assignment; the token path
//! reconciles completions and frees capacity. Both paths reevaluate the
//! global inhibit after touching a slot. The `run()`-equivalent here is
//! callback-driven: the transport invokes `receive_trigger_decision` and
//! `receive_trigger_complete_token` on its own delivery tasks.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{DaqflowError, OrchestratorError, Result};
use crate::messages::{TriggerDecision, TriggerDecisionToken};
use crate::transport::IoManager;

use super::config::{ConnectionNames, OrchestratorConfig, StartParams};
use super::inhibit::InhibitSignaller;
use super::registry::DestinationRegistry;
use super::slot::{AssignedTriggerDecision, DestinationSlot, MetadataFunction};

/// How long the dispatcher parks when every destination is busy or failed
/// before rechecking `running`.
const SLOT_WAIT_POLL: Duration = Duration::from_millis(10);
/// The stop drain polls `is_empty` in this many equal sleeps.
const STOP_WAIT_STEPS: u32 = 20;

#[derive(Default)]
struct Counters {
    decisions_received: AtomicU64,
    decisions_sent: AtomicU64,
    tokens_received: AtomicU64,
    waiting_for_decision: AtomicU64,
    deciding_destination: AtomicU64,
    forwarding_decision: AtomicU64,
    waiting_for_token: AtomicU64,
    processing_token: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        self.decisions_received.store(0, Ordering::Relaxed);
        self.decisions_sent.store(0, Ordering::Relaxed);
        self.tokens_received.store(0, Ordering::Relaxed);
        self.waiting_for_decision.store(0, Ordering::Relaxed);
        self.deciding_destination.store(0, Ordering::Relaxed);
        self.forwarding_decision.store(0, Ordering::Relaxed);
        self.waiting_for_token.store(0, Ordering::Relaxed);
        self.processing_token.store(0, Ordering::Relaxed);
    }
}

/// Counter snapshot for the monitoring collector. Every counter is
/// exchanged to zero on read; only `outstanding_decisions` is sampled.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestratorInfo {
    pub tokens_received: u64,
    pub decisions_sent: u64,
    pub decisions_received: u64,
    pub waiting_for_decision: u64,
    pub deciding_destination: u64,
    pub forwarding_decision: u64,
    pub waiting_for_token: u64,
    pub processing_token: u64,
    pub destinations: Vec<DestinationInfo>,
}

/// Per-destination monitoring sub-record.
#[derive(Debug, Clone, Serialize)]
pub struct DestinationInfo {
    pub name: String,
    pub outstanding_decisions: usize,
    pub completed_trigger_records: u64,
    pub waiting_time: u64,
}

/// Coordination core of the dataflow: assigns each trigger decision to an
/// available record builder and applies backpressure when none is.
pub struct TriggerOrchestrator {
    io: Arc<IoManager>,
    td_connection: String,
    token_connection: String,

    registry: RwLock<DestinationRegistry>,
    inhibit: InhibitSignaller,

    queue_timeout_ms: AtomicU64,
    stop_timeout_ms: AtomicU64,
    td_send_retries: AtomicU32,

    run_number: AtomicU64,
    running: AtomicBool,
    configured: AtomicBool,
    started_at: RwLock<Option<DateTime<Utc>>>,

    metadata_fn: RwLock<Option<Arc<MetadataFunction>>>,

    /// Signalled by the token path whenever capacity may have freed up.
    slot_freed: Notify,

    counters: Counters,
    last_td_received: Mutex<Instant>,
    last_token_received: Mutex<Instant>,
}

impl TriggerOrchestrator {
    /// Build an orchestrator over the three mandatory connections. Fails
    /// fast if any of them is missing or mistyped.
    pub async fn new(io: Arc<IoManager>, connections: ConnectionNames) -> Result<Arc<Self>> {
        io.get_receiver::<TriggerDecisionToken>(&connections.token_connection)
            .await?;
        io.get_receiver::<TriggerDecision>(&connections.td_connection)
            .await?;
        let busy_sender = io
            .get_sender::<crate::messages::TriggerInhibit>(&connections.busy_connection)
            .await?;

        let defaults = OrchestratorConfig::default();
        Ok(Arc::new(Self {
            io,
            td_connection: connections.td_connection,
            token_connection: connections.token_connection,
            registry: RwLock::new(DestinationRegistry::new()),
            inhibit: InhibitSignaller::new(busy_sender),
            queue_timeout_ms: AtomicU64::new(defaults.general_queue_timeout),
            stop_timeout_ms: AtomicU64::new(defaults.stop_timeout),
            td_send_retries: AtomicU32::new(defaults.td_send_retries),
            run_number: AtomicU64::new(0),
            running: AtomicBool::new(false),
            configured: AtomicBool::new(false),
            started_at: RwLock::new(None),
            metadata_fn: RwLock::new(None),
            slot_freed: Notify::new(),
            counters: Counters::default(),
            last_td_received: Mutex::new(Instant::now()),
            last_token_received: Mutex::new(Instant::now()),
        }))
    }

    /// Install the hook applied to every completed assignment.
    pub async fn set_metadata_function<F>(&self, annotate: F)
    where
        F: Fn(&mut AssignedTriggerDecision, Instant) + Send + Sync + 'static,
    {
        *self.metadata_fn.write().await = Some(Arc::new(annotate));
    }

    // ==================== Lifecycle ====================

    /// Build the destination registry from the configuration payload.
    pub async fn configure(&self, config: OrchestratorConfig) -> Result<()> {
        debug!("entering configure");
        if self.running.load(Ordering::SeqCst) {
            return Err(DaqflowError::InvalidState("configure while running".into()));
        }
        config.validate()?;

        let mut registry = self.registry.write().await;
        registry.clear();
        for app in &config.dataflow_applications {
            debug!(
                connection_uid = %app.connection_uid,
                busy_threshold = app.thresholds.busy,
                free_threshold = app.thresholds.free,
                "registering trigger record builder"
            );
            registry.insert(Arc::new(DestinationSlot::new(
                &app.connection_uid,
                app.thresholds.busy as usize,
                app.thresholds.free as usize,
            )));
        }

        self.queue_timeout_ms
            .store(config.general_queue_timeout, Ordering::SeqCst);
        self.stop_timeout_ms
            .store(config.stop_timeout, Ordering::SeqCst);
        self.td_send_retries
            .store(config.td_send_retries, Ordering::SeqCst);
        self.configured.store(true, Ordering::SeqCst);

        info!(destinations = registry.len(), "orchestrator configured");
        debug!("exiting configure");
        Ok(())
    }

    /// Open a run: reset the run context and bind both inbound callbacks.
    pub async fn start(self: &Arc<Self>, params: StartParams) -> Result<()> {
        debug!("entering start");
        if !self.configured.load(Ordering::SeqCst) {
            return Err(DaqflowError::InvalidState("start before configure".into()));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.run_number.store(params.run, Ordering::SeqCst);
        self.counters.reset();
        self.inhibit.reset().await;
        self.registry.read().await.reset_cursor();
        let now = Instant::now();
        *self.last_td_received.lock().await = now;
        *self.last_token_received.lock().await = now;
        *self.started_at.write().await = Some(Utc::now());

        let orchestrator = Arc::clone(self);
        self.io
            .add_callback::<TriggerDecisionToken>(
                &self.token_connection,
                Box::new(move |token| {
                    let orchestrator = Arc::clone(&orchestrator);
                    Box::pin(async move { orchestrator.receive_trigger_complete_token(token).await })
                }),
            )
            .await?;

        let orchestrator = Arc::clone(self);
        if let Err(err) = self
            .io
            .add_callback::<TriggerDecision>(
                &self.td_connection,
                Box::new(move |decision| {
                    let orchestrator = Arc::clone(&orchestrator);
                    Box::pin(async move { orchestrator.receive_trigger_decision(decision).await })
                }),
            )
            .await
        {
            self.running.store(false, Ordering::SeqCst);
            self.io
                .remove_callback::<TriggerDecisionToken>(&self.token_connection)
                .await?;
            return Err(err.into());
        }

        info!(run_number = params.run, "orchestrator started");
        debug!("exiting start");
        Ok(())
    }

    /// Close the run: unbind the decision stream, drain outstanding
    /// assignments while tokens keep flowing, then report the remnants.
    pub async fn stop(&self) -> Result<()> {
        debug!("entering stop");
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.slot_freed.notify_waiters();

        if let Err(err) = self
            .io
            .remove_callback::<TriggerDecision>(&self.td_connection)
            .await
        {
            warn!(connection = %self.td_connection, error = %err, "failed to unbind decision callback");
        }

        let stop_timeout = Duration::from_millis(self.stop_timeout_ms.load(Ordering::SeqCst));
        let step_timeout = stop_timeout / STOP_WAIT_STEPS;
        let mut step = 0;
        while !self.is_empty().await && step < STOP_WAIT_STEPS {
            tokio::time::sleep(step_timeout).await;
            step += 1;
        }

        if let Err(err) = self
            .io
            .remove_callback::<TriggerDecisionToken>(&self.token_connection)
            .await
        {
            warn!(connection = %self.token_connection, error = %err, "failed to unbind token callback");
        }

        let registry = self.registry.read().await;
        let mut remnants = Vec::new();
        for slot in registry.iter() {
            remnants.extend(slot.flush().await);
        }
        drop(registry);
        for remnant in &remnants {
            error!(
                "{}",
                OrchestratorError::IncompleteTriggerDecision {
                    trigger_number: remnant.decision.trigger_number,
                }
            );
        }

        info!(remnants = remnants.len(), "orchestrator stopped");
        debug!("exiting stop");
        Ok(())
    }

    /// Tear down the registry. Valid only after `stop`.
    pub async fn scrap(&self) -> Result<()> {
        debug!("entering scrap");
        if self.running.load(Ordering::SeqCst) {
            return Err(DaqflowError::InvalidState("scrap while running".into()));
        }
        self.registry.write().await.clear();
        self.configured.store(false, Ordering::SeqCst);
        info!("orchestrator scrapped");
        debug!("exiting scrap");
        Ok(())
    }

    // ==================== Decision path ====================

    async fn receive_trigger_decision(&self, decision: TriggerDecision) {
        let run_number = self.run_number.load(Ordering::SeqCst);
        if decision.run_number != run_number {
            warn!(
                "{}",
                OrchestratorError::RunNumberMismatch {
                    received: decision.run_number,
                    expected: run_number,
                    origin: "trigger logic".into(),
                }
            );
            return;
        }

        self.counters
            .decisions_received
            .fetch_add(1, Ordering::Relaxed);
        let decision_received = Instant::now();
        let mut decision_assigned = decision_received;

        while self.running.load(Ordering::SeqCst) {
            let Some((slot, assignment)) = self.find_slot(&decision).await else {
                // every destination busy or failed; wait for the token path
                // to free one, rechecking `running` at a bounded interval
                let _ = tokio::time::timeout(SLOT_WAIT_POLL, self.slot_freed.notified()).await;
                continue;
            };

            decision_assigned = Instant::now();
            if self.dispatch(&assignment).await {
                slot.add_assignment(assignment).await;
                break;
            }

            error!(
                "{}",
                OrchestratorError::TriggerRecordBuilderAppUpdate {
                    destination: assignment.connection_name.clone(),
                    status: "could not send trigger decision".into(),
                }
            );
            slot.set_in_error(true);
        }

        self.notify_trigger(self.is_busy().await).await;

        let mut last_td = self.last_td_received.lock().await;
        self.counters.waiting_for_decision.fetch_add(
            micros_between(*last_td, decision_received),
            Ordering::Relaxed,
        );
        *last_td = Instant::now();
        let done = *last_td;
        drop(last_td);
        self.counters.deciding_destination.fetch_add(
            micros_between(decision_received, decision_assigned),
            Ordering::Relaxed,
        );
        self.counters
            .forwarding_decision
            .fetch_add(micros_between(decision_assigned, done), Ordering::Relaxed);
    }

    /// Probe every destination once, round-robin, starting one past the
    /// cursor. Busy and failed destinations are skipped.
    async fn find_slot(
        &self,
        decision: &TriggerDecision,
    ) -> Option<(Arc<DestinationSlot>, AssignedTriggerDecision)> {
        let registry = self.registry.read().await;
        if registry.is_empty() {
            return None;
        }
        let start = registry.probe_start();
        for offset in 0..registry.len() {
            let index = (start + offset) % registry.len();
            let slot = registry.slot_at(index);
            if slot.is_in_error() || slot.is_busy().await {
                continue;
            }
            let assignment = slot.make_assignment(decision.clone());
            registry.advance_cursor_to(index);
            debug!(
                trigger_number = decision.trigger_number,
                destination = slot.name(),
                "trigger decision assigned"
            );
            return Some((Arc::clone(slot), assignment));
        }
        None
    }

    /// Transmit one assignment, retrying up to the configured budget and
    /// aborting as soon as `running` clears.
    async fn dispatch(&self, assignment: &AssignedTriggerDecision) -> bool {
        let timeout = self.queue_timeout();
        let sender = match self
            .io
            .get_sender::<TriggerDecision>(&assignment.connection_name)
            .await
        {
            Ok(sender) => sender,
            Err(err) => {
                warn!(
                    connection = %assignment.connection_name,
                    error = %err,
                    "no sender for destination"
                );
                return false;
            }
        };

        let mut retries = self.td_send_retries.load(Ordering::SeqCst);
        loop {
            match sender.send(assignment.decision.clone(), timeout).await {
                Ok(()) => {
                    self.counters.decisions_sent.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(err) => {
                    warn!(
                        connection = %assignment.connection_name,
                        error = %err,
                        "trigger decision send failed"
                    );
                }
            }
            retries = retries.saturating_sub(1);
            if retries == 0 || !self.running.load(Ordering::SeqCst) {
                return false;
            }
        }
    }

    // ==================== Token path ====================

    async fn receive_trigger_complete_token(&self, token: TriggerDecisionToken) {
        let run_number = self.run_number.load(Ordering::SeqCst);
        if token.run_number != run_number {
            warn!(
                "{}",
                OrchestratorError::RunNumberMismatch {
                    received: token.run_number,
                    expected: run_number,
                    origin: token.decision_destination.clone(),
                }
            );
            return;
        }

        let slot = {
            let registry = self.registry.read().await;
            match registry.lookup(&token.decision_destination) {
                Some(slot) => Arc::clone(slot),
                None => {
                    warn!(
                        "{}",
                        OrchestratorError::UnknownTokenSource {
                            destination: token.decision_destination.clone(),
                        }
                    );
                    return;
                }
            }
        };

        self.counters.tokens_received.fetch_add(1, Ordering::Relaxed);
        let callback_start = Instant::now();

        let metadata_fn = self.metadata_fn.read().await.clone();
        match slot
            .complete_assignment(token.trigger_number, metadata_fn.as_deref())
            .await
        {
            Ok(assignment) => {
                slot.record_completion(assignment.assigned_time.elapsed());
            }
            Err(err) => warn!("{}", err),
        }

        if slot.is_in_error() {
            info!(
                "{}",
                OrchestratorError::TriggerRecordBuilderAppUpdate {
                    destination: token.decision_destination.clone(),
                    status: "has reconnected".into(),
                }
            );
            slot.set_in_error(false);
        }

        if !slot.is_busy().await {
            self.notify_trigger(false).await;
        }
        self.slot_freed.notify_one();

        let mut last_token = self.last_token_received.lock().await;
        self.counters.waiting_for_token.fetch_add(
            micros_between(*last_token, callback_start),
            Ordering::Relaxed,
        );
        *last_token = Instant::now();
        let done = *last_token;
        drop(last_token);
        self.counters
            .processing_token
            .fetch_add(micros_between(callback_start, done), Ordering::Relaxed);
    }

    // ==================== Shared predicates ====================

    /// Global busy: every destination is busy. Vacuously true when the
    /// registry is empty.
    pub async fn is_busy(&self) -> bool {
        let registry = self.registry.read().await;
        for slot in registry.iter() {
            if !slot.is_busy().await {
                return false;
            }
        }
        true
    }

    /// No destination has outstanding assignments.
    pub async fn is_empty(&self) -> bool {
        let registry = self.registry.read().await;
        for slot in registry.iter() {
            if slot.used_slots().await != 0 {
                return false;
            }
        }
        true
    }

    async fn notify_trigger(&self, busy: bool) {
        self.inhibit
            .notify(
                busy,
                self.run_number.load(Ordering::SeqCst),
                self.queue_timeout(),
                &self.running,
            )
            .await;
    }

    fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn run_number(&self) -> u64 {
        self.run_number.load(Ordering::SeqCst)
    }

    /// Wall-clock start of the current run, if one is open.
    pub async fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.read().await
    }

    // ==================== Monitoring ====================

    /// Drain the counter set for the monitoring collector.
    pub async fn get_info(&self) -> OrchestratorInfo {
        let mut info = OrchestratorInfo {
            tokens_received: self.counters.tokens_received.swap(0, Ordering::Relaxed),
            decisions_sent: self.counters.decisions_sent.swap(0, Ordering::Relaxed),
            decisions_received: self.counters.decisions_received.swap(0, Ordering::Relaxed),
            waiting_for_decision: self.counters.waiting_for_decision.swap(0, Ordering::Relaxed),
            deciding_destination: self
                .counters
                .deciding_destination
                .swap(0, Ordering::Relaxed),
            forwarding_decision: self.counters.forwarding_decision.swap(0, Ordering::Relaxed),
            waiting_for_token: self.counters.waiting_for_token.swap(0, Ordering::Relaxed),
            processing_token: self.counters.processing_token.swap(0, Ordering::Relaxed),
            destinations: Vec::new(),
        };

        let registry = self.registry.read().await;
        for slot in registry.iter() {
            info.destinations.push(DestinationInfo {
                name: slot.name().to_string(),
                outstanding_decisions: slot.used_slots().await,
                completed_trigger_records: slot.drain_completed_records(),
                waiting_time: slot.drain_waiting_time_us(),
            });
        }
        info
    }
}

fn micros_between(earlier: Instant, later: Instant) -> u64 {
    later.saturating_duration_since(earlier).as_micros() as u64
}
