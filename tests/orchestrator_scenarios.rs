//! End-to-end orchestrator scenarios, driven entirely through the transport:
//! decisions and tokens go in over their named connections, inhibits come
//! back out, and `get_info` samples the counters.

use std::sync::Arc;
use std::time::{Duration, Instant};

use daqflow::{
    ConnectionNames, DataflowApplication, IoManager, OrchestratorConfig, OrchestratorInfo,
    SlotThresholds, StartParams, TriggerDecision, TriggerDecisionToken, TriggerInhibit,
    TriggerOrchestrator,
};

const TIMEOUT: Duration = Duration::from_secs(2);
/// Window after which we declare "nothing arrived".
const QUIET: Duration = Duration::from_millis(80);

struct Harness {
    io: Arc<IoManager>,
    orchestrator: Arc<TriggerOrchestrator>,
}

impl Harness {
    /// Wire up the three core connections plus one channel per destination.
    async fn new(
        destinations: &[(&str, u32, u32)],
        destination_capacity: usize,
        config_overrides: impl FnOnce(&mut OrchestratorConfig),
    ) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        let io = Arc::new(IoManager::new());
        io.open::<TriggerDecision>("td", 64).await.unwrap();
        io.open::<TriggerDecisionToken>("token", 64).await.unwrap();
        io.open::<TriggerInhibit>("busy", 64).await.unwrap();
        for (name, _, _) in destinations {
            io.open::<TriggerDecision>(name, destination_capacity)
                .await
                .unwrap();
        }

        let orchestrator = TriggerOrchestrator::new(
            io.clone(),
            ConnectionNames {
                token_connection: "token".into(),
                td_connection: "td".into(),
                busy_connection: "busy".into(),
            },
        )
        .await
        .unwrap();

        let mut config = OrchestratorConfig {
            dataflow_applications: destinations
                .iter()
                .map(|(name, busy, free)| DataflowApplication {
                    connection_uid: name.to_string(),
                    thresholds: SlotThresholds {
                        busy: *busy,
                        free: *free,
                    },
                })
                .collect(),
            general_queue_timeout: 50,
            stop_timeout: 400,
            td_send_retries: 2,
        };
        config_overrides(&mut config);
        orchestrator.configure(config).await.unwrap();

        Self { io, orchestrator }
    }

    async fn start(&self, run: u64) {
        self.orchestrator.start(StartParams { run }).await.unwrap();
    }

    async fn send_decision(&self, run: u64, trigger_number: u64) {
        self.io
            .get_sender::<TriggerDecision>("td")
            .await
            .unwrap()
            .send(decision(run, trigger_number), TIMEOUT)
            .await
            .unwrap();
    }

    async fn send_token(&self, run: u64, trigger_number: u64, destination: &str) {
        self.io
            .get_sender::<TriggerDecisionToken>("token")
            .await
            .unwrap()
            .send(
                TriggerDecisionToken {
                    run_number: run,
                    trigger_number,
                    decision_destination: destination.to_string(),
                },
                TIMEOUT,
            )
            .await
            .unwrap();
    }

    /// Next decision forwarded to a destination, or None if nothing arrives.
    async fn recv_at(&self, destination: &str, within: Duration) -> Option<TriggerDecision> {
        self.io
            .get_receiver::<TriggerDecision>(destination)
            .await
            .unwrap()
            .recv(within)
            .await
            .ok()
    }

    async fn recv_inhibit(&self, within: Duration) -> Option<TriggerInhibit> {
        self.io
            .get_receiver::<TriggerInhibit>("busy")
            .await
            .unwrap()
            .recv(within)
            .await
            .ok()
    }

    async fn info(&self) -> OrchestratorInfo {
        self.orchestrator.get_info().await
    }

    async fn outstanding_at(&self, destination: &str) -> usize {
        let info = self.info().await;
        info.destinations
            .iter()
            .find(|d| d.name == destination)
            .map(|d| d.outstanding_decisions)
            .unwrap_or(0)
    }

    /// Poll until a destination holds exactly `expected` assignments.
    async fn wait_outstanding(&self, destination: &str, expected: usize) -> bool {
        let deadline = Instant::now() + TIMEOUT;
        while Instant::now() < deadline {
            if self.outstanding_at(destination).await == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }
}

fn decision(run_number: u64, trigger_number: u64) -> TriggerDecision {
    TriggerDecision {
        run_number,
        trigger_number,
        trigger_timestamp: trigger_number * 1_000,
        trigger_type: 1,
        readout_windows: vec![serde_json::json!({
            "component": "detector-0",
            "window_begin": trigger_number * 1_000 - 500,
            "window_end": trigger_number * 1_000 + 500,
        })],
    }
}

#[tokio::test]
async fn s1_happy_round_robin() {
    let h = Harness::new(&[("trb-a", 2, 1), ("trb-b", 2, 1), ("trb-c", 2, 1)], 16, |_| {}).await;
    h.start(7).await;

    for n in 1..=6 {
        h.send_decision(7, n).await;
    }

    // insertion order, one past the fresh cursor, no repeats per revolution
    for (destination, expected) in [("trb-a", [1, 4]), ("trb-b", [2, 5]), ("trb-c", [3, 6])] {
        for trigger_number in expected {
            let received = h.recv_at(destination, TIMEOUT).await.unwrap();
            assert_eq!(received.trigger_number, trigger_number, "at {destination}");
            assert_eq!(received.run_number, 7);
        }
    }

    // the sixth decision filled the last free slot: exactly one inhibit
    let inhibit = h.recv_inhibit(TIMEOUT).await.unwrap();
    assert_eq!(
        inhibit,
        TriggerInhibit {
            busy: true,
            run_number: 7
        }
    );
    assert!(h.recv_inhibit(QUIET).await.is_none());

    let info = h.info().await;
    assert_eq!(info.decisions_received, 6);
    assert_eq!(info.decisions_sent, 6);
    for destination in &info.destinations {
        assert_eq!(destination.outstanding_decisions, 2);
    }
}

#[tokio::test]
async fn s2_token_releases_the_inhibit() {
    let h = Harness::new(&[("trb-a", 2, 1), ("trb-b", 2, 1), ("trb-c", 2, 1)], 16, |_| {}).await;
    h.start(7).await;

    for n in 1..=6 {
        h.send_decision(7, n).await;
    }
    assert!(h.recv_inhibit(TIMEOUT).await.unwrap().busy);

    h.send_token(7, 1, "trb-a").await;

    let release = h.recv_inhibit(TIMEOUT).await.unwrap();
    assert_eq!(
        release,
        TriggerInhibit {
            busy: false,
            run_number: 7
        }
    );

    // the release inhibit is emitted after the completion is recorded, so
    // one info snapshot sees the whole effect
    let info = h.info().await;
    assert_eq!(info.tokens_received, 1);
    let trb_a = info
        .destinations
        .iter()
        .find(|d| d.name == "trb-a")
        .unwrap();
    assert_eq!(trb_a.outstanding_decisions, 1);
    assert_eq!(trb_a.completed_trigger_records, 1);
}

#[tokio::test]
async fn s3_error_skip_and_recovery() {
    // trb-a's channel holds one message and nobody drains it, so the
    // orchestrator's bounded sends to it time out
    let h = Harness::new(&[("trb-a", 1, 0), ("trb-b", 1, 0)], 1, |config| {
        config.general_queue_timeout = 30;
    })
    .await;
    h.io
        .get_sender::<TriggerDecision>("trb-a")
        .await
        .unwrap()
        .send(decision(0, 9999), TIMEOUT)
        .await
        .unwrap();

    h.start(1).await;

    // decision 1: dispatch to trb-a fails after retries, trb-b takes it
    h.send_decision(1, 1).await;
    let received = h.recv_at("trb-b", TIMEOUT).await.unwrap();
    assert_eq!(received.trigger_number, 1);

    // decision 2: trb-b is busy, trb-a is in error -> nothing moves
    h.send_decision(1, 2).await;
    assert!(h.recv_at("trb-b", QUIET).await.is_none());

    // freeing trb-b lets the parked decision through
    h.send_token(1, 1, "trb-b").await;
    let received = h.recv_at("trb-b", TIMEOUT).await.unwrap();
    assert_eq!(received.trigger_number, 2);

    // a token from trb-a clears its error flag; once its channel has room
    // again the next selection picks it
    let drained = h.recv_at("trb-a", TIMEOUT).await.unwrap();
    assert_eq!(drained.trigger_number, 9999);
    h.send_token(1, 9999, "trb-a").await;
    h.send_token(1, 2, "trb-b").await;
    assert!(h.wait_outstanding("trb-b", 0).await);

    h.send_decision(1, 3).await;
    let received = h.recv_at("trb-a", TIMEOUT).await.unwrap();
    assert_eq!(received.trigger_number, 3);
}

#[tokio::test]
async fn s4_foreign_run_messages_are_filtered() {
    let h = Harness::new(&[("trb-a", 2, 1)], 16, |_| {}).await;
    h.start(5).await;

    // foreign token and foreign decision: warnings only, no state change
    h.send_token(4, 1, "trb-a").await;
    h.io
        .get_sender::<TriggerDecision>("td")
        .await
        .unwrap()
        .send(decision(4, 1), TIMEOUT)
        .await
        .unwrap();
    assert!(h.recv_at("trb-a", QUIET).await.is_none());

    // a current-run decision still flows afterwards
    h.send_decision(5, 1).await;
    assert_eq!(h.recv_at("trb-a", TIMEOUT).await.unwrap().trigger_number, 1);

    let info = h.info().await;
    assert_eq!(info.tokens_received, 0);
    assert_eq!(info.decisions_received, 1);
}

#[tokio::test]
async fn s5_unknown_token_source_is_dropped() {
    let h = Harness::new(&[("trb-a", 2, 1)], 16, |_| {}).await;
    h.start(5).await;

    h.send_decision(5, 1).await;
    assert!(h.wait_outstanding("trb-a", 1).await);

    h.send_token(5, 1, "trb-z").await;
    tokio::time::sleep(QUIET).await;
    assert_eq!(h.outstanding_at("trb-a").await, 1);
    assert_eq!(h.info().await.tokens_received, 0);

    // the real destination still completes normally
    h.send_token(5, 1, "trb-a").await;
    assert!(h.wait_outstanding("trb-a", 0).await);
}

#[tokio::test]
async fn s6_stop_drains_and_reports_remnants() {
    let h = Harness::new(&[("trb-a", 3, 0), ("trb-b", 3, 0)], 16, |_| {}).await;
    h.start(2).await;

    // round robin: 1 -> trb-a, 2 -> trb-b, 3 -> trb-a
    for n in 1..=3 {
        h.send_decision(2, n).await;
    }
    assert!(h.wait_outstanding("trb-a", 2).await);

    let orchestrator = h.orchestrator.clone();
    let stop = tokio::spawn(async move { orchestrator.stop().await });

    // tokens landing inside the drain window still complete
    tokio::time::sleep(Duration::from_millis(60)).await;
    h.send_token(2, 1, "trb-a").await;
    h.send_token(2, 2, "trb-b").await;

    tokio::time::timeout(TIMEOUT, stop)
        .await
        .expect("stop drain must finish in bounded time")
        .unwrap()
        .unwrap();

    // decision 3 never completed: flushed, not silently kept
    let info = h.info().await;
    let trb_a = info
        .destinations
        .iter()
        .find(|d| d.name == "trb-a")
        .unwrap();
    let trb_b = info
        .destinations
        .iter()
        .find(|d| d.name == "trb-b")
        .unwrap();
    assert_eq!(trb_a.outstanding_decisions, 0);
    assert_eq!(trb_b.outstanding_decisions, 0);
    assert_eq!(trb_a.completed_trigger_records, 1);
    assert_eq!(trb_b.completed_trigger_records, 1);

    assert_eq!(info.tokens_received, 2);

    // tokens after the drain are ignored: callback is unbound
    h.send_token(2, 3, "trb-a").await;
    tokio::time::sleep(QUIET).await;
    assert_eq!(h.info().await.tokens_received, 0);
}

#[tokio::test]
async fn stop_cancels_a_parked_dispatcher() {
    let h = Harness::new(&[("trb-a", 1, 0)], 16, |config| {
        config.stop_timeout = 200;
    })
    .await;
    h.start(9).await;

    h.send_decision(9, 1).await;
    assert!(h.wait_outstanding("trb-a", 1).await);

    // the only destination is busy: this decision parks in the dispatcher
    h.send_decision(9, 2).await;
    tokio::time::sleep(QUIET).await;

    let started = Instant::now();
    tokio::time::timeout(TIMEOUT, h.orchestrator.stop())
        .await
        .expect("stop must cancel the parked dispatcher")
        .unwrap();
    assert!(started.elapsed() < TIMEOUT);

    // the unplaced decision is gone, the placed one was flushed as a remnant
    assert_eq!(h.outstanding_at("trb-a").await, 0);
}
