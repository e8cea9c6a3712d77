//! Orchestrator configuration and lifecycle payloads

use serde::{Deserialize, Serialize};

use crate::error::{DaqflowError, Result};

/// Mandatory connection names handed to the orchestrator at init.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionNames {
    /// Inbound completion-token stream.
    pub token_connection: String,
    /// Inbound trigger-decision stream.
    pub td_connection: String,
    /// Outbound inhibit stream.
    pub busy_connection: String,
}

/// Busy/free hysteresis thresholds for one trigger record builder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SlotThresholds {
    /// Outstanding count at which the destination turns busy.
    pub busy: u32,
    /// Outstanding count at which a busy destination frees up again.
    pub free: u32,
}

/// One downstream trigger record builder application.
///
/// `connection_uid` doubles as the name of the per-destination outbound
/// decision channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataflowApplication {
    pub connection_uid: String,
    pub thresholds: SlotThresholds,
}

/// `configure` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Configured destinations; iteration order is preserved and drives
    /// round-robin fairness.
    pub dataflow_applications: Vec<DataflowApplication>,
    /// Bounded-send timeout for every outbound message (ms).
    pub general_queue_timeout: u64,
    /// Total budget for draining outstanding assignments on stop (ms).
    pub stop_timeout: u64,
    /// Per-decision send attempt budget.
    pub td_send_retries: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            dataflow_applications: Vec::new(),
            general_queue_timeout: 100,
            stop_timeout: 1000,
            td_send_retries: 3,
        }
    }
}

impl OrchestratorConfig {
    /// Reject configurations the orchestrator cannot run with.
    pub fn validate(&self) -> Result<()> {
        for app in &self.dataflow_applications {
            if app.connection_uid.trim().is_empty() {
                return Err(DaqflowError::Validation(
                    "dataflow application with empty connection_uid".into(),
                ));
            }
            if app.thresholds.busy < app.thresholds.free {
                return Err(DaqflowError::Validation(format!(
                    "destination {}: busy threshold {} below free threshold {}",
                    app.connection_uid, app.thresholds.busy, app.thresholds.free
                )));
            }
            let duplicates = self
                .dataflow_applications
                .iter()
                .filter(|other| other.connection_uid == app.connection_uid)
                .count();
            if duplicates > 1 {
                return Err(DaqflowError::Validation(format!(
                    "duplicate dataflow application: {}",
                    app.connection_uid
                )));
            }
        }
        Ok(())
    }
}

/// `start` payload.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StartParams {
    /// Run number for the upcoming run; 0 if absent.
    pub run: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(uid: &str, busy: u32, free: u32) -> DataflowApplication {
        DataflowApplication {
            connection_uid: uid.to_string(),
            thresholds: SlotThresholds { busy, free },
        }
    }

    #[test]
    fn validate_accepts_sane_config() {
        let config = OrchestratorConfig {
            dataflow_applications: vec![app("trb-a", 2, 1), app("trb-b", 1, 0)],
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_thresholds_and_duplicates() {
        let inverted = OrchestratorConfig {
            dataflow_applications: vec![app("trb-a", 1, 2)],
            ..Default::default()
        };
        assert!(inverted.validate().is_err());

        let duplicated = OrchestratorConfig {
            dataflow_applications: vec![app("trb-a", 2, 1), app("trb-a", 2, 1)],
            ..Default::default()
        };
        assert!(duplicated.validate().is_err());
    }

    #[test]
    fn start_params_default_run_when_absent() {
        let params: StartParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params.run, 0);

        let params: StartParams = serde_json::from_str(r#"{"run": 7}"#).unwrap();
        assert_eq!(params.run, 7);
    }
}
