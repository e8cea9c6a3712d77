pub mod error;
pub mod messages;
pub mod orchestrator;
pub mod transport;

pub use error::{DaqflowError, OrchestratorError, Result, TransportError};
pub use messages::{TriggerDecision, TriggerDecisionToken, TriggerInhibit};
pub use orchestrator::{
    AssignedTriggerDecision, ConnectionNames, DataflowApplication, DestinationInfo,
    DestinationRegistry, DestinationSlot, OrchestratorConfig, OrchestratorInfo, SlotThresholds,
    StartParams, TriggerOrchestrator,
};
pub use transport::{ChannelReceiver, ChannelSender, IoManager};
