//! Global-busy inhibit signalling with an only-on-change contract

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::messages::TriggerInhibit;
use crate::transport::ChannelSender;

/// Emits `TriggerInhibit` upstream, suppressing no-op transitions.
///
/// The check/send/store sequence is serialized behind one lock so two
/// racing reevaluations (decision path vs token path) can neither skip a
/// transition nor emit the same value twice in a row.
pub struct InhibitSignaller {
    sender: ChannelSender<TriggerInhibit>,
    last_notified_busy: Mutex<bool>,
}

impl InhibitSignaller {
    pub fn new(sender: ChannelSender<TriggerInhibit>) -> Self {
        Self {
            sender,
            last_notified_busy: Mutex::new(false),
        }
    }

    /// Forget the last emitted value; the next `notify(true)` will emit.
    pub async fn reset(&self) {
        *self.last_notified_busy.lock().await = false;
    }

    /// Emit `TriggerInhibit { busy }` iff it differs from the last emitted
    /// value. Transport failures are retried until the send lands or
    /// `running` clears.
    pub async fn notify(
        &self,
        busy: bool,
        run_number: u64,
        timeout: Duration,
        running: &AtomicBool,
    ) {
        let mut last = self.last_notified_busy.lock().await;
        if *last == busy {
            return;
        }

        loop {
            match self
                .sender
                .send(TriggerInhibit { busy, run_number }, timeout)
                .await
            {
                Ok(()) => break,
                Err(err) => {
                    warn!(connection = self.sender.name(), error = %err, "inhibit send failed");
                }
            }
            if !running.load(Ordering::SeqCst) {
                break;
            }
        }

        *last = busy;
        debug!(busy, run_number, "trigger inhibit updated");
    }
}
