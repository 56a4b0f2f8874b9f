use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::events::trigger::{Trigger, TriggerEvent};

/// When the scheduler should start runs for one checkpoint environment.
#[derive(Debug, Clone)]
pub struct Schedule {
    environment: String,
    every: Option<Duration>,
    run_on_startup: bool,
}

impl Schedule {
    pub fn new(environment: impl Into<String>, every: Option<Duration>, run_on_startup: bool) -> Self {
        Self { environment: environment.into(), every, run_on_startup }
    }

    /// Start emitting triggers. At most one trigger waits in the queue; a tick
    /// that finds one already pending is dropped, so a slow run never builds
    /// a backlog of catch-up runs.
    pub fn start(self) -> PendingTriggers {
        let (sender, receiver) = mpsc::channel(1);
        if self.run_on_startup {
            let startup = TriggerEvent { environment: self.environment.clone(), trigger: Trigger::Startup };
            // Capacity 1 and nothing queued yet.
            let _ = sender.try_send(startup);
        }
        let ticker = self.every.map(|every| spawn_ticker(self.environment, every, sender));
        PendingTriggers { receiver, ticker }
    }
}

fn spawn_ticker(environment: String, every: Duration, sender: mpsc::Sender<TriggerEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let event = TriggerEvent { environment: environment.clone(), trigger: Trigger::Interval(every) };
            match sender.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(environment = %environment, "trigger already pending, tick dropped")
                }
                Err(TrySendError::Closed(_)) => break,
            }
        }
    })
}

/// Triggers produced by a started [`Schedule`]. Dropping it stops the ticker.
pub struct PendingTriggers {
    receiver: mpsc::Receiver<TriggerEvent>,
    ticker: Option<JoinHandle<()>>,
}

impl PendingTriggers {
    /// Next trigger, or `None` once nothing can produce one any more.
    pub async fn next(&mut self) -> Option<TriggerEvent> {
        self.receiver.recv().await
    }
}

impl Drop for PendingTriggers {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}
