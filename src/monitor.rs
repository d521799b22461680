//! Consumer side of the result channel: a single poll loop that routes events
//! by batch and keeps the overall percent of every tracked batch.

use crate::batch::BatchHandle;
use crate::events::{EventReceiver, ProgressEvent};
use crate::progress::BatchProgress;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MonitorUpdate {
    pub event: ProgressEvent,
    /// Overall percent of the event's batch; `None` for untracked events.
    pub overall_percent: Option<f64>,
}

pub struct BatchMonitor {
    receiver: EventReceiver,
    poll_interval: Duration,
    batches: HashMap<String, BatchProgress>,
}

impl BatchMonitor {
    pub fn new(receiver: EventReceiver, poll_interval: Duration) -> Self {
        Self {
            receiver,
            poll_interval,
            batches: HashMap::new(),
        }
    }

    pub fn track(&mut self, batch: &BatchHandle) {
        self.batches
            .entry(batch.id().to_string())
            .or_insert_with(|| BatchProgress::new(batch.total()));
    }

    pub fn percent(&self, batch_id: &str) -> Option<f64> {
        self.batches.get(batch_id).map(BatchProgress::percent)
    }

    /// Applies everything queued right now.
    pub fn poll(&mut self) -> Vec<MonitorUpdate> {
        self.receiver
            .drain()
            .into_iter()
            .map(|event| self.apply(event))
            .collect()
    }

    fn apply(&mut self, event: ProgressEvent) -> MonitorUpdate {
        let overall_percent = event
            .batch_id
            .as_deref()
            .and_then(|id| self.batches.get_mut(id))
            .map(|progress| progress.observe(&event));
        MonitorUpdate {
            event,
            overall_percent,
        }
    }

    /// Polls at the configured interval until `batch` is completed or aborted
    /// and every event it produced has been handed to `on_update`.
    pub fn run_until_settled(
        &mut self,
        batch: &BatchHandle,
        mut on_update: impl FnMut(&MonitorUpdate),
    ) -> f64 {
        self.track(batch);
        loop {
            // Terminal events are sent before a batch can settle, so checking the
            // phase first and draining afterwards never loses the tail.
            let settled = batch.status().phase.is_terminal();
            if let Some(event) = self.receiver.recv_timeout(self.poll_interval) {
                let update = self.apply(event);
                on_update(&update);
            }
            for update in self.poll() {
                on_update(&update);
            }
            if settled {
                break;
            }
        }
        self.percent(batch.id()).unwrap_or(0.0)
    }
}
