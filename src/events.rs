//! Messages flowing from worker threads to the single consumer that renders state.

use serde::{Deserialize, Serialize};
use std::sync::mpsc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Downloading,
    Finished,
    Success,
    Error,
    Cancelled,
    Info,
    Warning,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Downloading => "downloading",
            EventStatus::Finished => "finished",
            EventStatus::Success => "success",
            EventStatus::Error => "error",
            EventStatus::Cancelled => "cancelled",
            EventStatus::Info => "info",
            EventStatus::Warning => "warning",
        }
    }

    /// Every started task ends with exactly one terminal event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventStatus::Success | EventStatus::Error | EventStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub status: EventStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
    pub message: String,
}

impl ProgressEvent {
    pub fn new(task_id: &str, status: EventStatus, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            batch_id: None,
            status,
            percent: None,
            speed: None,
            eta: None,
            message: message.into(),
        }
    }

    pub fn downloading(
        task_id: &str,
        percent: f64,
        speed: Option<String>,
        eta: Option<String>,
    ) -> Self {
        let percent = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        Self {
            percent: Some(percent),
            speed,
            eta,
            ..Self::new(task_id, EventStatus::Downloading, format!("{percent:.1}%"))
        }
    }

    pub fn in_batch(mut self, batch_id: &str) -> Self {
        self.batch_id = Some(batch_id.to_string());
        self
    }
}

/// Sending half of the result channel. Cheap to clone, one per worker.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<ProgressEvent>,
}

impl EventSender {
    /// Sending never fails from the worker's point of view; a dropped consumer
    /// only means nobody is watching anymore.
    pub fn send(&self, event: ProgressEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("result channel closed; event dropped");
        }
    }
}

/// Receiving half, owned by the consumer thread.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<ProgressEvent>,
}

impl EventReceiver {
    /// Everything queued right now, without blocking.
    pub fn drain(&self) -> Vec<ProgressEvent> {
        self.rx.try_iter().collect()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<ProgressEvent> {
        self.rx.recv_timeout(timeout).ok()
    }
}

/// Unbounded, thread-safe channel from workers to the consumer.
pub fn result_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel();
    (EventSender { tx }, EventReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_omits_absent_fields() {
        let event = ProgressEvent::new("t1", EventStatus::Error, "boom");
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(json["status"], "error");
        assert_eq!(json["message"], "boom");
        assert!(json.get("percent").is_none());

        let event = ProgressEvent::downloading("t1", 150.0, Some("1MiB/s".into()), None);
        assert_eq!(event.percent, Some(100.0));
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(json["status"], "downloading");
        assert_eq!(json["speed"], "1MiB/s");
    }

    #[test]
    fn events_from_one_sender_keep_their_order() {
        let (tx, rx) = result_channel();
        let worker_tx = tx.clone();
        let handle = std::thread::spawn(move || {
            for i in 0..50 {
                worker_tx.send(ProgressEvent::downloading("t", i as f64, None, None));
            }
        });
        handle.join().expect("join");
        let seen: Vec<f64> = rx.drain().iter().filter_map(|e| e.percent).collect();
        assert_eq!(seen.len(), 50);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }
}
