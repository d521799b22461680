//! Batch-level progress from many independent per-task progress streams.

use crate::events::{EventStatus, ProgressEvent};
use std::collections::{HashMap, HashSet};

/// `(completed + current_task_percent / 100) / total * 100`, clamped to `0..=100`.
///
/// With several tasks in flight, `current_task_percent` is the sum of their percents.
pub fn overall_percent(completed: usize, total: usize, current_task_percent: f64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let current = if current_task_percent.is_finite() {
        current_task_percent.max(0.0)
    } else {
        0.0
    };
    let value = (completed as f64 + current / 100.0) / total as f64 * 100.0;
    value.clamp(0.0, 100.0)
}

/// Folds the events of one batch into a non-decreasing overall percent.
#[derive(Debug, Clone)]
pub struct BatchProgress {
    total: usize,
    in_flight: HashMap<String, f64>,
    done: HashSet<String>,
    last: f64,
}

impl BatchProgress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            in_flight: HashMap::new(),
            done: HashSet::new(),
            last: 0.0,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn completed(&self) -> usize {
        self.done.len()
    }

    pub fn percent(&self) -> f64 {
        self.last
    }

    pub fn is_task_done(&self, task_id: &str) -> bool {
        self.done.contains(task_id)
    }

    /// Applies one event and returns the updated overall percent.
    pub fn observe(&mut self, event: &ProgressEvent) -> f64 {
        if self.done.contains(&event.task_id) {
            return self.last;
        }
        if event.status.is_terminal() {
            self.in_flight.remove(&event.task_id);
            self.done.insert(event.task_id.clone());
        } else if matches!(event.status, EventStatus::Downloading | EventStatus::Finished) {
            if let Some(percent) = event.percent.filter(|p| p.is_finite()) {
                // Multi-stream downloads restart at 0 for each stream.
                let slot = self.in_flight.entry(event.task_id.clone()).or_insert(0.0);
                *slot = slot.max(percent.clamp(0.0, 100.0));
            }
        }

        let current: f64 = self.in_flight.values().sum();
        let value = overall_percent(self.done.len(), self.total, current);
        self.last = self.last.max(value);
        self.last
    }
}
