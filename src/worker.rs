//! Runs exactly one download request and reports it on the result channel.

use crate::cancel::CancelToken;
use crate::engine::{FetchEngine, FetchOutcome, HookAction, NativeProgress, NativeStatus};
use crate::error::ErrorKind;
use crate::events::{EventSender, EventStatus, ProgressEvent};
use crate::ffmpeg::Transcoder;
use crate::history::{HistoryEntry, HistoryStore};
use crate::request::{redact_url_for_log, DownloadRequest};
use crate::{EngineError, Result};
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// External collaborators shared by every worker of a manager.
#[derive(Clone)]
pub struct Collaborators {
    pub engine: Arc<dyn FetchEngine>,
    pub transcoder: Arc<dyn Transcoder>,
    pub history: Arc<HistoryStore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Cancelled,
    Failed(ErrorKind),
}

pub struct Worker {
    task_id: String,
    batch_id: Option<String>,
    request: DownloadRequest,
    services: Collaborators,
    events: EventSender,
    batch_abort: CancelToken,
    stop: CancelToken,
}

impl Worker {
    pub fn new(
        task_id: impl Into<String>,
        request: DownloadRequest,
        services: Collaborators,
        events: EventSender,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            batch_id: None,
            request,
            services,
            events,
            batch_abort: CancelToken::new(),
            stop: CancelToken::new(),
        }
    }

    /// Ties the worker to a batch: its events carry `batch_id` and it observes `abort`.
    pub fn in_batch(mut self, batch_id: &str, abort: CancelToken) -> Self {
        self.batch_id = Some(batch_id.to_string());
        self.batch_abort = abort;
        self
    }

    /// Token that stops only this worker.
    pub fn stop_token(&self) -> CancelToken {
        self.stop.clone()
    }

    /// Emits progress events followed by exactly one terminal event. Never panics.
    pub fn run(self) -> TaskOutcome {
        let emitter = Emitter {
            events: &self.events,
            task_id: &self.task_id,
            batch_id: self.batch_id.as_deref(),
            terminal: Cell::new(None),
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.execute(&emitter)));
        let outcome = match result {
            Ok(Ok(())) => TaskOutcome::Succeeded,
            Ok(Err(EngineError::DownloadCancelled)) => {
                info!(task_id = %self.task_id, "download cancelled");
                emitter.emit(ProgressEvent::new(
                    &self.task_id,
                    EventStatus::Cancelled,
                    "download cancelled",
                ));
                TaskOutcome::Cancelled
            }
            Ok(Err(err)) => {
                let kind = err.kind();
                warn!(
                    task_id = %self.task_id,
                    url = %redact_url_for_log(&self.request.url),
                    kind = kind.as_str(),
                    error = %err,
                    "download failed"
                );
                emitter.emit(ProgressEvent::new(
                    &self.task_id,
                    EventStatus::Error,
                    err.user_message(),
                ));
                TaskOutcome::Failed(kind)
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!(task_id = %self.task_id, panic = %reason, "worker panicked");
                emitter.emit(ProgressEvent::new(
                    &self.task_id,
                    EventStatus::Error,
                    format!("internal error: {reason}"),
                ));
                match emitter.terminal.get() {
                    Some(EventStatus::Success) => TaskOutcome::Succeeded,
                    Some(EventStatus::Cancelled) => TaskOutcome::Cancelled,
                    _ => TaskOutcome::Failed(ErrorKind::Internal),
                }
            }
        };

        debug_assert!(emitter.terminal.get().is_some());
        outcome
    }

    fn is_stopped(&self) -> bool {
        self.batch_abort.is_cancelled() || self.stop.is_cancelled()
    }

    fn execute(&self, emitter: &Emitter<'_>) -> Result<()> {
        let selector = self.request.format()?;
        if selector.requires_transcode_tool() && !self.services.transcoder.is_available() {
            return Err(EngineError::DependencyMissing {
                tool: "ffmpeg".to_string(),
            });
        }
        if self.is_stopped() {
            return Err(EngineError::DownloadCancelled);
        }

        let url = redact_url_for_log(&self.request.url);
        info!(task_id = %self.task_id, url = %url, format = %self.request.format_id, "download started");
        emitter.emit(ProgressEvent::new(
            &self.task_id,
            EventStatus::Info,
            format!("starting {url}"),
        ));

        let mut halted = false;
        let mut hook = |native: &NativeProgress| -> HookAction {
            if halted || self.is_stopped() {
                halted = true;
                return HookAction::Stop;
            }
            if let Some(event) = translate(&self.task_id, native) {
                emitter.emit(event);
            }
            HookAction::Continue
        };
        let fetched = self
            .services
            .engine
            .fetch(&self.request, &self.stop, &mut hook);
        if halted {
            return Err(EngineError::DownloadCancelled);
        }
        let fetched = fetched?;

        self.complete(emitter, &fetched);
        Ok(())
    }

    fn complete(&self, emitter: &Emitter<'_>, fetched: &FetchOutcome) {
        let title = fetched
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(self.request.url.as_str())
            .to_string();

        emitter.emit(ProgressEvent {
            percent: Some(100.0),
            ..ProgressEvent::new(&self.task_id, EventStatus::Finished, "download finished")
        });
        emitter.emit(ProgressEvent::new(
            &self.task_id,
            EventStatus::Success,
            format!("downloaded: {title}"),
        ));
        info!(task_id = %self.task_id, title = %title, "download succeeded");

        self.services.history.append(HistoryEntry::now(
            &self.request.url,
            &title,
            &self.request.format_id,
            &self.request.save_path,
        ));

        if self.request.transcode {
            self.transcode(emitter, fetched.output_path.as_deref());
        }
    }

    /// Transcode outcome is reported as a note; the download already succeeded.
    fn transcode(&self, emitter: &Emitter<'_>, output: Option<&Path>) {
        let target = self.request.transcode_format.trim();
        let note = match output {
            None => Err("transcode skipped: downloaded file location is unknown".to_string()),
            Some(_) if !self.services.transcoder.is_available() => {
                Err("transcode skipped: ffmpeg is not available".to_string())
            }
            Some(input) => self
                .services
                .transcoder
                .transcode(input, target)
                .map(|out| format!("transcoded to {}", out.display()))
                .map_err(|e| format!("transcode to {target} failed: {e}")),
        };
        match note {
            Ok(message) => {
                info!(task_id = %self.task_id, "{message}");
                emitter.emit(ProgressEvent::new(&self.task_id, EventStatus::Info, message));
            }
            Err(message) => {
                warn!(task_id = %self.task_id, "{message}");
                emitter.emit(ProgressEvent::new(&self.task_id, EventStatus::Warning, message));
            }
        }
    }
}

fn translate(task_id: &str, native: &NativeProgress) -> Option<ProgressEvent> {
    match native.status {
        NativeStatus::Downloading => {
            let percent = native.percent?;
            Some(ProgressEvent::downloading(
                task_id,
                percent,
                native.speed.clone(),
                native.eta.clone(),
            ))
        }
        NativeStatus::Finished => Some(ProgressEvent::downloading(
            task_id,
            100.0,
            native.speed.clone(),
            None,
        )),
        NativeStatus::Processing => {
            let note = native.note.as_deref().unwrap_or("post-processing");
            Some(ProgressEvent::new(task_id, EventStatus::Info, note))
        }
    }
}

/// Stamps events with the batch id and lets through at most one terminal event.
struct Emitter<'a> {
    events: &'a EventSender,
    task_id: &'a str,
    batch_id: Option<&'a str>,
    terminal: Cell<Option<EventStatus>>,
}

impl Emitter<'_> {
    fn emit(&self, mut event: ProgressEvent) {
        if event.status.is_terminal() {
            if let Some(previous) = self.terminal.get() {
                debug!(
                    task_id = self.task_id,
                    previous = previous.as_str(),
                    dropped = event.status.as_str(),
                    "second terminal event dropped"
                );
                return;
            }
            self.terminal.set(Some(event.status));
        }
        if let Some(batch_id) = self.batch_id {
            event = event.in_batch(batch_id);
        }
        self.events.send(event);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
