//! Batches of download requests, their dispatcher thread and cancellation.

use crate::cancel::CancelToken;
use crate::config::EngineSettings;
use crate::events::{EventSender, EventStatus, ProgressEvent};
use crate::request::{redact_url_for_log, DownloadRequest};
use crate::worker::{Collaborators, Worker};
use crate::{EngineError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPhase {
    Idle,
    Dispatching,
    Draining,
    Completed,
    Aborted,
}

impl BatchPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchPhase::Idle => "idle",
            BatchPhase::Dispatching => "dispatching",
            BatchPhase::Draining => "draining",
            BatchPhase::Completed => "completed",
            BatchPhase::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchPhase::Completed | BatchPhase::Aborted)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchStatus {
    pub batch_id: String,
    pub phase: BatchPhase,
    pub total: usize,
    pub started: usize,
    pub completed: usize,
    pub discarded: usize,
    pub active: Vec<String>,
}

/// A request dropped at submit time, with the reason.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedRequest {
    pub url: String,
    pub reason: String,
}

/// Owns the collaborators and the reference to the most recent batch.
pub struct TaskManager {
    services: Collaborators,
    events: EventSender,
    settings: EngineSettings,
    current: Mutex<Option<BatchHandle>>,
}

impl TaskManager {
    pub fn new(services: Collaborators, events: EventSender, settings: EngineSettings) -> Self {
        Self {
            services,
            events,
            settings,
            current: Mutex::new(None),
        }
    }

    /// Validates `requests`, starts a dispatcher for the accepted ones and makes
    /// the new batch the current one.
    pub fn submit(&self, requests: Vec<DownloadRequest>) -> Result<BatchHandle> {
        if requests.is_empty() {
            return Err(EngineError::Validation("no download requests".to_string()));
        }

        let mut accepted = Vec::with_capacity(requests.len());
        let mut rejected = Vec::new();
        for request in requests {
            match request.validate() {
                Ok(()) => accepted.push(request),
                Err(err) => {
                    warn!(url = %redact_url_for_log(&request.url), error = %err, "request rejected");
                    rejected.push(RejectedRequest {
                        url: request.url,
                        reason: err.to_string(),
                    });
                }
            }
        }
        if accepted.is_empty() {
            return Err(EngineError::Validation(format!(
                "all {} requests are invalid",
                rejected.len()
            )));
        }

        let handle = BatchHandle::start(
            accepted,
            rejected,
            self.services.clone(),
            self.events.clone(),
            &self.settings,
            spawn_named,
        )?;
        *lock_recover(&self.current) = Some(handle.clone());
        Ok(handle)
    }

    pub fn current(&self) -> Option<BatchHandle> {
        lock_recover(&self.current).clone()
    }

    /// Aborts the current batch, if any.
    pub fn abort_current(&self) {
        if let Some(handle) = self.current() {
            handle.abort();
        }
    }
}

type WorkerBody = Box<dyn FnOnce() + Send + 'static>;

/// Starts one worker thread under the given name.
type SpawnWorker = fn(String, WorkerBody) -> std::io::Result<JoinHandle<()>>;

fn spawn_named(name: String, body: WorkerBody) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new().name(name).spawn(body)
}

struct WorkerHandle {
    thread: Option<JoinHandle<()>>,
    stop: CancelToken,
}

struct BatchState {
    phase: BatchPhase,
    started: usize,
    completed: usize,
    discarded: usize,
    dispatch_done: bool,
    registry: HashMap<String, WorkerHandle>,
}

impl BatchState {
    fn settle(&mut self, aborted: bool) {
        if self.phase.is_terminal() || !self.dispatch_done || !self.registry.is_empty() {
            return;
        }
        self.phase = if aborted {
            BatchPhase::Aborted
        } else {
            BatchPhase::Completed
        };
    }
}

struct BatchShared {
    id: String,
    total: usize,
    abort: CancelToken,
    join_timeout: Duration,
    state: Mutex<BatchState>,
    changed: Condvar,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl BatchShared {
    fn lock(&self) -> MutexGuard<'_, BatchState> {
        lock_recover(&self.state)
    }
}

/// Cloneable handle on one running batch.
#[derive(Clone)]
pub struct BatchHandle {
    shared: Arc<BatchShared>,
    tasks: Arc<Vec<(String, String)>>,
    rejected: Arc<Vec<RejectedRequest>>,
}

impl BatchHandle {
    fn start(
        requests: Vec<DownloadRequest>,
        rejected: Vec<RejectedRequest>,
        services: Collaborators,
        events: EventSender,
        settings: &EngineSettings,
        spawn: SpawnWorker,
    ) -> Result<Self> {
        let batch_id = uuid::Uuid::new_v4().to_string();
        let shared = Arc::new(BatchShared {
            id: batch_id.clone(),
            total: requests.len(),
            abort: CancelToken::new(),
            join_timeout: settings.worker_join_timeout(),
            state: Mutex::new(BatchState {
                phase: BatchPhase::Idle,
                started: 0,
                completed: 0,
                discarded: 0,
                dispatch_done: false,
                registry: HashMap::new(),
            }),
            changed: Condvar::new(),
            dispatcher: Mutex::new(None),
        });

        let (queue_tx, queue_rx) = mpsc::channel();
        let mut tasks = Vec::with_capacity(requests.len());
        for request in requests {
            let task_id = uuid::Uuid::new_v4().to_string();
            tasks.push((task_id.clone(), request.url.clone()));
            let _ = queue_tx.send((task_id, request));
        }
        drop(queue_tx);

        info!(
            batch_id = %batch_id,
            total = shared.total,
            rejected = rejected.len(),
            "batch submitted"
        );

        let dispatcher_shared = shared.clone();
        let wait = settings.dispatch_wait();
        let thread = thread::Builder::new()
            .name(format!("tubequeue-dispatch-{}", &batch_id[..8]))
            .spawn(move || {
                dispatch_loop(dispatcher_shared, queue_rx, services, events, wait, spawn)
            })?;
        *lock_recover(&shared.dispatcher) = Some(thread);

        Ok(Self {
            shared,
            tasks: Arc::new(tasks),
            rejected: Arc::new(rejected),
        })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn total(&self) -> usize {
        self.shared.total
    }

    /// `(task_id, url)` for every accepted request, in submission order.
    pub fn tasks(&self) -> &[(String, String)] {
        &self.tasks
    }

    pub fn rejected(&self) -> &[RejectedRequest] {
        &self.rejected
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.abort.is_cancelled()
    }

    pub fn status(&self) -> BatchStatus {
        let state = self.shared.lock();
        let mut active: Vec<String> = state.registry.keys().cloned().collect();
        active.sort();
        BatchStatus {
            batch_id: self.shared.id.clone(),
            phase: state.phase,
            total: self.shared.total,
            started: state.started,
            completed: state.completed,
            discarded: state.discarded,
            active,
        }
    }

    /// Stops the batch: pending requests are discarded, in-flight workers are
    /// signalled and waited for up to the join timeout each. Idempotent.
    pub fn abort(&self) {
        let handles = {
            let mut state = self.shared.lock();
            if state.phase.is_terminal() || !self.shared.abort.cancel() {
                return;
            }
            state.phase = BatchPhase::Draining;
            for handle in state.registry.values() {
                handle.stop.cancel();
            }
            let handles: Vec<(String, JoinHandle<()>)> = state
                .registry
                .iter_mut()
                .filter_map(|(id, h)| h.thread.take().map(|t| (id.clone(), t)))
                .collect();
            state.settle(true);
            self.shared.changed.notify_all();
            handles
        };
        info!(batch_id = %self.shared.id, in_flight = handles.len(), "batch abort requested");

        for (task_id, thread) in handles {
            join_bounded(thread, self.shared.join_timeout, &task_id);
        }
        let dispatcher = lock_recover(&self.shared.dispatcher).take();
        if let Some(thread) = dispatcher {
            join_bounded(thread, self.shared.join_timeout, "dispatcher");
        }
    }

    /// Stops one in-flight task. Returns false when it is not running.
    pub fn cancel_task(&self, task_id: &str) -> bool {
        let state = self.shared.lock();
        match state.registry.get(task_id) {
            Some(handle) => {
                let first = handle.stop.cancel();
                if first {
                    info!(batch_id = %self.shared.id, task_id, "task cancel requested");
                }
                true
            }
            None => false,
        }
    }

    /// Blocks until the batch is completed or aborted, up to `timeout`.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        while !state.phase.is_terminal() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.shared.changed.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

fn dispatch_loop(
    shared: Arc<BatchShared>,
    queue: mpsc::Receiver<(String, DownloadRequest)>,
    services: Collaborators,
    events: EventSender,
    wait: Duration,
    spawn: SpawnWorker,
) {
    {
        let mut state = shared.lock();
        if state.phase == BatchPhase::Idle {
            state.phase = BatchPhase::Dispatching;
        }
    }

    loop {
        let (task_id, request) = match queue.recv_timeout(wait) {
            Ok(next) => next,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        // The abort flag is read under the same lock `abort()` sets it under, so
        // no worker is spawned once `abort()` has taken its snapshot.
        let mut state = shared.lock();
        if shared.abort.is_cancelled() {
            state.discarded += 1;
            debug!(batch_id = %shared.id, task_id = %task_id, "request discarded");
            continue;
        }

        let worker = Worker::new(task_id.clone(), request, services.clone(), events.clone())
            .in_batch(&shared.id, shared.abort.clone());
        let stop = worker.stop_token();
        let guard_shared = shared.clone();
        let guard_task = task_id.clone();
        let spawned = spawn(
            format!("tubequeue-worker-{}", &task_id[..8.min(task_id.len())]),
            Box::new(move || {
                let _guard = RegistryGuard {
                    shared: guard_shared,
                    task_id: guard_task,
                };
                let outcome = worker.run();
                debug!(?outcome, "worker finished");
            }),
        );

        match spawned {
            Ok(thread) => {
                state.started += 1;
                state.registry.insert(
                    task_id,
                    WorkerHandle {
                        thread: Some(thread),
                        stop,
                    },
                );
            }
            Err(err) => {
                // The closure, and with it the guard, never ran: the task ends here.
                warn!(batch_id = %shared.id, task_id = %task_id, error = %err, "worker spawn failed");
                state.started += 1;
                state.completed += 1;
                events.send(
                    ProgressEvent::new(
                        &task_id,
                        EventStatus::Error,
                        format!("could not start download: {err}"),
                    )
                    .in_batch(&shared.id),
                );
            }
        }
    }

    let mut state = shared.lock();
    state.dispatch_done = true;
    state.settle(shared.abort.is_cancelled());
    shared.changed.notify_all();
    info!(
        batch_id = %shared.id,
        started = state.started,
        discarded = state.discarded,
        "dispatch finished"
    );
}

/// Removes the worker from the registry and counts it as completed, on every exit path.
struct RegistryGuard {
    shared: Arc<BatchShared>,
    task_id: String,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.registry.remove(&self.task_id);
        state.completed += 1;
        state.settle(self.shared.abort.is_cancelled());
        self.shared.changed.notify_all();
    }
}

fn join_bounded(thread: JoinHandle<()>, timeout: Duration, label: &str) {
    let deadline = Instant::now() + timeout;
    while !thread.is_finished() {
        if Instant::now() >= deadline {
            warn!(thread = label, timeout_ms = timeout.as_millis() as u64, "thread did not stop in time; detaching");
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    if thread.join().is_err() {
        warn!(thread = label, "thread panicked");
    }
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::engine::{FetchEngine, FetchOutcome, ProgressHook};
    use crate::events::result_channel;
    use crate::ffmpeg::Transcoder;
    use crate::history::HistoryStore;
    use crate::probe::MediaInfo;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingEngine {
        calls: AtomicUsize,
    }

    impl FetchEngine for CountingEngine {
        fn fetch(
            &self,
            _request: &DownloadRequest,
            _stop: &CancelToken,
            _on_progress: &mut ProgressHook<'_>,
        ) -> Result<FetchOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(FetchOutcome::default())
        }

        fn probe(&self, _url: &str, _proxy: Option<&str>) -> Result<MediaInfo> {
            Ok(MediaInfo::default())
        }
    }

    struct NoTranscoder;

    impl Transcoder for NoTranscoder {
        fn is_available(&self) -> bool {
            false
        }

        fn transcode(&self, input: &Path, _target_format: &str) -> Result<PathBuf> {
            Ok(input.to_path_buf())
        }
    }

    fn refuse_spawn(_name: String, _body: WorkerBody) -> std::io::Result<JoinHandle<()>> {
        Err(std::io::Error::new(
            std::io::ErrorKind::WouldBlock,
            "thread limit reached",
        ))
    }

    fn request(i: usize, save_path: &Path) -> DownloadRequest {
        DownloadRequest {
            url: format!("https://media.example.com/v{i}"),
            proxy: None,
            save_path: save_path.to_string_lossy().to_string(),
            format_id: "best".to_string(),
            download_subtitles: false,
            fragment_thread_count: 1,
            transcode: false,
            transcode_format: "mp4".to_string(),
        }
    }

    #[test]
    fn failed_worker_spawn_ends_task_with_error_event() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(CountingEngine::default());
        let services = Collaborators {
            engine: engine.clone(),
            transcoder: Arc::new(NoTranscoder),
            history: Arc::new(HistoryStore::open(dir.path().join("history.json"))),
        };
        let (events, receiver) = result_channel();
        let settings = EngineSettings {
            dispatch_wait_ms: 10,
            ..EngineSettings::default()
        };
        let requests: Vec<_> = (0..3).map(|i| request(i, dir.path())).collect();

        let batch = BatchHandle::start(
            requests,
            Vec::new(),
            services,
            events,
            &settings,
            refuse_spawn,
        )
        .expect("start");
        assert!(batch.wait(Duration::from_secs(10)), "batch did not settle");

        let status = batch.status();
        assert_eq!(status.phase, BatchPhase::Completed);
        assert_eq!(status.completed, 3);
        assert_eq!(status.discarded, 0);
        assert!(status.active.is_empty());
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);

        let seen = receiver.drain();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|e| e.status == EventStatus::Error));
        assert!(seen.iter().all(|e| e.batch_id.as_deref() == Some(batch.id())));
        let mut ids: Vec<&str> = seen.iter().map(|e| e.task_id.as_str()).collect();
        ids.sort();
        let mut expected: Vec<&str> = batch.tasks().iter().map(|(id, _)| id.as_str()).collect();
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[test]
    fn settle_waits_for_dispatch_and_registry() {
        let mut state = BatchState {
            phase: BatchPhase::Dispatching,
            started: 0,
            completed: 0,
            discarded: 0,
            dispatch_done: false,
            registry: HashMap::new(),
        };
        state.settle(false);
        assert_eq!(state.phase, BatchPhase::Dispatching);

        state.dispatch_done = true;
        state.settle(true);
        assert_eq!(state.phase, BatchPhase::Aborted);

        state.settle(false);
        assert_eq!(state.phase, BatchPhase::Aborted);
    }
}
