//! Contract with the external fetch engine that actually retrieves media.

use crate::cancel::CancelToken;
use crate::probe::MediaInfo;
use crate::request::DownloadRequest;
use crate::Result;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeStatus {
    Downloading,
    /// One stream file finished; the engine may continue with the next one.
    Finished,
    /// Post-processing such as merging streams.
    Processing,
}

/// Progress as reported by the engine, before translation into a `ProgressEvent`.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeProgress {
    pub status: NativeStatus,
    pub percent: Option<f64>,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub note: Option<String>,
}

impl NativeProgress {
    pub fn downloading(percent: f64) -> Self {
        Self {
            status: NativeStatus::Downloading,
            percent: Some(percent),
            speed: None,
            eta: None,
            note: None,
        }
    }
}

/// Answer of the progress hook to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    Continue,
    Stop,
}

pub type ProgressHook<'a> = dyn FnMut(&NativeProgress) -> HookAction + 'a;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    pub title: Option<String>,
    pub output_path: Option<PathBuf>,
}

pub trait FetchEngine: Send + Sync {
    /// Downloads one request, calling `on_progress` for every native progress report.
    ///
    /// The engine stops as soon as it can once `on_progress` returns
    /// [`HookAction::Stop`] or `stop` is cancelled, and then returns
    /// `EngineError::DownloadCancelled`. Stopping is best effort.
    fn fetch(
        &self,
        request: &DownloadRequest,
        stop: &CancelToken,
        on_progress: &mut ProgressHook<'_>,
    ) -> Result<FetchOutcome>;

    fn probe(&self, url: &str, proxy: Option<&str>) -> Result<MediaInfo>;
}
