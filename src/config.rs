use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Proxy applied to requests that do not carry their own.
    pub proxy: Option<String>,
    /// Output folder used when a request leaves `save_path` empty.
    pub save_path: Option<String>,
    pub format_id: String,
    pub fragment_thread_count: u32,
    pub download_subtitles: bool,
    pub transcode_format: String,
    /// Interval of the consumer poll loop draining the result channel.
    pub poll_interval_ms: u64,
    /// Bounded wait of the dispatcher on the batch queue between abort checks.
    pub dispatch_wait_ms: u64,
    pub worker_join_timeout_ms: u64,
    /// Hard limit on one fetch-engine run; 0 disables it.
    pub engine_timeout_secs: u64,
    pub ytdlp_sources: Vec<String>,
    pub ffmpeg_sources: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            proxy: None,
            save_path: None,
            format_id: "best".to_string(),
            fragment_thread_count: 4,
            download_subtitles: false,
            transcode_format: "mp4".to_string(),
            poll_interval_ms: 100,
            dispatch_wait_ms: 200,
            worker_join_timeout_ms: 5_000,
            engine_timeout_secs: 7_200,
            ytdlp_sources: Vec::new(),
            ffmpeg_sources: Vec::new(),
        }
    }
}

impl EngineSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn dispatch_wait(&self) -> Duration {
        Duration::from_millis(self.dispatch_wait_ms.max(10))
    }

    pub fn worker_join_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_join_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.fragment_thread_count == 0 {
            return Err(EngineError::Config(
                "fragment_thread_count must be at least 1".to_string(),
            ));
        }
        if self.format_id.trim().is_empty() {
            return Err(EngineError::Config("format_id is empty".to_string()));
        }
        Ok(())
    }
}

pub fn load_settings(paths: &AppPaths) -> Result<EngineSettings> {
    let path = paths.settings_path();
    if !path.exists() {
        return Ok(EngineSettings::default());
    }
    let bytes = std::fs::read(&path)?;
    let parsed: EngineSettings = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::Config(format!(
            "failed to parse settings at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn save_settings(paths: &AppPaths, settings: &EngineSettings) -> Result<()> {
    settings.validate()?;
    let path = paths.settings_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}
