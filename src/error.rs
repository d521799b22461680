use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("external tool is missing: {tool}")]
    DependencyMissing { tool: String },

    #[error("download canceled")]
    DownloadCancelled,

    #[error("requested format is not available: {format_id}")]
    FormatUnavailable { format_id: String },

    #[error("history could not be saved to {path}: {reason}")]
    HistoryPersistence { path: PathBuf, reason: String },

    #[error("external tool failed: {tool} (code={code:?}) {stderr}")]
    ExternalToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("external tool timed out after {secs}s: {tool}")]
    ExternalToolTimedOut { tool: String, secs: u64 },

    #[error("hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("dependency install failed: {0}")]
    InstallFailed(String),

    #[error("invalid settings: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used when a failure is reported on the result channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Network,
    DependencyMissing,
    Cancelled,
    FormatUnavailable,
    HistoryPersistence,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Network => "network",
            ErrorKind::DependencyMissing => "dependency_missing",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::FormatUnavailable => "format_unavailable",
            ErrorKind::HistoryPersistence => "history_persistence",
            ErrorKind::Internal => "internal",
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) | EngineError::Config(_) => ErrorKind::Validation,
            EngineError::Network(_) => ErrorKind::Network,
            EngineError::DependencyMissing { .. } => ErrorKind::DependencyMissing,
            EngineError::DownloadCancelled => ErrorKind::Cancelled,
            EngineError::FormatUnavailable { .. } => ErrorKind::FormatUnavailable,
            EngineError::HistoryPersistence { .. } => ErrorKind::HistoryPersistence,
            EngineError::ExternalToolFailed { stderr, .. } => classify_tool_stderr(stderr),
            EngineError::ExternalToolTimedOut { .. } => ErrorKind::Network,
            EngineError::HashMismatch { .. }
            | EngineError::InstallFailed(_)
            | EngineError::Json(_)
            | EngineError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Message shown to the user for a failed task, prefixed with its category.
    pub fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::Network => format!("network problem: {self}"),
            ErrorKind::DependencyMissing => format!(
                "{self}; install it from the tools menu or place it next to the application"
            ),
            ErrorKind::FormatUnavailable => {
                format!("{self}; pick another format from the format list")
            }
            _ => self.to_string(),
        }
    }
}

/// Maps the stderr of a failed fetch-engine run to an error category.
pub fn classify_tool_stderr(stderr: &str) -> ErrorKind {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("requested format is not available")
        || lower.contains("format is not available")
        || lower.contains("no video formats found")
    {
        return ErrorKind::FormatUnavailable;
    }
    if lower.contains("ffmpeg not found")
        || lower.contains("ffmpeg is not installed")
        || lower.contains("ffprobe and ffmpeg not found")
    {
        return ErrorKind::DependencyMissing;
    }
    const NETWORK_MARKERS: [&str; 9] = [
        "http error",
        "unable to download",
        "urlopen error",
        "connection refused",
        "connection reset",
        "timed out",
        "proxy",
        "name or service not known",
        "temporary failure in name resolution",
    ];
    if NETWORK_MARKERS.iter().any(|m| lower.contains(m)) {
        return ErrorKind::Network;
    }
    ErrorKind::Internal
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_classification_picks_format_before_network() {
        let stderr = "ERROR: [youtube] abc: Requested format is not available. Use --list-formats";
        assert_eq!(classify_tool_stderr(stderr), ErrorKind::FormatUnavailable);
        assert_eq!(
            classify_tool_stderr("ERROR: Unable to download webpage: HTTP Error 403: Forbidden"),
            ErrorKind::Network
        );
        assert_eq!(
            classify_tool_stderr("ERROR: Cannot connect to proxy."),
            ErrorKind::Network
        );
        assert_eq!(classify_tool_stderr("something odd"), ErrorKind::Internal);
    }

    #[test]
    fn tool_failure_kind_follows_stderr() {
        let err = EngineError::ExternalToolFailed {
            tool: "yt-dlp".to_string(),
            code: Some(1),
            stderr: "ERROR: Requested format is not available".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::FormatUnavailable);
        assert_eq!(EngineError::DownloadCancelled.kind(), ErrorKind::Cancelled);
    }
}
