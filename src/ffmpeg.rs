use crate::cmd;
use crate::paths::AppPaths;
use crate::{EngineError, Result};
use std::path::{Path, PathBuf};

const AUDIO_ONLY_FORMATS: [&str; 6] = ["mp3", "m4a", "aac", "wav", "flac", "opus"];

/// Contract with the external merge/transcode tool.
pub trait Transcoder: Send + Sync {
    fn is_available(&self) -> bool;

    /// Re-encodes `input` next to itself with the extension `target_format`.
    fn transcode(&self, input: &Path, target_format: &str) -> Result<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(paths: &AppPaths) -> Self {
        Self {
            program: paths.ffmpeg_cmd(),
        }
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn version(&self) -> Option<String> {
        cmd::tool_version_first_line(&self.program, "-version")
    }
}

impl Transcoder for FfmpegTranscoder {
    fn is_available(&self) -> bool {
        self.version().is_some()
    }

    fn transcode(&self, input: &Path, target_format: &str) -> Result<PathBuf> {
        let output_path = transcode_output_path(input, target_format)?;

        let mut command = cmd::command(&self.program);
        command.args(["-nostdin", "-y", "-loglevel", "error"]).arg("-i").arg(input);
        if AUDIO_ONLY_FORMATS.contains(&target_format.trim().to_ascii_lowercase().as_str()) {
            command.arg("-vn");
        }
        let output = command.arg(&output_path).output().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::DependencyMissing {
                tool: "ffmpeg".to_string(),
            },
            _ => EngineError::Io(e),
        })?;

        if !output.status.success() {
            let _ = std::fs::remove_file(&output_path);
            return Err(EngineError::ExternalToolFailed {
                tool: "ffmpeg".to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(output_path)
    }
}

fn transcode_output_path(input: &Path, target_format: &str) -> Result<PathBuf> {
    let ext = target_format.trim().trim_start_matches('.').to_ascii_lowercase();
    if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(EngineError::Validation(format!(
            "invalid transcode format: {target_format:?}"
        )));
    }
    let same_ext = input
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(&ext));
    if same_ext {
        // ffmpeg cannot write over its own input.
        let stem = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output");
        return Ok(input.with_file_name(format!("{stem}.transcoded.{ext}")));
    }
    Ok(input.with_extension(ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_path_changes_extension() {
        let out = transcode_output_path(Path::new("/tmp/clip.webm"), "mp4").expect("path");
        assert_eq!(out, PathBuf::from("/tmp/clip.mp4"));

        let out = transcode_output_path(Path::new("/tmp/clip.mp4"), ".MP4").expect("path");
        assert_eq!(out, PathBuf::from("/tmp/clip.transcoded.mp4"));

        assert!(transcode_output_path(Path::new("/tmp/clip.mp4"), "../x").is_err());
        assert!(transcode_output_path(Path::new("/tmp/clip.mp4"), "").is_err());
    }

    #[test]
    fn missing_ffmpeg_is_unavailable() {
        let tool = FfmpegTranscoder::with_program("definitely-not-a-real-ffmpeg");
        assert!(!tool.is_available());
        let err = tool
            .transcode(Path::new("/tmp/clip.webm"), "mp4")
            .expect_err("must fail");
        assert!(matches!(err, EngineError::DependencyMissing { .. }));
    }
}
