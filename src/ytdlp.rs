use crate::cancel::CancelToken;
use crate::cmd;
use crate::config::EngineSettings;
use crate::engine::{FetchEngine, FetchOutcome, HookAction, NativeProgress, NativeStatus, ProgressHook};
use crate::error::{classify_tool_stderr, ErrorKind};
use crate::format::FormatSelector;
use crate::paths::AppPaths;
use crate::probe::MediaInfo;
use crate::request::{redact_url_for_log, DownloadRequest};
use crate::{EngineError, Result};
use regex::Regex;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{mpsc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const TOOL: &str = "yt-dlp";
const TITLE_MARK: &str = "[title] ";
const FILE_MARK: &str = "[file] ";
// `--print` implies `--quiet`, which hides the post-processor log lines.
const POSTPROCESS_PRINT: &str = "post_process:[PostProcess] finished %(filepath)s";
const PROGRESS_TEMPLATE: &str =
    "download:[progress] %(progress._percent_str)s|%(progress._speed_str)s|%(progress._eta_str)s";
const PROBE_TIMEOUT_SECS: u64 = 120;
const SOCKET_TIMEOUT_SECS: &str = "10";
const EXTERNAL_CMD_POLL_INTERVAL_MS: u64 = 200;
const STDERR_TAIL_BYTES: usize = 16 * 1024;

/// Fetch engine backed by the `yt-dlp` executable.
#[derive(Debug, Clone)]
pub struct YtDlpEngine {
    program: PathBuf,
    ffmpeg_location: Option<PathBuf>,
    timeout_secs: u64,
}

impl YtDlpEngine {
    pub fn new(paths: &AppPaths, settings: &EngineSettings) -> Self {
        let ffmpeg = paths.ffmpeg_bin_path();
        Self {
            program: paths.ytdlp_cmd(),
            ffmpeg_location: ffmpeg.exists().then_some(ffmpeg),
            timeout_secs: settings.engine_timeout_secs,
        }
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ffmpeg_location: None,
            timeout_secs: 0,
        }
    }

    fn download_args(&self, request: &DownloadRequest, selector: &FormatSelector) -> Vec<String> {
        let mut args: Vec<String> = [
            "--newline",
            "--no-colors",
            "--no-playlist",
            "--no-simulate",
            "--progress",
            "--progress-template",
            PROGRESS_TEMPLATE,
            "--print",
            "before_dl:[title] %(title)s",
            "--print",
            POSTPROCESS_PRINT,
            "--print",
            "after_move:[file] %(filepath)s",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        args.push("-f".to_string());
        args.push(selector.engine_arg());
        args.push("--concurrent-fragments".to_string());
        args.push(request.fragment_thread_count.max(1).to_string());
        args.push("-o".to_string());
        args.push(
            PathBuf::from(request.save_path.trim())
                .join("%(title)s.%(ext)s")
                .to_string_lossy()
                .to_string(),
        );

        if selector.is_audio_only() {
            args.push("--extract-audio".to_string());
        }
        if request.download_subtitles {
            args.push("--write-subs".to_string());
        }
        if let Some(proxy) = request.proxy.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            args.push("--proxy".to_string());
            args.push(proxy.to_string());
        }
        if let Some(ffmpeg) = self.ffmpeg_location.as_ref() {
            args.push("--ffmpeg-location".to_string());
            args.push(ffmpeg.to_string_lossy().to_string());
        }

        args.push("--".to_string());
        args.push(request.url.trim().to_string());
        args
    }

    fn probe_args(url: &str, proxy: Option<&str>) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-J".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--socket-timeout".to_string(),
            SOCKET_TIMEOUT_SECS.to_string(),
        ];
        if let Some(proxy) = proxy.map(str::trim).filter(|p| !p.is_empty()) {
            args.push("--proxy".to_string());
            args.push(proxy.to_string());
        }
        args.push("--".to_string());
        args.push(url.trim().to_string());
        args
    }
}

impl FetchEngine for YtDlpEngine {
    fn fetch(
        &self,
        request: &DownloadRequest,
        stop: &CancelToken,
        on_progress: &mut ProgressHook<'_>,
    ) -> Result<FetchOutcome> {
        let selector = request.format()?;
        let mut command = cmd::command(&self.program);
        command.args(self.download_args(request, &selector));
        debug!(url = %redact_url_for_log(&request.url), format = %selector.engine_arg(), "starting yt-dlp");

        let mut outcome = FetchOutcome::default();
        let run = run_streaming(&mut command, stop, self.timeout_secs, &mut |line| {
            if let Some(title) = line.strip_prefix(TITLE_MARK) {
                outcome.title = Some(title.trim().to_string());
                return HookAction::Continue;
            }
            if let Some(path) = line.strip_prefix(FILE_MARK) {
                outcome.output_path = Some(PathBuf::from(path.trim()));
                return HookAction::Continue;
            }
            match parse_progress_line(line) {
                Some(progress) => on_progress(&progress),
                None => HookAction::Continue,
            }
        });

        let run = run.map_err(|e| e.into_engine_error(TOOL))?;
        if run.status.success() {
            return Ok(outcome);
        }
        Err(failure_from_stderr(run.status.code(), &run.stderr, request))
    }

    fn probe(&self, url: &str, proxy: Option<&str>) -> Result<MediaInfo> {
        let mut command = cmd::command(&self.program);
        command.args(Self::probe_args(url, proxy));

        let mut json = String::new();
        let never = CancelToken::new();
        let run = run_streaming(&mut command, &never, PROBE_TIMEOUT_SECS, &mut |line| {
            json.push_str(line);
            HookAction::Continue
        })
        .map_err(|e| e.into_engine_error(TOOL))?;

        if !run.status.success() {
            return Err(EngineError::ExternalToolFailed {
                tool: TOOL.to_string(),
                code: run.status.code(),
                stderr: run.stderr,
            });
        }
        Ok(serde_json::from_str(&json)?)
    }
}

fn failure_from_stderr(code: Option<i32>, stderr: &str, request: &DownloadRequest) -> EngineError {
    let last_error = stderr
        .lines()
        .rev()
        .find(|l| l.contains("ERROR"))
        .unwrap_or_else(|| stderr.lines().last().unwrap_or("unknown error"))
        .trim()
        .to_string();
    match classify_tool_stderr(stderr) {
        ErrorKind::FormatUnavailable => EngineError::FormatUnavailable {
            format_id: request.format_id.clone(),
        },
        ErrorKind::Network => EngineError::Network(last_error),
        ErrorKind::DependencyMissing => EngineError::DependencyMissing {
            tool: "ffmpeg".to_string(),
        },
        _ => EngineError::ExternalToolFailed {
            tool: TOOL.to_string(),
            code,
            stderr: last_error,
        },
    }
}

/// Translates one stdout line of yt-dlp into native progress, if it is one.
pub fn parse_progress_line(line: &str) -> Option<NativeProgress> {
    static TEMPLATE_RE: OnceLock<Regex> = OnceLock::new();
    static DEFAULT_RE: OnceLock<Regex> = OnceLock::new();
    static POSTPROCESS_RE: OnceLock<Regex> = OnceLock::new();

    let template_re = TEMPLATE_RE
        .get_or_init(|| Regex::new(r"^\[progress\]\s*([\d.]+)%\s*\|([^|]*)\|(.*)$").unwrap());
    let default_re = DEFAULT_RE.get_or_init(|| {
        Regex::new(r"^\[download\]\s+([\d.]+)%(?:\s+of\s+~?\s*\S+)?(?:\s+at\s+(\S+))?(?:\s+ETA\s+(\S+))?")
            .unwrap()
    });
    let postprocess_re = POSTPROCESS_RE
        .get_or_init(|| Regex::new(r"^\[(PostProcess|Merger|ExtractAudio|VideoConvertor|FixupM3u8)\]\s*(.*)$").unwrap());

    let line = line.trim();
    if let Some(caps) = template_re.captures(line).or_else(|| default_re.captures(line)) {
        let percent: f64 = caps.get(1)?.as_str().parse().ok()?;
        let speed = caps.get(2).and_then(|m| display_field(m.as_str()));
        let eta = caps.get(3).and_then(|m| display_field(m.as_str()));
        let status = if percent >= 100.0 {
            NativeStatus::Finished
        } else {
            NativeStatus::Downloading
        };
        return Some(NativeProgress {
            status,
            percent: Some(percent.clamp(0.0, 100.0)),
            speed,
            eta,
            note: None,
        });
    }

    if let Some(caps) = postprocess_re.captures(line) {
        return Some(NativeProgress {
            status: NativeStatus::Processing,
            percent: None,
            speed: None,
            eta: None,
            note: Some(format!("{} {}", caps.get(1)?.as_str(), caps.get(2)?.as_str().trim())),
        });
    }
    None
}

fn display_field(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "NA" || trimmed.eq_ignore_ascii_case("unknown") {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[derive(Debug)]
pub(crate) enum CommandRunError {
    Spawn(std::io::Error),
    Wait(std::io::Error),
    Canceled,
    TimedOut(u64),
}

impl CommandRunError {
    pub(crate) fn into_engine_error(self, tool: &str) -> EngineError {
        match self {
            CommandRunError::Spawn(e) if e.kind() == std::io::ErrorKind::NotFound => {
                EngineError::DependencyMissing {
                    tool: tool.to_string(),
                }
            }
            CommandRunError::Spawn(e) | CommandRunError::Wait(e) => EngineError::Io(e),
            CommandRunError::Canceled => EngineError::DownloadCancelled,
            CommandRunError::TimedOut(secs) => EngineError::ExternalToolTimedOut {
                tool: tool.to_string(),
                secs,
            },
        }
    }
}

#[derive(Debug)]
pub(crate) struct StreamedRun {
    pub status: ExitStatus,
    pub stderr: String,
}

/// Runs `cmd`, feeding each stdout line to `on_line` as it arrives.
///
/// The child is killed when `on_line` answers [`HookAction::Stop`], when `stop`
/// is cancelled, or when `timeout_secs` (if non-zero) elapses. No line is passed
/// to `on_line` after a stop was requested.
pub(crate) fn run_streaming(
    cmd: &mut Command,
    stop: &CancelToken,
    timeout_secs: u64,
    on_line: &mut dyn FnMut(&str) -> HookAction,
) -> std::result::Result<StreamedRun, CommandRunError> {
    use std::io::ErrorKind;

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(CommandRunError::Spawn)?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CommandRunError::Wait(std::io::Error::new(ErrorKind::Other, "stdout pipe missing")))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| CommandRunError::Wait(std::io::Error::new(ErrorKind::Other, "stderr pipe missing")))?;

    let (line_tx, line_rx) = mpsc::channel::<String>();
    let stdout_handle = thread::spawn(move || {
        for line in BufReader::new(stdout).lines() {
            let Ok(line) = line else { break };
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });
    let stderr_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf);
        let start = buf.len().saturating_sub(STDERR_TAIL_BYTES);
        String::from_utf8_lossy(&buf[start..]).trim().to_string()
    });

    let started = Instant::now();
    let poll = Duration::from_millis(EXTERNAL_CMD_POLL_INTERVAL_MS);
    let mut abort_reason: Option<CommandRunError> = None;

    loop {
        match line_rx.recv_timeout(poll) {
            Ok(line) => {
                if on_line(&line) == HookAction::Stop {
                    abort_reason = Some(CommandRunError::Canceled);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        if abort_reason.is_none() && stop.is_cancelled() {
            abort_reason = Some(CommandRunError::Canceled);
        }
        if abort_reason.is_none()
            && timeout_secs > 0
            && started.elapsed() >= Duration::from_secs(timeout_secs)
        {
            warn!(timeout_secs, "external command timed out; killing it");
            abort_reason = Some(CommandRunError::TimedOut(timeout_secs));
        }
        if abort_reason.is_some() {
            break;
        }
    }

    if let Some(reason) = abort_reason {
        // Grandchildren may keep the pipes open; the reader threads end on their own.
        cmd::kill_child_process_tree(&mut child);
        return Err(reason);
    }

    let status = child.wait().map_err(CommandRunError::Wait)?;
    let _ = stdout_handle.join();
    let stderr = stderr_handle.join().unwrap_or_default();
    Ok(StreamedRun { status, stderr })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(format_id: &str) -> DownloadRequest {
        DownloadRequest {
            url: "https://www.youtube.com/watch?v=abc".to_string(),
            proxy: Some("http://127.0.0.1:8080".to_string()),
            save_path: "/tmp/out".to_string(),
            format_id: format_id.to_string(),
            download_subtitles: true,
            fragment_thread_count: 3,
            transcode: false,
            transcode_format: String::new(),
        }
    }

    #[test]
    fn parses_template_progress_lines() {
        let p = parse_progress_line("[progress]  42.5%| 1.20MiB/s|00:13").expect("progress");
        assert_eq!(p.status, NativeStatus::Downloading);
        assert_eq!(p.percent, Some(42.5));
        assert_eq!(p.speed.as_deref(), Some("1.20MiB/s"));
        assert_eq!(p.eta.as_deref(), Some("00:13"));

        let done = parse_progress_line("[progress] 100.0%|NA|NA").expect("done");
        assert_eq!(done.status, NativeStatus::Finished);
        assert!(done.speed.is_none());
    }

    #[test]
    fn parses_default_download_lines_and_postprocessing() {
        let p = parse_progress_line("[download]  12.3% of ~ 10.00MiB at  2.00MiB/s ETA 00:04")
            .expect("progress");
        assert_eq!(p.percent, Some(12.3));
        assert_eq!(p.speed.as_deref(), Some("2.00MiB/s"));
        assert_eq!(p.eta.as_deref(), Some("00:04"));

        let merge = parse_progress_line("[Merger] Merging formats into \"a.mkv\"").expect("merge");
        assert_eq!(merge.status, NativeStatus::Processing);

        let printed = POSTPROCESS_PRINT
            .trim_start_matches("post_process:")
            .replace("%(filepath)s", "/out/a.mkv");
        let post = parse_progress_line(&printed).expect("post-process");
        assert_eq!(post.status, NativeStatus::Processing);
        assert_eq!(post.note.as_deref(), Some("PostProcess finished /out/a.mkv"));

        assert!(parse_progress_line("[download] Destination: a.mp4").is_none());
        assert!(parse_progress_line("[youtube] abc: Downloading webpage").is_none());
    }

    #[test]
    fn download_args_carry_request_options() {
        let engine = YtDlpEngine::with_program("yt-dlp");
        let req = request("bestaudio");
        let args = engine.download_args(&req, &req.format().expect("format"));
        let joined = args.join(" ");
        assert!(joined.contains("-f bestaudio"));
        assert!(joined.contains("--concurrent-fragments 3"));
        assert!(joined.contains("--extract-audio"));
        assert!(joined.contains("--write-subs"));
        assert!(joined.contains(&format!("--print {POSTPROCESS_PRINT}")));
        assert!(joined.contains("--proxy http://127.0.0.1:8080"));
        assert_eq!(args.last().map(String::as_str), Some("https://www.youtube.com/watch?v=abc"));
    }

    #[test]
    fn stderr_maps_to_engine_errors() {
        let req = request("137+140");
        let err = failure_from_stderr(Some(1), "ERROR: Requested format is not available", &req);
        assert!(matches!(err, EngineError::FormatUnavailable { ref format_id } if format_id == "137+140"));

        let err = failure_from_stderr(Some(1), "WARNING: x\nERROR: HTTP Error 404: Not Found", &req);
        assert!(matches!(err, EngineError::Network(ref m) if m.contains("404")));
    }

    #[test]
    fn missing_program_is_a_missing_dependency() {
        let engine = YtDlpEngine::with_program("definitely-not-a-real-yt-dlp-binary");
        let mut hook = |_: &NativeProgress| HookAction::Continue;
        let err = engine
            .fetch(&request("best"), &CancelToken::new(), &mut hook)
            .expect_err("must fail");
        assert!(matches!(err, EngineError::DependencyMissing { ref tool } if tool == "yt-dlp"));
    }

    #[cfg(unix)]
    #[test]
    fn run_streaming_stops_when_token_is_cancelled() {
        let stop = CancelToken::new();
        let mut command = Command::new("sh");
        command.args(["-c", "echo first; sleep 30; echo never"]);
        let mut seen = Vec::new();
        let stopper = stop.clone();
        let started = Instant::now();
        let result = run_streaming(&mut command, &stop, 0, &mut |line| {
            seen.push(line.to_string());
            stopper.cancel();
            HookAction::Continue
        });
        assert!(matches!(result, Err(CommandRunError::Canceled)));
        assert_eq!(seen, vec!["first".to_string()]);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
