//! One-time download of the external helper binaries (yt-dlp, ffmpeg).

use crate::config::EngineSettings;
use crate::events::{EventSender, EventStatus, ProgressEvent};
use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

pub const YTDLP: &str = "yt-dlp";
pub const FFMPEG: &str = "ffmpeg";

const YTDLP_MIN_SIZE: u64 = 512 * 1024;
const FFMPEG_ARCHIVE_MIN_SIZE: u64 = 1024 * 1024;
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// The download is the executable itself.
    Binary,
    /// The download is an ffmpeg release archive unpacked into the install dir.
    FfmpegArchive,
}

#[derive(Debug, Clone)]
pub struct DependencySpec {
    pub name: String,
    pub install_path: PathBuf,
    /// Candidate URLs, tried in order.
    pub sources: Vec<String>,
    /// Expected lowercase hex SHA-256 of the download.
    pub sha256: Option<String>,
    pub min_size: u64,
    pub kind: DependencyKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Missing,
    Present,
    Fetched,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyBinary {
    pub name: String,
    pub local_path: Option<String>,
    pub sources: Vec<String>,
    pub status: FetchStatus,
}

pub struct Download {
    pub content_length: Option<u64>,
    pub reader: Box<dyn Read>,
}

/// How candidate URLs are opened.
pub trait Transport: Send + Sync {
    fn open(&self, url: &str) -> Result<Download>;
}

pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(proxy: Option<&str>) -> Result<Self> {
        let proxy = proxy
            .map(|p| ureq::Proxy::new(p).map_err(|e| EngineError::Network(format!("invalid proxy: {e}"))))
            .transpose()?;
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(DOWNLOAD_TIMEOUT))
            .http_status_as_error(false)
            .proxy(proxy)
            .build();
        Ok(Self {
            agent: config.into(),
        })
    }
}

impl Transport for UreqTransport {
    fn open(&self, url: &str) -> Result<Download> {
        let resp = self
            .agent
            .get(url)
            .call()
            .map_err(|e| EngineError::Network(format!("{url}: {e}")))?;
        let status = resp.status();
        if status.as_u16() >= 400 {
            return Err(EngineError::Network(format!("{url}: status={status}")));
        }
        let content_length = resp.body().content_length();
        Ok(Download {
            content_length,
            reader: Box::new(resp.into_body().into_reader()),
        })
    }
}

pub fn ytdlp_release_asset() -> &'static str {
    if cfg!(windows) {
        "yt-dlp.exe"
    } else if cfg!(target_os = "macos") {
        "yt-dlp_macos"
    } else {
        "yt-dlp_linux"
    }
}

/// Well-known dependencies with their install locations and candidate sources.
/// Sources configured in settings come first.
pub fn default_specs(paths: &AppPaths, settings: &EngineSettings) -> Vec<DependencySpec> {
    let asset = ytdlp_release_asset();
    let mut ytdlp_sources = settings.ytdlp_sources.clone();
    ytdlp_sources.push(format!(
        "https://github.com/yt-dlp/yt-dlp/releases/latest/download/{asset}"
    ));
    ytdlp_sources.push(format!(
        "https://github.com/yt-dlp/yt-dlp-nightly-builds/releases/latest/download/{asset}"
    ));

    let mut ffmpeg_sources = settings.ffmpeg_sources.clone();
    match ffmpeg_sidecar::download::ffmpeg_download_url() {
        Ok(url) => ffmpeg_sources.push(url.to_string()),
        Err(e) => warn!(error = %e, "no ffmpeg release for this platform"),
    }

    vec![
        DependencySpec {
            name: YTDLP.to_string(),
            install_path: paths.ytdlp_bin_path(),
            sources: ytdlp_sources,
            sha256: None,
            min_size: YTDLP_MIN_SIZE,
            kind: DependencyKind::Binary,
        },
        DependencySpec {
            name: FFMPEG.to_string(),
            install_path: paths.ffmpeg_bin_path(),
            sources: ffmpeg_sources,
            sha256: None,
            min_size: FFMPEG_ARCHIVE_MIN_SIZE,
            kind: DependencyKind::FfmpegArchive,
        },
    ]
}

pub struct DependencyFetcher {
    specs: Vec<DependencySpec>,
    transport: Box<dyn Transport>,
    events: Option<EventSender>,
    statuses: Mutex<HashMap<String, FetchStatus>>,
}

impl DependencyFetcher {
    pub fn new(specs: Vec<DependencySpec>, transport: Box<dyn Transport>) -> Self {
        Self {
            specs,
            transport,
            events: None,
            statuses: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_app(paths: &AppPaths, settings: &EngineSettings) -> Result<Self> {
        let transport = UreqTransport::new(settings.proxy.as_deref())?;
        Ok(Self::new(default_specs(paths, settings), Box::new(transport)))
    }

    /// Progress is reported as `ProgressEvent`s with task id `dependency:<name>`.
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    fn spec(&self, name: &str) -> Result<&DependencySpec> {
        self.specs
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| EngineError::Validation(format!("unknown dependency: {name}")))
    }

    /// Local path of `name`, downloading it first when it is not installed yet.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        let spec = self.spec(name)?;
        if spec.install_path.is_file() {
            self.set_status(name, FetchStatus::Present);
            return Ok(spec.install_path.clone());
        }

        let task_id = format!("dependency:{name}");
        for (attempt, url) in spec.sources.iter().enumerate() {
            info!(dependency = name, attempt = attempt + 1, url = %url, "fetching dependency");
            self.emit(ProgressEvent::new(
                &task_id,
                EventStatus::Info,
                format!("fetching {name} from {url}"),
            ));
            match self.fetch_from(spec, url, &task_id) {
                Ok(()) => {
                    info!(dependency = name, path = %spec.install_path.display(), "dependency installed");
                    self.set_status(name, FetchStatus::Fetched);
                    self.emit(ProgressEvent::new(
                        &task_id,
                        EventStatus::Success,
                        format!("{name} installed"),
                    ));
                    return Ok(spec.install_path.clone());
                }
                Err(err) => {
                    warn!(dependency = name, url = %url, error = %err, "dependency source failed");
                    self.emit(ProgressEvent::new(
                        &task_id,
                        EventStatus::Warning,
                        format!("{url} failed: {err}"),
                    ));
                }
            }
        }

        self.set_status(name, FetchStatus::Failed);
        self.emit(ProgressEvent::new(
            &task_id,
            EventStatus::Error,
            format!("{name} could not be downloaded from any source"),
        ));
        Err(EngineError::DependencyMissing {
            tool: name.to_string(),
        })
    }

    /// Resolves every named dependency; the first failure is returned.
    pub fn bootstrap(&self, names: &[&str]) -> Result<Vec<PathBuf>> {
        names.iter().map(|name| self.resolve(name)).collect()
    }

    /// Current state of every known dependency, without network access.
    pub fn status(&self) -> Vec<DependencyBinary> {
        let statuses = self
            .statuses
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        self.specs
            .iter()
            .map(|spec| {
                let installed = spec.install_path.is_file();
                let status = match statuses.get(&spec.name) {
                    Some(status) => *status,
                    None if installed => FetchStatus::Present,
                    None => FetchStatus::Missing,
                };
                DependencyBinary {
                    name: spec.name.clone(),
                    local_path: installed.then(|| spec.install_path.to_string_lossy().to_string()),
                    sources: spec.sources.clone(),
                    status,
                }
            })
            .collect()
    }

    fn fetch_from(&self, spec: &DependencySpec, url: &str, task_id: &str) -> Result<()> {
        let install_dir = spec
            .install_path
            .parent()
            .ok_or_else(|| EngineError::InstallFailed(format!("no install dir for {}", spec.name)))?;
        std::fs::create_dir_all(install_dir)?;

        let download_path = match spec.kind {
            DependencyKind::Binary => spec.install_path.with_extension("download"),
            DependencyKind::FfmpegArchive => install_dir.join(archive_file_name(url)),
        };
        let tmp_path = download_path.with_extension("part");

        let result = self
            .download_to(url, &tmp_path, task_id)
            .and_then(|size| verify(spec, &tmp_path, size));
        if let Err(err) = result {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(err);
        }
        replace_file(&tmp_path, &download_path)?;

        match spec.kind {
            DependencyKind::Binary => {
                replace_file(&download_path, &spec.install_path)?;
            }
            DependencyKind::FfmpegArchive => {
                let unpacked = ffmpeg_sidecar::download::unpack_ffmpeg(
                    &download_path,
                    &install_dir.to_path_buf(),
                )
                .map_err(|e| EngineError::InstallFailed(format!("ffmpeg unpack failed: {e}")));
                let _ = std::fs::remove_file(&download_path);
                unpacked?;
                if !spec.install_path.is_file() {
                    return Err(EngineError::InstallFailed(format!(
                        "archive from {url} did not contain {}",
                        spec.install_path.display()
                    )));
                }
            }
        }
        make_executable(&spec.install_path)
    }

    fn download_to(&self, url: &str, path: &Path, task_id: &str) -> Result<u64> {
        let mut download = self.transport.open(url)?;
        let mut file = std::fs::File::create(path)?;
        let mut buf = vec![0_u8; 64 * 1024];
        let mut written = 0_u64;
        let mut last_percent = -1_i64;
        loop {
            let n = download
                .reader
                .read(&mut buf)
                .map_err(|e| EngineError::Network(format!("{url}: {e}")))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
            written += n as u64;
            if let Some(total) = download.content_length.filter(|t| *t > 0) {
                let percent = (written as f64 / total as f64 * 100.0).min(100.0);
                if percent as i64 > last_percent {
                    last_percent = percent as i64;
                    self.emit(ProgressEvent::downloading(task_id, percent, None, None));
                }
            }
        }
        file.flush()?;
        Ok(written)
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(events) = &self.events {
            events.send(event);
        }
    }

    fn set_status(&self, name: &str, status: FetchStatus) {
        if let Ok(mut statuses) = self.statuses.lock() {
            statuses.insert(name.to_string(), status);
        }
    }
}

fn verify(spec: &DependencySpec, path: &Path, size: u64) -> Result<()> {
    if size < spec.min_size {
        return Err(EngineError::InstallFailed(format!(
            "downloaded {} is unexpectedly small ({size} bytes)",
            spec.name
        )));
    }
    if let Some(expected) = spec.sha256.as_deref() {
        let actual = hex::encode(sha256_file(path)?);
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            return Err(EngineError::HashMismatch {
                path: path.to_path_buf(),
                expected: expected.trim().to_ascii_lowercase(),
                actual,
            });
        }
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<Vec<u8>> {
    use sha2::Digest;
    let mut file = std::fs::File::open(path)?;
    let mut hasher = sha2::Sha256::new();
    let mut buf = vec![0_u8; 1024 * 1024];
    loop {
        let n = file.read(buf.as_mut_slice())?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_vec())
}

fn archive_file_name(url: &str) -> String {
    url.rsplit('/')
        .next()
        .map(|s| s.split(['?', '#']).next().unwrap_or(s))
        .filter(|s| !s.is_empty())
        .unwrap_or("ffmpeg-archive")
        .to_string()
}

fn replace_file(from: &Path, to: &Path) -> Result<()> {
    if to.exists() {
        let _ = std::fs::remove_file(to);
    }
    if std::fs::rename(from, to).is_err() {
        std::fs::copy(from, to)?;
        let _ = std::fs::remove_file(from);
    }
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
