use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;
use tubequeue_engine::batch::TaskManager;
use tubequeue_engine::config;
use tubequeue_engine::deps::{DependencyFetcher, FFMPEG, YTDLP};
use tubequeue_engine::engine::FetchEngine;
use tubequeue_engine::events::result_channel;
use tubequeue_engine::ffmpeg::FfmpegTranscoder;
use tubequeue_engine::history::HistoryStore;
use tubequeue_engine::monitor::{BatchMonitor, MonitorUpdate};
use tubequeue_engine::paths::AppPaths;
use tubequeue_engine::probe::{format_choices, format_duration};
use tubequeue_engine::request::{split_url_input, DownloadRequest};
use tubequeue_engine::worker::Collaborators;
use tubequeue_engine::ytdlp::YtDlpEngine;

#[derive(Default)]
struct Args {
    base_dir: Option<PathBuf>,
    urls: Vec<String>,
    save_path: Option<String>,
    format_id: Option<String>,
    proxy: Option<String>,
    threads: Option<u32>,
    subs: bool,
    transcode: Option<String>,
    probe: Option<String>,
    bootstrap_only: bool,
    show_history: bool,
    clear_history: bool,
    show_status: bool,
}

fn main() -> Result<(), String> {
    init_tracing();

    let raw: Vec<String> = std::env::args().collect();
    if raw.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return Ok(());
    }
    let args = parse_args(&raw)?;

    let base_dir = args
        .base_dir
        .clone()
        .or_else(default_base_dir)
        .ok_or_else(|| "could not determine base dir; pass --base-dir".to_string())?;
    let paths = AppPaths::new(base_dir);
    paths.ensure_dirs().map_err(|e| e.to_string())?;

    let mut settings = config::load_settings(&paths).map_err(|e| e.to_string())?;
    if let Some(proxy) = &args.proxy {
        settings.proxy = Some(proxy.clone());
    }

    if args.clear_history {
        HistoryStore::open(paths.history_path()).clear();
        println!("History cleared.");
        return Ok(());
    }

    if args.show_history {
        let history = HistoryStore::open(paths.history_path());
        let entries = history.load();
        if entries.is_empty() {
            println!("History is empty.");
        }
        for entry in entries {
            println!("{}  {}  [{}]  {}", entry.timestamp, entry.title, entry.format_id, entry.url);
        }
        return Ok(());
    }

    let (events, receiver) = result_channel();
    let mut monitor = BatchMonitor::new(receiver, settings.poll_interval());
    let fetcher = DependencyFetcher::for_app(&paths, &settings)
        .map_err(|e| e.to_string())?
        .with_events(events.clone());

    if args.show_status {
        let status = fetcher.status();
        let json = serde_json::to_string_pretty(&status).map_err(|e| e.to_string())?;
        println!("{json}");
        return Ok(());
    }

    // Without its helper binaries the downloader cannot do anything useful.
    let bootstrapped = fetcher.bootstrap(&[YTDLP, FFMPEG]);
    for update in monitor.poll() {
        print_update(&update);
    }
    let resolved = bootstrapped.map_err(|e| format!("startup failed: {}", e.user_message()))?;
    for path in &resolved {
        info!(path = %path.display(), "dependency ready");
    }
    if args.bootstrap_only {
        return Ok(());
    }

    let engine = Arc::new(YtDlpEngine::new(&paths, &settings));

    if let Some(url) = &args.probe {
        let media = engine
            .probe(url, settings.proxy.as_deref())
            .map_err(|e| e.user_message())?;
        print_probe(&media);
        return Ok(());
    }

    if args.urls.is_empty() {
        return Err("nothing to do (pass --url, --probe, --history or --bootstrap)".to_string());
    }

    let default_dir = paths.default_download_dir().to_string_lossy().to_string();
    let requests: Vec<DownloadRequest> = args
        .urls
        .iter()
        .map(|url| {
            let mut request = DownloadRequest::from_settings(url.clone(), &settings, &default_dir);
            if let Some(save_path) = &args.save_path {
                request.save_path = save_path.clone();
            }
            if let Some(format_id) = &args.format_id {
                request.format_id = format_id.clone();
            }
            if let Some(threads) = args.threads {
                request.fragment_thread_count = threads;
            }
            request.download_subtitles |= args.subs;
            if let Some(target) = &args.transcode {
                request.transcode = true;
                request.transcode_format = target.clone();
            }
            request
        })
        .collect();

    let services = Collaborators {
        engine,
        transcoder: Arc::new(FfmpegTranscoder::new(&paths)),
        history: Arc::new(HistoryStore::open(paths.history_path())),
    };
    let manager = TaskManager::new(services, events, settings.clone());
    let batch = manager.submit(requests).map_err(|e| e.user_message())?;
    for rejected in batch.rejected() {
        println!("skipped {}: {}", rejected.url, rejected.reason);
    }
    println!("Batch {}: {} download(s)", batch.id(), batch.total());

    let overall = monitor.run_until_settled(&batch, print_update);
    let status = batch.status();
    println!(
        "Batch {} {}: {}/{} finished, {} discarded, overall {:.1}%",
        status.batch_id,
        status.phase.as_str(),
        status.completed,
        status.total,
        status.discarded,
        overall
    );
    Ok(())
}

fn parse_args(raw: &[String]) -> Result<Args, String> {
    let mut args = Args::default();
    let mut i = 1;
    while i < raw.len() {
        let flag = raw[i].as_str();
        let mut value = || {
            i += 1;
            raw.get(i)
                .cloned()
                .ok_or_else(|| format!("{flag} requires a value"))
        };
        match flag {
            "--base-dir" => args.base_dir = Some(PathBuf::from(value()?)),
            "--url" => {
                let urls = split_url_input(&value()?).map_err(|e| e.to_string())?;
                args.urls.extend(urls);
            }
            "--save-path" => args.save_path = Some(value()?),
            "--format" => args.format_id = Some(value()?),
            "--proxy" => args.proxy = Some(value()?),
            "--threads" => {
                let v = value()?;
                let n = v
                    .parse::<u32>()
                    .map_err(|_| format!("--threads expects a number, got {v:?}"))?;
                args.threads = Some(n);
            }
            "--subs" => args.subs = true,
            "--transcode" => args.transcode = Some(value()?),
            "--probe" => args.probe = Some(value()?),
            "--bootstrap" => args.bootstrap_only = true,
            "--history" => args.show_history = true,
            "--clear-history" => args.clear_history = true,
            "--status" => args.show_status = true,
            other => return Err(format!("unknown arg: {other} (try --help)")),
        }
        i += 1;
    }
    Ok(args)
}

fn print_update(update: &MonitorUpdate) {
    let event = &update.event;
    let task = match event.batch_id {
        Some(_) => event.task_id.get(..8).unwrap_or(event.task_id.as_str()),
        None => event.task_id.as_str(),
    };
    match update.overall_percent {
        Some(overall) => println!(
            "[{:<11}] {task} {}  (batch {overall:.1}%)",
            event.status.as_str(),
            event.message
        ),
        None => println!("[{:<11}] {task} {}", event.status.as_str(), event.message),
    }
}

fn print_probe(media: &tubequeue_engine::probe::MediaInfo) {
    println!("Title:    {}", media.title.as_deref().unwrap_or("unknown"));
    println!("Uploader: {}", media.uploader.as_deref().unwrap_or("unknown"));
    println!("Duration: {}", format_duration(media.duration));
    if let Some(views) = media.view_count {
        println!("Views:    {views}");
    }
    let choices = format_choices(media);
    println!("Video formats:");
    for choice in &choices.video {
        println!("  {:>8}  {}", choice.format_id, choice.label);
    }
    println!("Audio formats:");
    for choice in &choices.audio {
        println!("  {:>8}  {}", choice.format_id, choice.label);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn default_base_dir() -> Option<PathBuf> {
    if let Ok(v) = std::env::var("TUBEQUEUE_BASE_DIR") {
        let t = v.trim();
        if !t.is_empty() {
            return Some(PathBuf::from(t));
        }
    }

    if cfg!(windows) {
        if let Ok(appdata) = std::env::var("APPDATA") {
            let t = appdata.trim();
            if !t.is_empty() {
                return Some(PathBuf::from(t).join("tubequeue"));
            }
        }
    }

    std::env::var("HOME")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .map(|h| PathBuf::from(h).join(".tubequeue"))
}

fn print_help() {
    println!(
        r#"tubequeue

Downloads a batch of videos concurrently with yt-dlp and reports overall progress.

Usage:
  tubequeue --url "https://a, https://b" [--format 137+140] [--transcode mp4]
  tubequeue --probe https://example.com/watch?v=1
  tubequeue --bootstrap
  tubequeue --history

Options:
  --base-dir <path>     Override base dir (default: $TUBEQUEUE_BASE_DIR or ~/.tubequeue)
  --url <urls>          URLs separated by commas, spaces or newlines (repeatable)
  --save-path <dir>     Output folder
  --format <id>         best, bestaudio, bestvideo, an id, or video+audio ids
  --proxy <url>         scheme://host:port
  --threads <n>         Fragment threads per download
  --subs                Download subtitles
  --transcode <ext>     Re-encode finished downloads with ffmpeg
  --probe <url>         Show media info and available formats
  --bootstrap           Only download yt-dlp and ffmpeg
  --history             Print the download history
  --clear-history       Delete every history entry
  --status              Print the state of the helper binaries

Logging follows RUST_LOG (default: info).
"#
    );
}
