//! Media information shown before a download is submitted.

use serde::{Deserialize, Serialize};

const VIDEO_EXTS: [&str; 3] = ["mp4", "webm", "mkv"];
const AUDIO_EXTS: [&str; 4] = ["mp3", "m4a", "webm", "wav"];
const SKIPPED_RESOLUTIONS: [&str; 2] = ["144p", "240p"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaFormat {
    pub format_id: String,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub filesize: Option<f64>,
    #[serde(default)]
    pub filesize_approx: Option<f64>,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub format_note: Option<String>,
}

impl MediaFormat {
    fn has_video(&self) -> bool {
        self.vcodec.as_deref().is_some_and(|c| c != "none")
            && self.resolution.as_deref() != Some("audio only")
    }

    fn has_audio(&self) -> bool {
        self.acodec.as_deref().is_some_and(|c| c != "none")
    }

    pub fn size_label(&self) -> String {
        match self.filesize.or(self.filesize_approx) {
            Some(bytes) => format!("{:.2}MB", bytes / (1024.0 * 1024.0)),
            None => "unknown size".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub view_count: Option<u64>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub formats: Vec<MediaFormat>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatChoice {
    pub format_id: String,
    pub ext: String,
    pub label: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FormatChoices {
    pub video: Vec<FormatChoice>,
    pub audio: Vec<FormatChoice>,
}

/// Picks the formats worth offering: common containers only, no tiny or HLS video.
pub fn format_choices(info: &MediaInfo) -> FormatChoices {
    let mut video: Vec<(u32, FormatChoice)> = Vec::new();
    let mut audio: Vec<FormatChoice> = Vec::new();

    for f in &info.formats {
        let ext = f.ext.clone().unwrap_or_default();
        if f.has_video() {
            let resolution = f.resolution.clone().unwrap_or_default();
            let note = f.format_note.as_deref().unwrap_or_default();
            if VIDEO_EXTS.contains(&ext.as_str())
                && !SKIPPED_RESOLUTIONS.contains(&resolution.as_str())
                && !note.contains("HLS")
            {
                let label = format!("{resolution} ({ext}, {})", f.size_label());
                video.push((
                    resolution_height(&resolution),
                    FormatChoice {
                        format_id: f.format_id.clone(),
                        ext,
                        label,
                    },
                ));
            }
        } else if f.has_audio() && AUDIO_EXTS.contains(&ext.as_str()) {
            let codec = f.acodec.clone().unwrap_or_default();
            audio.push(FormatChoice {
                format_id: f.format_id.clone(),
                label: format!("{codec} ({ext}, {})", f.size_label()),
                ext,
            });
        }
    }

    // Stable sort keeps engine order among equal heights.
    video.sort_by(|a, b| b.0.cmp(&a.0));
    FormatChoices {
        video: video.into_iter().map(|(_, c)| c).collect(),
        audio,
    }
}

/// `1920x1080` and `1080p` both give 1080; anything else sorts last.
fn resolution_height(resolution: &str) -> u32 {
    if let Some(p) = resolution.strip_suffix('p') {
        return p.parse().unwrap_or(0);
    }
    resolution
        .split_once('x')
        .and_then(|(_, h)| h.parse().ok())
        .unwrap_or(0)
}

pub fn format_duration(seconds: Option<f64>) -> String {
    let Some(seconds) = seconds.filter(|s| s.is_finite() && *s > 0.0) else {
        return "unknown".to_string();
    };
    let total = seconds as u64;
    let (hours, rest) = (total / 3600, total % 3600);
    let (minutes, secs) = (rest / 60, rest % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}
