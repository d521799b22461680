//! The `format_id` mini-grammar understood by the fetch engine.
//!
//! A selector is one opaque identifier, two identifiers joined by `+` (merge a
//! video stream with an audio stream), or one of the reserved keywords
//! `best`, `bestaudio` and `bestvideo`.

use crate::{EngineError, Result};

const MERGE_MARKER: char = '+';
const AUDIO_PREFIX: &str = "audio";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatSelector {
    Best,
    BestAudio,
    BestVideo,
    Single(String),
    Merge { video: String, audio: String },
}

impl FormatSelector {
    pub fn parse(format_id: &str) -> Result<Self> {
        let trimmed = format_id.trim();
        if trimmed.is_empty() {
            return Err(EngineError::Validation("format_id is empty".to_string()));
        }

        if let Some((video, audio)) = trimmed.split_once(MERGE_MARKER) {
            let video = video.trim();
            let audio = audio.trim();
            if video.is_empty() || audio.is_empty() || audio.contains(MERGE_MARKER) {
                return Err(EngineError::Validation(format!(
                    "format_id must join exactly two streams: {trimmed}"
                )));
            }
            return Ok(FormatSelector::Merge {
                video: video.to_string(),
                audio: audio.to_string(),
            });
        }

        let lower = trimmed.to_ascii_lowercase();
        Ok(match lower.as_str() {
            "best" => FormatSelector::Best,
            "bestaudio" => FormatSelector::BestAudio,
            "bestvideo" => FormatSelector::BestVideo,
            _ => FormatSelector::Single(trimmed.to_string()),
        })
    }

    /// Output is audio only: `bestaudio` in any case, or an id starting with `audio`.
    pub fn is_audio_only(&self) -> bool {
        match self {
            FormatSelector::BestAudio => true,
            FormatSelector::Single(id) => id
                .get(..AUDIO_PREFIX.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(AUDIO_PREFIX)),
            _ => false,
        }
    }

    pub fn is_merge(&self) -> bool {
        matches!(self, FormatSelector::Merge { .. })
    }

    /// Merging streams and extracting audio both go through the transcode tool.
    pub fn requires_transcode_tool(&self) -> bool {
        self.is_merge() || self.is_audio_only()
    }

    pub fn streams(&self) -> Option<(&str, &str)> {
        match self {
            FormatSelector::Merge { video, audio } => Some((video.as_str(), audio.as_str())),
            _ => None,
        }
    }

    /// The selector in the form handed to the engine.
    pub fn engine_arg(&self) -> String {
        match self {
            FormatSelector::Best => "best".to_string(),
            FormatSelector::BestAudio => "bestaudio".to_string(),
            FormatSelector::BestVideo => "bestvideo".to_string(),
            FormatSelector::Single(id) => id.clone(),
            FormatSelector::Merge { video, audio } => format!("{video}+{audio}"),
        }
    }
}
