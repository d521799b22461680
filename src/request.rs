use crate::config::EngineSettings;
use crate::format::FormatSelector;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use url::Url;

const MAX_FRAGMENT_THREADS: u32 = 64;

/// One download the user asked for. Immutable once it is part of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    #[serde(default)]
    pub proxy: Option<String>,
    pub save_path: String,
    pub format_id: String,
    #[serde(default)]
    pub download_subtitles: bool,
    pub fragment_thread_count: u32,
    #[serde(default)]
    pub transcode: bool,
    #[serde(default)]
    pub transcode_format: String,
}

impl DownloadRequest {
    /// A request for `url` carrying the defaults from `settings`.
    pub fn from_settings(url: impl Into<String>, settings: &EngineSettings, save_path: &str) -> Self {
        Self {
            url: url.into(),
            proxy: settings.proxy.clone(),
            save_path: settings
                .save_path
                .clone()
                .unwrap_or_else(|| save_path.to_string()),
            format_id: settings.format_id.clone(),
            download_subtitles: settings.download_subtitles,
            fragment_thread_count: settings.fragment_thread_count,
            transcode: false,
            transcode_format: settings.transcode_format.clone(),
        }
    }

    pub fn format(&self) -> Result<FormatSelector> {
        FormatSelector::parse(&self.format_id)
    }

    pub fn validate(&self) -> Result<()> {
        normalize_url(&self.url)?;
        self.format()?;
        if let Some(proxy) = self.proxy.as_deref() {
            validate_proxy(proxy)?;
        }
        if self.save_path.trim().is_empty() {
            return Err(EngineError::Validation("save path is empty".to_string()));
        }
        if self.fragment_thread_count == 0 || self.fragment_thread_count > MAX_FRAGMENT_THREADS {
            return Err(EngineError::Validation(format!(
                "fragment thread count must be between 1 and {MAX_FRAGMENT_THREADS}, got {}",
                self.fragment_thread_count
            )));
        }
        if self.transcode && self.transcode_format.trim().is_empty() {
            return Err(EngineError::Validation(
                "transcode requested without a target format".to_string(),
            ));
        }
        Ok(())
    }
}

/// Splits free-form user input into distinct http(s) URLs, keeping input order.
pub fn split_url_input(raw: &str) -> Result<Vec<String>> {
    let mut output: Vec<String> = Vec::new();
    for part in raw.split(|ch| matches!(ch, '\n' | '\r' | '\t' | ',' | ';' | ' ')) {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        let normalized = normalize_url(trimmed)?;
        if !output.iter().any(|existing| existing == &normalized) {
            output.push(normalized);
        }
    }
    Ok(output)
}

pub fn normalize_url(value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::Validation("empty URL provided".to_string()));
    }
    let parsed = Url::parse(trimmed)
        .map_err(|e| EngineError::Validation(format!("invalid URL {trimmed:?}: {e}")))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(EngineError::Validation(format!(
            "unsupported URL scheme for {}; only http/https are allowed",
            redact_url_for_log(trimmed)
        )));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(EngineError::Validation(format!(
            "URL is missing host: {}",
            redact_url_for_log(trimmed)
        )));
    }
    Ok(trimmed.to_string())
}

/// Proxies are passed through opaquely; only the `scheme://host:port` shape is checked.
pub fn validate_proxy(value: &str) -> Result<()> {
    let parsed = Url::parse(value.trim())
        .map_err(|e| EngineError::Validation(format!("invalid proxy {value:?}: {e}")))?;
    if parsed.host_str().map_or(true, str::is_empty) || !has_explicit_port(value.trim()) {
        return Err(EngineError::Validation(format!(
            "proxy must look like scheme://host:port, got {value:?}"
        )));
    }
    Ok(())
}

// `Url::port` hides ports equal to the scheme default, so look at the authority text.
fn has_explicit_port(value: &str) -> bool {
    let Some((_, rest)) = value.split_once("://") else {
        return false;
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit('@').next().unwrap_or_default();
    match host_port.rsplit_once(':') {
        Some((host, port)) => {
            !host.is_empty()
                && !host.ends_with(':')
                && !port.is_empty()
                && port.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

pub fn redact_url_for_log(value: &str) -> String {
    match Url::parse(value) {
        Ok(url) => format!(
            "{}://{}/...",
            url.scheme(),
            url.host_str().unwrap_or("unknown-host")
        ),
        Err(_) => "[invalid-url]".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str) -> DownloadRequest {
        DownloadRequest {
            url: url.to_string(),
            proxy: None,
            save_path: "/tmp/out".to_string(),
            format_id: "best".to_string(),
            download_subtitles: false,
            fragment_thread_count: 1,
            transcode: false,
            transcode_format: String::new(),
        }
    }

    #[test]
    fn normalize_url_allows_http_https_only() {
        assert!(normalize_url("https://www.youtube.com/watch?v=abc").is_ok());
        assert!(normalize_url("http://example.com/video").is_ok());
        assert!(normalize_url("ftp://example.com/video.mp4").is_err());
        assert!(normalize_url("file:///tmp/video.mp4").is_err());
        assert!(normalize_url("not a url").is_err());
    }

    #[test]
    fn split_url_input_splits_and_dedupes() {
        let raw = "https://example.com/a, https://example.com/b\nhttps://example.com/a;https://example.com/c";
        let out = split_url_input(raw).expect("split");
        assert_eq!(
            out,
            vec![
                "https://example.com/a".to_string(),
                "https://example.com/b".to_string(),
                "https://example.com/c".to_string(),
            ]
        );
    }

    #[test]
    fn proxy_must_carry_host_and_port() {
        assert!(validate_proxy("http://127.0.0.1:8080").is_ok());
        assert!(validate_proxy("socks5://proxy.local:1080").is_ok());
        assert!(validate_proxy("http://127.0.0.1").is_err());
        assert!(validate_proxy("127.0.0.1:8080").is_err());
    }

    #[test]
    fn request_validation_covers_each_field() {
        assert!(request("https://example.com/v").validate().is_ok());

        let mut bad = request("https://example.com/v");
        bad.fragment_thread_count = 0;
        assert!(bad.validate().is_err());

        let mut bad = request("https://example.com/v");
        bad.format_id = "137+".to_string();
        assert!(bad.validate().is_err());

        let mut bad = request("https://example.com/v");
        bad.save_path = "  ".to_string();
        assert!(bad.validate().is_err());

        let mut bad = request("https://example.com/v");
        bad.transcode = true;
        assert!(bad.validate().is_err());

        let mut bad = request("https://example.com/v");
        bad.proxy = Some("nonsense".to_string());
        assert!(bad.validate().is_err());
    }
}
