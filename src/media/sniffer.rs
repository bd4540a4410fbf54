//! Content-based media format detection.
//!
//! Detection is an ordered chain of strategies; the first one that yields a
//! tag wins. The default chain asks ffprobe for the container name, then
//! matches magic bytes, then trusts the filename extension.

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::tool::run_tool;
use crate::config::AudioConfig;
use crate::scratch::extension_of;

const HEADER_LEN: usize = 64;

/// Members of the ISO base media (MPEG-4 box) family
const MPEG4_FAMILY: &[&str] = &["mp4", "m4a", "mov", "m4v", "3gp"];
const MATROSKA_FAMILY: &[&str] = &["mkv", "webm"];
const ASF_FAMILY: &[&str] = &["wma", "wmv"];

/// One way of guessing a file's format tag
#[async_trait]
pub trait SniffStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn detect(&self, path: &Path) -> Option<String>;
}

/// Asks ffprobe for the container name
pub struct ProbeStrategy {
    ffprobe: String,
    timeout: Duration,
}

impl ProbeStrategy {
    pub fn new(ffprobe: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ffprobe: ffprobe.into(),
            timeout,
        }
    }
}

#[async_trait]
impl SniffStrategy for ProbeStrategy {
    fn name(&self) -> &'static str {
        "ffprobe"
    }

    async fn detect(&self, path: &Path) -> Option<String> {
        let args = vec![
            "-v".to_string(),
            "quiet".to_string(),
            "-print_format".to_string(),
            "json".to_string(),
            "-show_format".to_string(),
            path.to_string_lossy().into_owned(),
        ];

        let output = match run_tool(&self.ffprobe, &args, self.timeout).await {
            Ok(output) if output.success => output,
            Ok(output) => {
                debug!("ffprobe could not read {} (exit {:?})", path.display(), output.code);
                return None;
            }
            Err(e) => {
                debug!("ffprobe unavailable for sniffing: {}", e);
                return None;
            }
        };

        let data: Value = serde_json::from_str(&output.stdout).ok()?;
        let format_name = data["format"]["format_name"].as_str()?;
        classify_format_name(format_name, extension_of(path).as_deref())
    }
}

/// Matches the leading bytes against known container signatures
pub struct SignatureStrategy;

#[async_trait]
impl SniffStrategy for SignatureStrategy {
    fn name(&self) -> &'static str {
        "signature"
    }

    async fn detect(&self, path: &Path) -> Option<String> {
        let header = read_header(path).await?;
        match_signature(&header, extension_of(path).as_deref())
    }
}

/// Trusts the filename extension
pub struct ExtensionStrategy;

#[async_trait]
impl SniffStrategy for ExtensionStrategy {
    fn name(&self) -> &'static str {
        "extension"
    }

    async fn detect(&self, path: &Path) -> Option<String> {
        extension_of(path)
    }
}

/// Ordered chain of detection strategies
pub struct FormatSniffer {
    strategies: Vec<Box<dyn SniffStrategy>>,
}

impl FormatSniffer {
    /// ffprobe, then magic bytes, then extension
    pub fn new(audio: &AudioConfig) -> Self {
        Self::with_strategies(vec![
            Box::new(ProbeStrategy::new(audio.ffprobe_path.clone(), audio.sniff_timeout())),
            Box::new(SignatureStrategy),
            Box::new(ExtensionStrategy),
        ])
    }

    pub fn with_strategies(strategies: Vec<Box<dyn SniffStrategy>>) -> Self {
        Self { strategies }
    }

    /// Format tag for `path`, or `None` when nothing recognises it.
    /// Missing or empty files are `None` without running any strategy.
    pub async fn sniff(&self, path: &Path) -> Option<String> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {}
            _ => return None,
        }

        for strategy in &self.strategies {
            if let Some(tag) = strategy.detect(path).await {
                debug!("🔎 {} detected as {} by {}", path.display(), tag, strategy.name());
                return Some(tag);
            }
        }
        None
    }
}

async fn read_header(path: &Path) -> Option<Vec<u8>> {
    let file = tokio::fs::File::open(path).await.ok()?;
    let mut header = Vec::with_capacity(HEADER_LEN);
    file.take(HEADER_LEN as u64).read_to_end(&mut header).await.ok()?;
    Some(header)
}

/// The extension if it belongs to `family`, otherwise `default`
fn disambiguate(extension: Option<&str>, family: &[&str], default: &str) -> String {
    match extension {
        Some(ext) if family.contains(&ext) => ext.to_string(),
        _ => default.to_string(),
    }
}

/// Map an ffprobe `format_name` to a tag
pub fn classify_format_name(format_name: &str, extension: Option<&str>) -> Option<String> {
    let name = format_name.to_lowercase();
    let has = |token: &str| name.split(',').any(|part| part.trim() == token);

    if has("mp4") || has("m4a") || has("mov") {
        let default = if name.contains("audio") || name.contains("aac") { "m4a" } else { "mp4" };
        return Some(disambiguate(extension, MPEG4_FAMILY, default));
    }
    if name.contains("matroska") || has("webm") {
        return Some(disambiguate(extension, MATROSKA_FAMILY, "mkv"));
    }
    if has("asf") {
        return Some(disambiguate(extension, ASF_FAMILY, "wma"));
    }

    ["avi", "flv", "3gp", "wav", "mp3", "flac", "ogg", "aac"]
        .iter()
        .find(|tag| has(tag))
        .map(|tag| tag.to_string())
}

/// Match leading file bytes against the signature table
pub fn match_signature(header: &[u8], extension: Option<&str>) -> Option<String> {
    let at = |offset: usize, magic: &[u8]| header.get(offset..offset + magic.len()) == Some(magic);

    if at(0, b"RIFF") && at(8, b"WAVE") {
        return Some("wav".into());
    }
    if at(0, b"RIFF") && at(8, b"AVI ") {
        return Some("avi".into());
    }
    if at(0, b"ID3") || at(0, &[0xFF, 0xFB]) || at(0, &[0xFF, 0xF3]) || at(0, &[0xFF, 0xF2]) {
        return Some("mp3".into());
    }
    if at(0, b"OggS") {
        return Some("ogg".into());
    }
    if at(0, b"fLaC") {
        return Some("flac".into());
    }
    if at(4, b"ftyp") {
        let default = if at(8, b"M4A ") {
            "m4a"
        } else if at(8, b"qt  ") {
            "mov"
        } else if at(8, b"3gp") {
            "3gp"
        } else {
            "mp4"
        };
        return Some(disambiguate(extension, MPEG4_FAMILY, default));
    }
    if at(0, &[0x30, 0x26, 0xB2, 0x75, 0x8E, 0x66, 0xCF, 0x11]) {
        return Some(disambiguate(extension, ASF_FAMILY, "wma"));
    }
    if at(0, &[0x1A, 0x45, 0xDF, 0xA3]) {
        let default = if header.windows(4).any(|w| w == b"webm") { "webm" } else { "mkv" };
        return Some(disambiguate(extension, MATROSKA_FAMILY, default));
    }
    if at(0, b"FLV") {
        return Some("flv".into());
    }
    if at(0, &[0xFF, 0xF1]) || at(0, &[0xFF, 0xF9]) {
        return Some("aac".into());
    }
    None
}
