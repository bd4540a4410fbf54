//! Structural integrity checks for nominally-audio uploads.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use super::tool::{run_tool, ToolError, ToolOutput};
use crate::audio;
use crate::config::AudioConfig;
use crate::error::truncate_diagnostic;

/// Outcome of an integrity probe
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReport {
    pub valid: bool,
    pub detail: Option<String>,
}

impl ProbeReport {
    pub fn valid() -> Self {
        Self {
            valid: true,
            detail: None,
        }
    }

    pub fn invalid(detail: impl Into<String>) -> Self {
        Self {
            valid: false,
            detail: Some(detail.into()),
        }
    }
}

/// Decides whether a file can be decoded as-is
#[async_trait]
pub trait IntegrityCheck: Send + Sync {
    async fn probe(&self, path: &Path) -> ProbeReport;
}

/// ffprobe-backed integrity check with a decode-duration confirmation
pub struct IntegrityProber {
    ffprobe: String,
    timeout: Duration,
    max_diagnostic_chars: usize,
}

enum Attempt {
    Passed,
    Failed(ToolOutput),
    Settled(ProbeReport),
}

impl IntegrityProber {
    pub fn new(audio: &AudioConfig) -> Self {
        Self {
            ffprobe: audio.ffprobe_path.clone(),
            timeout: audio.ffprobe_timeout(),
            max_diagnostic_chars: audio.max_diagnostic_chars,
        }
    }

    async fn attempt(&self, args: Vec<String>) -> Attempt {
        match run_tool(&self.ffprobe, &args, self.timeout).await {
            Ok(output) if output.success => Attempt::Passed,
            Ok(output) => Attempt::Failed(output),
            Err(ToolError::TimedOut { .. }) => Attempt::Settled(ProbeReport::invalid("timed out")),
            Err(ToolError::NotFound(_)) => {
                warn!("⚠️ {} not available, skipping integrity validation", self.ffprobe);
                Attempt::Settled(ProbeReport::valid())
            }
            Err(e) => {
                warn!("Integrity probe could not run, assuming valid: {}", e);
                Attempt::Settled(ProbeReport::valid())
            }
        }
    }

    async fn confirm_decodable(&self, path: &Path) -> ProbeReport {
        let owned: PathBuf = path.to_path_buf();
        match tokio::task::spawn_blocking(move || audio::read_duration(&owned)).await {
            Ok(Ok(duration)) => {
                debug!("Decode check passed for {} ({:.2}s)", path.display(), duration);
                ProbeReport::valid()
            }
            Ok(Err(e)) => ProbeReport::invalid(format!(
                "File cannot be read as audio: {}",
                truncate_diagnostic(&e.to_string(), self.max_diagnostic_chars)
            )),
            Err(e) => ProbeReport::invalid(format!("Decode check aborted: {}", e)),
        }
    }
}

#[async_trait]
impl IntegrityCheck for IntegrityProber {
    async fn probe(&self, path: &Path) -> ProbeReport {
        let target = path.to_string_lossy().into_owned();
        let owned = |items: &[&str]| -> Vec<String> {
            items
                .iter()
                .map(|s| s.to_string())
                .chain(std::iter::once(target.clone()))
                .collect()
        };

        let stream_check = owned(&[
            "-v", "error", "-select_streams", "a:0", "-show_entries", "stream=codec_type", "-of",
            "json",
        ]);
        match self.attempt(stream_check).await {
            Attempt::Passed => {}
            Attempt::Settled(report) => return report,
            Attempt::Failed(_) => {
                debug!("No readable audio stream in {}, checking container", path.display());
                let container_check = owned(&["-v", "error", "-show_format", "-of", "json"]);
                match self.attempt(container_check).await {
                    Attempt::Passed => {}
                    Attempt::Settled(report) => return report,
                    Attempt::Failed(output) => {
                        return ProbeReport::invalid(format!(
                            "File validation failed: {}",
                            truncate_diagnostic(output.diagnostic(), self.max_diagnostic_chars)
                        ));
                    }
                }
            }
        }

        self.confirm_decodable(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn prober_with(ffprobe: &str) -> IntegrityProber {
        let audio = AudioConfig {
            ffprobe_path: ffprobe.to_string(),
            ..AudioConfig::default()
        };
        IntegrityProber::new(&audio)
    }

    #[tokio::test]
    async fn test_missing_probe_tool_is_optimistic() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.mp3");
        std::fs::write(&path, b"not really audio").unwrap();

        let report = prober_with("whisperrr-missing-ffprobe").probe(&path).await;
        assert_eq!(report, ProbeReport::valid());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_probe_reports_diagnostic() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.mp3");
        std::fs::write(&path, b"not really audio").unwrap();

        // `false` exits non-zero for both probe attempts
        let report = prober_with("false").probe(&path).await;
        assert!(!report.valid);
        assert!(report.detail.unwrap().starts_with("File validation failed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_pass_still_requires_decodable_audio() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("garbage.wav");
        std::fs::write(&path, b"RIFF garbage that no decoder accepts").unwrap();

        // `true` passes the probe, so the decode check decides
        let report = prober_with("true").probe(&path).await;
        assert!(!report.valid);
        assert!(report.detail.unwrap().starts_with("File cannot be read as audio"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hanging_tool_times_out_as_invalid() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let script = temp_dir.path().join("slow-tool.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 5\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let path = temp_dir.path().join("stalls.mp3");
        std::fs::write(&path, b"ID3 partial upload").unwrap();

        let audio = AudioConfig {
            ffprobe_path: script.to_string_lossy().into_owned(),
            ffprobe_timeout_seconds: 1,
            ..AudioConfig::default()
        };
        let started = std::time::Instant::now();
        let report = IntegrityProber::new(&audio).probe(&path).await;

        assert_eq!(report, ProbeReport::invalid("timed out"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
