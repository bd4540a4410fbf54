//! Upload validation: existence, size limit and supported format.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::audio;
use crate::config::{Config, UploadConfig};
use crate::error::{Result, ServiceError};
use crate::media::FormatSniffer;
use crate::scratch::extension_of;

/// Summary of an accepted upload
#[derive(Debug, Clone, Serialize)]
pub struct MediaReport {
    pub valid: bool,
    pub format: String,
    pub file_size: u64,
    pub file_size_mb: f64,
    pub requires_conversion: bool,
    /// Unknown for video containers until extraction
    pub duration: Option<f64>,
    pub sample_rate: Option<u32>,
}

/// Rejects uploads the pipeline should never see
pub struct MediaValidator {
    sniffer: FormatSniffer,
    upload: UploadConfig,
}

impl MediaValidator {
    pub fn new(config: &Config) -> Self {
        Self {
            sniffer: FormatSniffer::new(&config.audio),
            upload: config.upload.clone(),
        }
    }

    pub fn with_sniffer(mut self, sniffer: FormatSniffer) -> Self {
        self.sniffer = sniffer;
        self
    }

    pub async fn validate(&self, path: &Path) -> Result<MediaReport> {
        let file_size = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                return Err(ServiceError::file_system(
                    "validate_media",
                    Some(path.to_path_buf()),
                    format!("File does not exist: {}", e),
                ))
            }
        };

        let max_size = self.upload.max_file_size_bytes();
        if file_size > max_size {
            return Err(ServiceError::FileTooLarge {
                size: file_size,
                max_size,
            });
        }

        // An empty file has no content to vouch for its extension
        let detected = match self.sniffer.sniff(path).await {
            Some(tag) => Some(tag),
            None if file_size > 0 => extension_of(path),
            None => None,
        };

        let format = match detected {
            Some(tag) if self.upload.supported_set().contains(&tag) => tag,
            other => {
                return Err(ServiceError::InvalidFormat {
                    format: other.unwrap_or_else(|| "unknown".to_string()),
                    supported: self.upload.supported_formats.clone(),
                })
            }
        };

        let requires_conversion = self.upload.requires_conversion(&format);
        let (duration, sample_rate) = if requires_conversion {
            (None, None)
        } else {
            // container metadata only; unreadable audio is left for the pipeline to repair
            let owned: PathBuf = path.to_path_buf();
            match tokio::task::spawn_blocking(move || audio::read_stream_header(&owned)).await {
                Ok(Ok(header)) => (header.duration, header.sample_rate),
                Ok(Err(e)) => {
                    debug!("Could not read stream info for {}: {}", path.display(), e);
                    (None, None)
                }
                Err(_) => (None, None),
            }
        };

        info!("📋 Validated {} as {} ({} bytes)", path.display(), format, file_size);
        Ok(MediaReport {
            valid: true,
            format,
            file_size,
            file_size_mb: (file_size as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0,
            requires_conversion,
            duration,
            sample_rate,
        })
    }
}

/// Validate a single file with the default detection chain
pub async fn validate_media(config: &Config, path: &Path) -> Result<MediaReport> {
    MediaValidator::new(config).validate(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::Waveform;
    use crate::config::ConfigBuilder;
    use crate::error::ErrorKind;
    use crate::media::sniffer::{ExtensionStrategy, SignatureStrategy};
    use tempfile::TempDir;

    fn validator(config: &Config) -> MediaValidator {
        MediaValidator::new(config).with_sniffer(FormatSniffer::with_strategies(vec![
            Box::new(SignatureStrategy),
            Box::new(ExtensionStrategy),
        ]))
    }

    #[tokio::test]
    async fn test_zero_byte_file_is_invalid_format() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("empty.wav");
        std::fs::write(&path, b"").unwrap();

        // the default chain would reach for ffprobe if it got that far
        let config = ConfigBuilder::new().with_tools("ffmpeg", "whisperrr-missing-ffprobe").build();
        let err = validate_media(&config, &path).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidAudioFormat);
        assert_eq!(err.details()["file_format"], "unknown");
    }

    #[tokio::test]
    async fn test_missing_file_is_file_system_error() {
        let temp_dir = TempDir::new().unwrap();
        let err = validator(&Config::default())
            .validate(&temp_dir.path().join("nope.mp3"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileSystemError);
    }

    #[tokio::test]
    async fn test_oversized_file_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("big.wav");
        std::fs::write(&path, vec![0u8; 2 * 1024 * 1024]).unwrap();

        let config = ConfigBuilder::new().with_max_file_size_mb(1).build();
        let err = validator(&config).validate(&path).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileTooLarge);
    }

    #[tokio::test]
    async fn test_unsupported_extension_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("notes.txt");
        std::fs::write(&path, b"hello").unwrap();

        let err = validator(&Config::default()).validate(&path).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidAudioFormat);
        assert_eq!(err.details()["file_format"], "txt");
    }

    #[tokio::test]
    async fn test_audio_report_includes_duration() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("voice.wav");
        Waveform {
            samples: vec![0.1; 16000 * 5],
            sample_rate: 16000,
            channels: 1,
        }
        .write_wav(&path)
        .unwrap();

        let report = validator(&Config::default()).validate(&path).await.unwrap();
        assert_eq!(report.format, "wav");
        assert!(!report.requires_conversion);
        assert!((report.duration.unwrap() - 5.0).abs() < 1e-6);
        assert_eq!(report.sample_rate, Some(16000));
    }

    #[tokio::test]
    async fn test_video_report_has_no_duration() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("clip.mov");
        std::fs::write(&path, b"\0\0\0\x14ftypqt  \0\0\0\0").unwrap();

        let report = validator(&Config::default()).validate(&path).await.unwrap();
        assert_eq!(report.format, "mov");
        assert!(report.requires_conversion);
        assert_eq!(report.duration, None);
    }
}
