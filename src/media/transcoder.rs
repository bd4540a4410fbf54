//! Conversion of arbitrary media into the canonical PCM waveform.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

use super::tool::{run_tool, ToolError};
use crate::config::AudioConfig;
use crate::error::{truncate_diagnostic, Result, ServiceError};
use crate::progress::ProgressReporter;
use crate::scratch::{remove_quietly, ScratchSpace};

/// Why a file is being transcoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodeKind {
    /// Repair a nominally-audio file
    ConvertAudio,
    /// Strip the video stream from a container
    ExtractFromVideo,
}

impl TranscodeKind {
    /// Step name carried by errors
    pub fn step(&self) -> &'static str {
        match self {
            TranscodeKind::ConvertAudio => "convert",
            TranscodeKind::ExtractFromVideo => "extract",
        }
    }

    fn captions(&self) -> [&'static str; 5] {
        match self {
            TranscodeKind::ConvertAudio => [
                "Starting audio file conversion...",
                "Extracting audio stream...",
                "Processing audio conversion...",
                "Finalizing converted audio...",
                "Audio conversion completed",
            ],
            TranscodeKind::ExtractFromVideo => [
                "Starting video to audio conversion...",
                "Extracting audio from video...",
                "Processing video conversion...",
                "Finalizing audio extraction...",
                "Video to audio conversion completed",
            ],
        }
    }

    fn failure_message(&self) -> &'static str {
        match self {
            TranscodeKind::ConvertAudio => "Failed to convert audio file",
            TranscodeKind::ExtractFromVideo => "Failed to convert video file to audio",
        }
    }
}

/// Produces a canonical waveform file from any input media
#[async_trait]
pub trait Converter: Send + Sync {
    /// Transcode `input` into `output` (a fresh scratch path when `None`)
    async fn transcode(
        &self,
        input: &Path,
        output: Option<&Path>,
        kind: TranscodeKind,
        progress: &ProgressReporter,
    ) -> Result<PathBuf>;
}

/// ffmpeg-backed converter
pub struct Transcoder {
    ffmpeg: String,
    timeout: Duration,
    sample_rate: u32,
    channels: u16,
    max_diagnostic_chars: usize,
    scratch: ScratchSpace,
}

impl Transcoder {
    pub fn new(audio: &AudioConfig, scratch: ScratchSpace) -> Self {
        Self {
            ffmpeg: audio.ffmpeg_path.clone(),
            timeout: audio.ffmpeg_timeout(),
            sample_rate: audio.target_sample_rate,
            channels: audio.channels,
            max_diagnostic_chars: audio.max_diagnostic_chars,
            scratch,
        }
    }

    fn command_args(&self, input: &Path, output: &Path) -> Vec<String> {
        vec![
            "-i".to_string(),
            input.to_string_lossy().into_owned(),
            "-vn".to_string(), // No video stream
            "-acodec".to_string(),
            "pcm_s16le".to_string(), // 16-bit PCM
            "-ar".to_string(),
            self.sample_rate.to_string(),
            "-ac".to_string(),
            self.channels.to_string(),
            "-y".to_string(), // Overwrite existing
            output.to_string_lossy().into_owned(),
        ]
    }

    fn tool_failure(&self, kind: TranscodeKind, err: ToolError) -> ServiceError {
        match err {
            ToolError::NotFound(program) => ServiceError::audio(
                kind.step(),
                format!("{} not found. Please ensure ffmpeg is installed.", program),
                Some("ffmpeg executable not found".to_string()),
            ),
            ToolError::TimedOut { seconds, .. } => ServiceError::audio(
                kind.step(),
                format!("Conversion timed out (exceeded {} seconds)", seconds),
                Some("ffmpeg conversion timeout".to_string()),
            ),
            ToolError::Io { source, .. } => ServiceError::audio(
                kind.step(),
                kind.failure_message(),
                Some(truncate_diagnostic(&source.to_string(), self.max_diagnostic_chars)),
            ),
        }
    }

    async fn run(&self, input: &Path, output: &Path, kind: TranscodeKind) -> Result<()> {
        let args = self.command_args(input, output);
        let result = run_tool(&self.ffmpeg, &args, self.timeout)
            .await
            .map_err(|e| self.tool_failure(kind, e))?;

        if !result.success {
            return Err(ServiceError::audio(
                kind.step(),
                kind.failure_message(),
                Some(truncate_diagnostic(result.diagnostic(), self.max_diagnostic_chars)),
            ));
        }

        let produced = tokio::fs::metadata(output).await.map(|m| m.len()).unwrap_or(0);
        if produced == 0 {
            return Err(ServiceError::audio(
                kind.step(),
                "Conversion produced empty or missing output file",
                Some("Output file verification failed".to_string()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Converter for Transcoder {
    async fn transcode(
        &self,
        input: &Path,
        output: Option<&Path>,
        kind: TranscodeKind,
        progress: &ProgressReporter,
    ) -> Result<PathBuf> {
        let output = match output {
            Some(path) => path.to_path_buf(),
            None => self.scratch.temp_path(Some("wav")).await?,
        };
        let [starting, extracting, processing, finalizing, completed] = kind.captions();

        info!("🎵 Transcoding ({}) {} -> {}", kind.step(), input.display(), output.display());
        progress.report(0.0, starting);
        progress.report(10.0, extracting);
        progress.report(30.0, processing);

        if let Err(e) = self.run(input, &output, kind).await {
            error!("❌ Transcoding {} failed: {}", input.display(), e);
            remove_quietly(&output);
            return Err(e);
        }

        progress.report(80.0, finalizing);
        progress.report(100.0, completed);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn transcoder_with(ffmpeg: &str, scratch: &Path) -> Transcoder {
        let audio = AudioConfig {
            ffmpeg_path: ffmpeg.to_string(),
            ..AudioConfig::default()
        };
        Transcoder::new(&audio, ScratchSpace::new(scratch))
    }

    #[test]
    fn test_command_shape() {
        let transcoder = transcoder_with("ffmpeg", Path::new("/tmp"));
        let args = transcoder.command_args(Path::new("in.mp4"), Path::new("out.wav"));
        assert_eq!(
            args.join(" "),
            "-i in.mp4 -vn -acodec pcm_s16le -ar 16000 -ac 1 -y out.wav"
        );
    }

    #[tokio::test]
    async fn test_missing_ffmpeg_names_step_and_tool() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("clip.mp4");
        std::fs::write(&input, b"data").unwrap();
        let transcoder = transcoder_with("whisperrr-missing-ffmpeg", temp_dir.path());

        for kind in [TranscodeKind::ExtractFromVideo, TranscodeKind::ConvertAudio] {
            let err = transcoder
                .transcode(&input, None, kind, &ProgressReporter::silent())
                .await
                .unwrap_err();
            assert_eq!(err.step(), Some(kind.step()));
            assert!(err.to_string().contains("not found"));
        }
        // only the input remains
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_empty_output_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("song.mp3");
        std::fs::write(&input, b"data").unwrap();
        let output = temp_dir.path().join("out.wav");

        // `true` exits 0 without writing anything
        let err = transcoder_with("true", temp_dir.path())
            .transcode(&input, Some(&output), TranscodeKind::ConvertAudio, &ProgressReporter::silent())
            .await
            .unwrap_err();
        assert_eq!(err.step(), Some("convert"));
        assert!(err.to_string().contains("empty or missing"));
        assert!(!output.exists());
    }
}
