//! Media preprocessing: turn any accepted upload into the canonical waveform.
//!
//! The run walks a small state machine:
//!
//! ```text
//! Start -> FormatDetected -> (Converting | Validating) -> Converted | Validated
//!       -> Loaded -> Resampled -> Normalized -> Done
//! ```
//!
//! with `Failed` reachable from any step. Video containers are always
//! extracted; audio files are probed and only converted when the probe
//! rejects them. If decoding still fails and nothing has been converted yet,
//! exactly one rescue conversion is attempted before giving up.
//!
//! Every intermediate file is owned by a [`ScratchFile`] guard, so it is
//! removed on every exit path. The canonical output belongs to the caller.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::audio::Waveform;
use crate::config::{Config, UploadConfig};
use crate::error::{Result, ServiceError};
use crate::media::{Converter, FormatSniffer, IntegrityCheck, IntegrityProber, TranscodeKind, Transcoder};
use crate::progress::ProgressReporter;
use crate::scratch::{extension_of, ScratchFile, ScratchSpace};

/// States of one preprocessing run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Start,
    FormatDetected,
    Converting,
    Validating,
    Converted,
    Validated,
    Loaded,
    Resampled,
    Normalized,
    Done,
    Failed,
}

/// Canonical waveform produced by a successful run
#[derive(Debug, Clone, Serialize)]
pub struct PreprocessedAudio {
    /// Canonical WAV file; the caller deletes it
    pub path: PathBuf,
    pub format: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Seconds
    pub duration: f64,
    pub conversions: usize,
    pub states: Vec<PipelineState>,
}

/// Per-run bookkeeping
struct Run {
    states: Vec<PipelineState>,
    step: &'static str,
    intermediate: Option<ScratchFile>,
    conversions: usize,
}

impl Run {
    fn new() -> Self {
        Self {
            states: vec![PipelineState::Start],
            step: "detect",
            intermediate: None,
            conversions: 0,
        }
    }

    fn enter(&mut self, state: PipelineState) {
        debug!("Pipeline -> {:?}", state);
        self.states.push(state);
    }

    fn adopt_intermediate(&mut self, path: PathBuf) {
        // a previous intermediate, if any, is dropped (deleted) here
        self.intermediate = Some(ScratchFile::new(path));
        self.conversions += 1;
    }
}

async fn blocking<T, F>(step: &'static str, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ServiceError::audio(step, "Audio worker task failed", Some(e.to_string())))?
}

/// Sniff, probe, transcode, decode, resample, normalise and write
pub struct Preprocessor {
    sniffer: FormatSniffer,
    prober: Arc<dyn IntegrityCheck>,
    converter: Arc<dyn Converter>,
    scratch: ScratchSpace,
    upload: UploadConfig,
    target_sample_rate: u32,
    channels: u16,
}

impl Preprocessor {
    /// Pipeline backed by ffprobe and ffmpeg
    pub fn new(config: &Config, scratch: ScratchSpace) -> Self {
        Self {
            sniffer: FormatSniffer::new(&config.audio),
            prober: Arc::new(IntegrityProber::new(&config.audio)),
            converter: Arc::new(Transcoder::new(&config.audio, scratch.clone())),
            scratch,
            upload: config.upload.clone(),
            target_sample_rate: config.audio.target_sample_rate,
            channels: config.audio.channels,
        }
    }

    pub fn with_sniffer(mut self, sniffer: FormatSniffer) -> Self {
        self.sniffer = sniffer;
        self
    }

    pub fn with_prober(mut self, prober: Arc<dyn IntegrityCheck>) -> Self {
        self.prober = prober;
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn Converter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn scratch(&self) -> &ScratchSpace {
        &self.scratch
    }

    /// Produce the canonical waveform for `input`
    pub async fn run(&self, input: &Path, progress: &ProgressReporter) -> Result<PreprocessedAudio> {
        let mut run = Run::new();

        match self.execute(input, progress, &mut run).await {
            Ok(output) => Ok(output),
            Err(e) => {
                run.enter(PipelineState::Failed);
                // remove the pending intermediate before surfacing the error
                drop(run.intermediate.take());
                error!("❌ Preprocessing {} failed at {}: {}", input.display(), run.step, e);
                debug!("Pipeline states: {:?}", run.states);

                Err(match e {
                    ServiceError::AudioProcessing { .. } => e,
                    other => ServiceError::audio(run.step, "Failed to preprocess audio", Some(other.to_string())),
                })
            }
        }
    }

    async fn convert(
        &self,
        source: &Path,
        kind: TranscodeKind,
        progress: &ProgressReporter,
        run: &mut Run,
    ) -> Result<PathBuf> {
        run.enter(PipelineState::Converting);
        run.step = kind.step();
        let output = self.converter.transcode(source, None, kind, progress).await?;
        run.adopt_intermediate(output.clone());
        run.enter(PipelineState::Converted);
        Ok(output)
    }

    async fn decode(&self, source: &Path) -> Result<Waveform> {
        let source = source.to_path_buf();
        let channels = self.channels;
        blocking("load", move || Ok(Waveform::decode(&source)?.with_channels(channels))).await
    }

    async fn execute(&self, input: &Path, progress: &ProgressReporter, run: &mut Run) -> Result<PreprocessedAudio> {
        progress.report(0.0, "Validating file...");

        let format = match self.sniffer.sniff(input).await {
            Some(tag) => Some(tag),
            None => extension_of(input),
        };
        run.enter(PipelineState::FormatDetected);
        let tag = format.clone().unwrap_or_else(|| "unknown".to_string());
        progress.report(5.0, format!("Detected file format: {}", tag));

        let mut source = input.to_path_buf();

        if self.upload.requires_conversion(&tag) {
            progress.report(12.5, format!("Converting {} video to audio...", tag.to_uppercase()));
            source = self
                .convert(input, TranscodeKind::ExtractFromVideo, &progress.child(12.5, 75.0), run)
                .await?;
            progress.report(75.0, "Video conversion completed");
        } else if self.upload.is_audio(&tag) {
            run.enter(PipelineState::Validating);
            run.step = "validate";
            progress.report(12.5, "Validating audio file integrity...");

            let report = self.prober.probe(input).await;
            if report.valid {
                run.enter(PipelineState::Validated);
                progress.report(25.0, "Audio file is valid");
            } else {
                warn!(
                    "⚠️ Integrity probe rejected {}: {}",
                    input.display(),
                    report.detail.as_deref().unwrap_or("no detail")
                );
                progress.report(25.0, "Audio file has issues, converting to clean format...");
                source = self
                    .convert(input, TranscodeKind::ConvertAudio, &progress.child(25.0, 75.0), run)
                    .await?;
                progress.report(75.0, "Audio conversion completed");
            }
        } else {
            debug!("Format {} is neither audio nor video, decoding directly", tag);
            run.enter(PipelineState::Validated);
        }

        progress.report(75.0, "Analyzing audio properties...");
        run.step = "load";
        progress.report(80.0, "Loading audio data...");

        let waveform = match self.decode(&source).await {
            Ok(waveform) => waveform,
            Err(first) if run.conversions == 0 => {
                warn!("⚠️ Decoding {} failed, converting once: {}", source.display(), first);
                progress.report(82.5, "Audio loading failed, converting file...");
                let converted = self
                    .convert(&source, TranscodeKind::ConvertAudio, &progress.child(82.5, 87.5), run)
                    .await?;
                run.step = "load";
                // a second failure is final
                self.decode(&converted).await?
            }
            Err(e) => return Err(e),
        };
        run.enter(PipelineState::Loaded);

        // the decoded samples are all that is needed from here on
        drop(run.intermediate.take());

        progress.report(90.0, "Processing audio...");
        let mut waveform = waveform;
        if waveform.sample_rate != self.target_sample_rate {
            run.step = "resample";
            progress.report(
                92.5,
                format!(
                    "Resampling audio from {}Hz to {}Hz...",
                    waveform.sample_rate, self.target_sample_rate
                ),
            );
            let target = self.target_sample_rate;
            waveform = blocking("resample", move || waveform.resample(target)).await?;
        }
        run.enter(PipelineState::Resampled);

        run.step = "normalize";
        progress.report(95.0, "Normalizing audio levels...");
        waveform.peak_normalize();
        run.enter(PipelineState::Normalized);

        run.step = "save";
        progress.report(97.5, "Saving preprocessed audio...");
        let output = ScratchFile::new(self.scratch.temp_path(Some("wav")).await?);
        let output_path = output.path().to_path_buf();
        let (sample_rate, channels, duration) = (waveform.sample_rate, waveform.channels, waveform.duration());
        blocking("save", move || waveform.write_wav(&output_path)).await?;

        run.enter(PipelineState::Done);
        progress.report(100.0, "Audio preprocessing completed, ready for transcription");
        info!(
            "✅ Preprocessed {} ({:.1}s, {}Hz, {} conversion(s))",
            input.display(),
            duration,
            sample_rate,
            run.conversions
        );

        Ok(PreprocessedAudio {
            path: output.persist(),
            format,
            sample_rate,
            channels,
            duration,
            conversions: run.conversions,
            states: run.states.clone(),
        })
    }
}
