//! Contract for the opaque speech model runtime, plus the default
//! whisper.cpp command line implementation.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::TranscriptionConfig;
use crate::media::{run_tool, ToolError};

/// Compute device a model runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Cuda,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    Transcribe,
    Translate,
}

impl FromStr for Task {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "transcribe" => Ok(Task::Transcribe),
            "translate" => Ok(Task::Translate),
            other => Err(anyhow!("Unknown task: {}", other)),
        }
    }
}

/// Decoding options passed to the runtime
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeOptions {
    pub beam_size: u32,
    pub temperature: f64,
    pub task: Task,
    /// `None` asks the runtime to detect the language
    pub language: Option<String>,
}

/// One segment as produced by the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default)]
    pub avg_logprob: Option<f64>,
    #[serde(default)]
    pub no_speech_prob: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LanguageInfo {
    pub language: Option<String>,
    pub probability: Option<f64>,
}

/// Everything one runtime call returns
#[derive(Debug, Clone, Default)]
pub struct RuntimeOutput {
    pub segments: Vec<RawSegment>,
    pub info: LanguageInfo,
}

/// A loaded model; shared read-only across concurrent calls
#[async_trait]
pub trait SpeechModel: Send + Sync {
    fn size(&self) -> &str;

    async fn transcribe(&self, audio: &Path, options: &DecodeOptions) -> Result<RuntimeOutput>;
}

/// Creates models for a given size, device and precision
#[async_trait]
pub trait ModelLoader: Send + Sync {
    /// Whether an accelerated device is available on this host
    fn accelerator_available(&self) -> bool;

    async fn load(&self, size: &str, device: Device, compute_type: &str) -> Result<Arc<dyn SpeechModel>>;
}

/// Detect GPU support for Whisper
pub fn detect_gpu_support() -> bool {
    let cuda_visible = std::env::var("CUDA_VISIBLE_DEVICES")
        .map(|v| !v.trim().is_empty() && v.trim() != "-1")
        .unwrap_or(false);
    cuda_visible
        || std::env::var("WHISPER_USE_GPU").map_or(false, |v| v == "1" || v.to_lowercase() == "true")
}

/// Loader for whisper.cpp style binaries (`whisper-cli`)
pub struct WhisperCliLoader {
    command: String,
    models_dir: PathBuf,
    timeout: Duration,
}

impl WhisperCliLoader {
    pub fn new(config: &TranscriptionConfig) -> Self {
        Self {
            command: config.runtime_command.clone(),
            models_dir: config.models_dir.clone(),
            timeout: Duration::from_secs(config.runtime_timeout_seconds),
        }
    }

    pub fn model_path(&self, size: &str) -> PathBuf {
        self.models_dir.join(format!("ggml-{}.bin", size))
    }
}

#[async_trait]
impl ModelLoader for WhisperCliLoader {
    fn accelerator_available(&self) -> bool {
        detect_gpu_support()
    }

    async fn load(&self, size: &str, device: Device, compute_type: &str) -> Result<Arc<dyn SpeechModel>> {
        let model_path = self.model_path(size);
        if !model_path.exists() {
            return Err(anyhow!("Model file not found: {}", model_path.display()));
        }

        match run_tool(&self.command, &["--help".to_string()], Duration::from_secs(10)).await {
            Err(ToolError::NotFound(_)) => {
                return Err(anyhow!("{} not found. Please install whisper.cpp", self.command));
            }
            Err(e) => return Err(anyhow!("{} is not usable: {}", self.command, e)),
            Ok(_) => {}
        }

        info!(
            "✅ Found model: {} (device: {}, compute: {})",
            model_path.display(),
            device.as_str(),
            compute_type
        );
        Ok(Arc::new(WhisperCliModel {
            command: self.command.clone(),
            model_path,
            size: size.to_string(),
            use_gpu: device == Device::Cuda,
            timeout: self.timeout,
        }))
    }
}

/// A whisper.cpp model file driven through the command line
pub struct WhisperCliModel {
    command: String,
    model_path: PathBuf,
    size: String,
    use_gpu: bool,
    timeout: Duration,
}

impl WhisperCliModel {
    fn command_args(&self, audio: &Path, output_prefix: &Path, options: &DecodeOptions) -> Vec<String> {
        let mut args = vec![
            "-f".to_string(),
            audio.to_string_lossy().into_owned(),
            "-ojf".to_string(), // full JSON, with per-token probabilities
            "-of".to_string(),
            output_prefix.to_string_lossy().into_owned(),
            "-m".to_string(),
            self.model_path.to_string_lossy().into_owned(),
            "-bs".to_string(),
            options.beam_size.to_string(),
            "-tp".to_string(),
            options.temperature.to_string(),
            "-l".to_string(),
            options.language.clone().unwrap_or_else(|| "auto".to_string()),
        ];
        if options.task == Task::Translate {
            args.push("-tr".to_string());
        }
        if !self.use_gpu {
            args.push("-ng".to_string());
        }
        args
    }
}

#[async_trait]
impl SpeechModel for WhisperCliModel {
    fn size(&self) -> &str {
        &self.size
    }

    async fn transcribe(&self, audio: &Path, options: &DecodeOptions) -> Result<RuntimeOutput> {
        let workdir = tempfile::tempdir().context("Cannot create runtime output directory")?;
        let prefix = workdir.path().join("transcript");
        let args = self.command_args(audio, &prefix, options);

        info!("🚀 Running {}: {} model on {}", self.command, self.size, audio.display());
        let output = run_tool(&self.command, &args, self.timeout).await?;
        if !output.success {
            return Err(anyhow!(
                "{} exited with {:?}: {}",
                self.command,
                output.code,
                output.diagnostic().trim()
            ));
        }

        let json_path = prefix.with_extension("json");
        let json = tokio::fs::read_to_string(&json_path)
            .await
            .with_context(|| format!("Missing runtime output {}", json_path.display()))?;
        parse_whisper_json(&json)
    }
}

/// Parse whisper.cpp `-oj`/`-ojf` output (or the `result.segments` variant)
pub fn parse_whisper_json(json: &str) -> Result<RuntimeOutput> {
    let output: WhisperOutput = serde_json::from_str(json).context("Invalid whisper JSON output")?;

    let language = output
        .result
        .as_ref()
        .and_then(|r| r.language.clone())
        .or(output.language);

    let segments = if !output.transcription.is_empty() {
        debug!("📊 whisper.cpp JSON with {} transcription segments", output.transcription.len());
        output
            .transcription
            .into_iter()
            .map(|seg| RawSegment {
                start: seg.offsets.from as f64 / 1000.0,
                end: seg.offsets.to as f64 / 1000.0,
                avg_logprob: mean_token_logprob(&seg.tokens),
                text: seg.text.trim().to_string(),
                no_speech_prob: None,
            })
            .collect()
    } else {
        output.result.map(|r| r.segments).unwrap_or(output.segments)
    };

    Ok(RuntimeOutput {
        segments,
        info: LanguageInfo {
            language,
            probability: None,
        },
    })
}

/// Mean natural log of the text token probabilities; `None` without tokens
fn mean_token_logprob(tokens: &[WhisperToken]) -> Option<f64> {
    // timestamp and control tokens look like `[_BEG_]` or `[_TT_150]`
    let logprobs: Vec<f64> = tokens
        .iter()
        .filter(|t| !t.text.starts_with("[_"))
        .map(|t| t.p.max(f64::MIN_POSITIVE).ln())
        .collect();
    if logprobs.is_empty() {
        return None;
    }
    Some(logprobs.iter().sum::<f64>() / logprobs.len() as f64)
}

#[derive(Debug, Deserialize)]
struct WhisperOutput {
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    segments: Vec<RawSegment>,
    #[serde(default)]
    transcription: Vec<WhisperTranscriptionSegment>,
    #[serde(default)]
    result: Option<WhisperResult>,
}

#[derive(Debug, Deserialize)]
struct WhisperResult {
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    segments: Vec<RawSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperTranscriptionSegment {
    offsets: WhisperOffsets,
    text: String,
    /// Only present in `-ojf` output
    #[serde(default)]
    tokens: Vec<WhisperToken>,
}

#[derive(Debug, Deserialize)]
struct WhisperToken {
    #[serde(default)]
    text: String,
    p: f64,
}

/// Milliseconds
#[derive(Debug, Deserialize)]
struct WhisperOffsets {
    from: u64,
    to: u64,
}
