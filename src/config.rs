use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the Whisperrr transcription service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server and logging settings
    pub server: ServerConfig,

    /// Upload limits, format sets and scratch storage
    pub upload: UploadConfig,

    /// External tool and canonical waveform settings
    pub audio: AudioConfig,

    /// Model and runtime settings
    pub transcription: TranscriptionConfig,

    /// Job-global progress sub-ranges
    pub progress: ProgressConfig,

    /// Job retention settings
    pub jobs: JobConfig,

    /// Shutdown draining settings
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Log level used when RUST_LOG is unset
    pub log_level: String,
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Maximum upload size in megabytes
    pub max_file_size_mb: u64,

    /// Every format tag the service accepts
    pub supported_formats: Vec<String>,

    /// Container formats whose primary payload is typically video
    pub formats_requiring_conversion: Vec<String>,

    /// Formats treated as audio and validated before use
    pub audio_formats: Vec<String>,

    /// Directory for uploads and derived files
    pub scratch_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate of the canonical waveform
    pub target_sample_rate: u32,

    /// Channel count of the canonical waveform
    pub channels: u16,

    pub ffmpeg_path: String,
    pub ffprobe_path: String,

    /// Timeout for the format sniffing probe (seconds)
    pub sniff_timeout_seconds: u64,

    /// Timeout for integrity probes (seconds)
    pub ffprobe_timeout_seconds: u64,

    /// Timeout for transcoding (seconds)
    pub ffmpeg_timeout_seconds: u64,

    /// Delete the canonical waveform once the model is done with it
    pub cleanup_temp_files: bool,

    /// Maximum characters of tool diagnostics kept in errors
    pub max_diagnostic_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    /// Model loaded at startup
    pub model_size: String,

    /// Numeric precision: auto, float16, float32 or int8
    pub compute_type: String,

    pub beam_size: u32,

    /// transcribe or translate
    pub default_task: String,

    /// Size of the transcription worker pool
    pub max_concurrent_transcriptions: usize,

    /// Emit runtime progress once per this many segments
    pub segment_progress_interval: usize,
    pub segment_progress_base: f64,
    pub segment_progress_multiplier: f64,
    pub segment_progress_max: f64,

    /// whisper.cpp compatible command used by the default runtime
    pub runtime_command: String,

    /// Directory holding ggml-<size>.bin model files
    pub models_dir: PathBuf,

    /// Timeout for a single runtime invocation (seconds)
    pub runtime_timeout_seconds: u64,

    pub available_models: Vec<String>,
    pub supported_languages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Upper bound of the preprocessing sub-range (starts at 0)
    pub preprocessing_max: f64,

    pub transcription_min: f64,
    pub transcription_max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Jobs older than this are reaped
    pub retention_seconds: u64,

    /// Interval between reaper sweeps
    pub cleanup_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub drain_poll_millis: u64,
    pub max_drain_seconds: u64,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            log_level: "info".to_string(),
            cors_origins: strings(&["http://localhost:3000", "http://localhost:7331"]),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: 1000,
            supported_formats: strings(&[
                "mp3", "wav", "m4a", "flac", "ogg", "wma", "aac", "mp4", "avi", "mov", "mkv",
                "flv", "webm", "wmv", "m4v", "3gp",
            ]),
            formats_requiring_conversion: strings(&[
                "mp4", "avi", "mov", "mkv", "flv", "webm", "wmv", "m4v", "3gp",
            ]),
            audio_formats: strings(&["mp3", "wav", "m4a", "flac", "ogg", "wma", "aac"]),
            scratch_dir: std::env::temp_dir().join("whisperrr"),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 16000, // Optimal for Whisper
            channels: 1,
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            sniff_timeout_seconds: 10,
            ffprobe_timeout_seconds: 30,
            ffmpeg_timeout_seconds: 300,
            cleanup_temp_files: true,
            max_diagnostic_chars: 200,
        }
    }
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            model_size: "base".to_string(),
            compute_type: "auto".to_string(),
            beam_size: 5,
            default_task: "transcribe".to_string(),
            max_concurrent_transcriptions: num_cpus::get().clamp(1, 2),
            segment_progress_interval: 10,
            segment_progress_base: 10.0,
            segment_progress_multiplier: 0.5,
            segment_progress_max: 90.0,
            runtime_command: "whisper-cli".to_string(),
            models_dir: PathBuf::from("models"),
            runtime_timeout_seconds: 3600, // 60 minutes for large files
            available_models: strings(&[
                "tiny", "base", "small", "medium", "large", "large-v2", "large-v3",
            ]),
            supported_languages: strings(&[
                "en", "es", "fr", "de", "it", "pt", "nl", "ru", "zh", "ja", "ko", "ar", "hi",
            ]),
        }
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            preprocessing_max: 40.0,
            transcription_min: 40.0,
            transcription_max: 100.0,
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            retention_seconds: 3600, // 1 hour
            cleanup_interval_seconds: 300,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_poll_millis: 500,
            max_drain_seconds: 60,
        }
    }
}

impl UploadConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    pub fn supported_set(&self) -> HashSet<String> {
        self.supported_formats.iter().map(|f| f.to_lowercase()).collect()
    }

    pub fn requires_conversion(&self, format: &str) -> bool {
        self.formats_requiring_conversion
            .iter()
            .any(|f| f.eq_ignore_ascii_case(format))
    }

    pub fn is_audio(&self, format: &str) -> bool {
        self.audio_formats.iter().any(|f| f.eq_ignore_ascii_case(format))
    }
}

impl AudioConfig {
    pub fn sniff_timeout(&self) -> Duration {
        Duration::from_secs(self.sniff_timeout_seconds)
    }

    pub fn ffprobe_timeout(&self) -> Duration {
        Duration::from_secs(self.ffprobe_timeout_seconds)
    }

    pub fn ffmpeg_timeout(&self) -> Duration {
        Duration::from_secs(self.ffmpeg_timeout_seconds)
    }
}

impl Config {
    /// Load configuration from file
    pub fn load() -> Result<Self> {
        let config_paths = [
            "whisperrr.toml",
            "config/whisperrr.toml",
            "/etc/whisperrr/config.toml",
        ];

        for path in &config_paths {
            if let Ok(config_str) = std::fs::read_to_string(path) {
                match toml::from_str::<Config>(&config_str) {
                    Ok(config) => {
                        tracing::info!("📄 Loaded configuration from: {}", path);
                        return Ok(config.with_env_overrides());
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse config file {}: {}", path, e);
                    }
                }
            }
        }

        Ok(Self::from_env())
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Cannot read config {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&config_str)?;
        Ok(config.with_env_overrides())
    }

    /// Defaults overridden by environment variables
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(model) = std::env::var("WHISPERRR_MODEL_SIZE") {
            self.transcription.model_size = model;
        }

        if let Ok(compute) = std::env::var("WHISPERRR_COMPUTE_TYPE") {
            self.transcription.compute_type = compute;
        }

        if let Ok(workers) = std::env::var("WHISPERRR_MAX_CONCURRENT") {
            if let Ok(workers) = workers.parse() {
                self.transcription.max_concurrent_transcriptions = workers;
            }
        }

        if let Ok(size) = std::env::var("WHISPERRR_MAX_FILE_SIZE_MB") {
            if let Ok(size) = size.parse() {
                self.upload.max_file_size_mb = size;
            }
        }

        if let Ok(dir) = std::env::var("WHISPERRR_SCRATCH_DIR") {
            self.upload.scratch_dir = PathBuf::from(dir);
        }

        if let Ok(port) = std::env::var("WHISPERRR_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }

        if let Ok(log_level) = std::env::var("WHISPERRR_LOG_LEVEL") {
            self.server.log_level = log_level;
        }

        self
    }

    /// Save configuration to file
    pub fn save(&self, path: &str) -> Result<()> {
        let config_str = toml::to_string_pretty(self)?;
        std::fs::write(path, config_str)?;
        tracing::info!("💾 Configuration saved to: {}", path);
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.transcription.max_concurrent_transcriptions == 0 {
            return Err(anyhow!("max_concurrent_transcriptions must be greater than 0"));
        }

        if self.audio.target_sample_rate == 0 {
            return Err(anyhow!("target_sample_rate must be greater than 0"));
        }

        if self.audio.channels == 0 {
            return Err(anyhow!("channels must be greater than 0"));
        }

        if self.transcription.segment_progress_interval == 0 {
            return Err(anyhow!("segment_progress_interval must be greater than 0"));
        }

        let p = &self.progress;
        let ordered = 0.0 <= p.preprocessing_max
            && p.preprocessing_max <= p.transcription_min
            && p.transcription_min <= p.transcription_max
            && p.transcription_max <= 100.0;
        if !ordered {
            return Err(anyhow!(
                "progress ranges must satisfy 0 <= preprocessing_max <= transcription_min <= transcription_max <= 100"
            ));
        }

        let supported = self.upload.supported_set();
        for format in self
            .upload
            .formats_requiring_conversion
            .iter()
            .chain(self.upload.audio_formats.iter())
        {
            if !supported.contains(&format.to_lowercase()) {
                return Err(anyhow!("format {} is not in supported_formats", format));
            }
        }

        tracing::info!("✅ Configuration validation passed");
        Ok(())
    }

    /// Get runtime configuration summary
    pub fn summary(&self) -> String {
        format!(
            "Whisperrr Configuration:\n\
            - Model: {} (compute: {})\n\
            - Workers: {}\n\
            - Canonical audio: {}Hz, {} channel(s)\n\
            - Max upload: {} MB\n\
            - Scratch directory: {}\n\
            - Job retention: {}s",
            self.transcription.model_size,
            self.transcription.compute_type,
            self.transcription.max_concurrent_transcriptions,
            self.audio.target_sample_rate,
            self.audio.channels,
            self.upload.max_file_size_mb,
            self.upload.scratch_dir.display(),
            self.jobs.retention_seconds,
        )
    }
}

/// Configuration builder for programmatic config creation
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.config.transcription.max_concurrent_transcriptions = workers;
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.config.audio.target_sample_rate = sample_rate;
        self
    }

    pub fn with_scratch_dir(mut self, dir: PathBuf) -> Self {
        self.config.upload.scratch_dir = dir;
        self
    }

    pub fn with_model_size(mut self, model: &str) -> Self {
        self.config.transcription.model_size = model.to_string();
        self
    }

    pub fn with_max_file_size_mb(mut self, size: u64) -> Self {
        self.config.upload.max_file_size_mb = size;
        self
    }

    pub fn with_tools(mut self, ffmpeg: &str, ffprobe: &str) -> Self {
        self.config.audio.ffmpeg_path = ffmpeg.to_string();
        self.config.audio.ffprobe_path = ffprobe.to_string();
        self
    }

    pub fn with_retention_seconds(mut self, seconds: u64) -> Self {
        self.config.jobs.retention_seconds = seconds;
        self
    }

    pub fn with_max_drain_seconds(mut self, seconds: u64) -> Self {
        self.config.shutdown.max_drain_seconds = seconds;
        self
    }

    pub fn cleanup_temp_files(mut self, enable: bool) -> Self {
        self.config.audio.cleanup_temp_files = enable;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.audio.target_sample_rate, 16000);
        assert_eq!(config.audio.channels, 1);
        assert_eq!(config.progress.preprocessing_max, 40.0);
        assert!(config.upload.requires_conversion("MP4"));
        assert!(config.upload.is_audio("wav"));
        assert!(!config.upload.is_audio("mkv"));
        assert_eq!(config.upload.max_file_size_bytes(), 1000 * 1024 * 1024);
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .with_workers(8)
            .with_sample_rate(44100)
            .with_model_size("small")
            .build();

        assert_eq!(config.transcription.max_concurrent_transcriptions, 8);
        assert_eq!(config.audio.target_sample_rate, 44100);
        assert_eq!(config.transcription.model_size, "small");
    }

    #[test]
    fn test_config_validation() {
        assert!(Config::default().validate().is_ok());

        let config = ConfigBuilder::new().with_workers(0).build();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.progress.preprocessing_max = 60.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [transcription]
            model_size = "small"

            [jobs]
            retention_seconds = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.transcription.model_size, "small");
        assert_eq!(config.transcription.beam_size, 5);
        assert_eq!(config.jobs.retention_seconds, 10);
        assert_eq!(config.audio.ffmpeg_path, "ffmpeg");
    }
}
