//! Transcription engine adapter.
//!
//! Owns the loaded model, serialises model loads, bounds concurrent
//! transcriptions with a semaphore and turns runtime segments into a
//! [`TranscriptionResult`].

pub mod runtime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Result, ServiceError};
use crate::pipeline::Preprocessor;
use crate::progress::ProgressReporter;
use crate::scratch::{ScratchFile, ScratchSpace};
use crate::validation::MediaValidator;

pub use runtime::{
    DecodeOptions, Device, LanguageInfo, ModelLoader, RawSegment, RuntimeOutput, SpeechModel, Task,
    WhisperCliLoader,
};

/// A single transcription call
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub path: PathBuf,
    /// Model size to use; triggers a load when it differs from the current one
    pub model_size: Option<String>,
    pub language: Option<String>,
    pub temperature: f64,
    pub task: Task,
}

impl TranscriptionRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            model_size: None,
            language: None,
            temperature: 0.0,
            task: Task::Transcribe,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub avg_logprob: Option<f64>,
    pub no_speech_prob: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub text: String,
    pub language: Option<String>,
    pub language_probability: Option<f64>,
    /// Seconds of canonical audio
    pub duration: f64,
    pub segments: Vec<Segment>,
    /// Approximate overall confidence in [0, 1]
    pub confidence: Option<f64>,
    pub model_used: String,
    /// Wall-clock seconds
    pub processing_time: f64,
}

/// Result of a load request
#[derive(Debug, Clone, Serialize)]
pub struct LoadOutcome {
    pub model_size: String,
    pub already_loaded: bool,
    pub load_time_seconds: f64,
    pub message: String,
}

/// Snapshot of the engine state
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub model_size: Option<String>,
    pub is_loaded: bool,
    pub device: Device,
    pub compute_type: String,
    pub last_loaded: Option<DateTime<Utc>>,
    pub loaded_for_seconds: f64,
    pub supported_languages: Vec<String>,
    pub uptime_seconds: f64,
    pub active_transcriptions: usize,
}

struct LoadedModel {
    size: String,
    model: Arc<dyn SpeechModel>,
    loaded_at: DateTime<Utc>,
    loaded_instant: Instant,
}

/// Decrements the active counter however the call ends
struct ActiveGuard {
    counter: Arc<AtomicUsize>,
}

impl ActiveGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self {
            counter: Arc::clone(counter),
        }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Precision for `device`; unsupported overrides fall back to the device default
pub fn select_compute_type(device: Device, configured: &str) -> String {
    let configured = configured.to_lowercase();
    let (allowed, default): (&[&str], &str) = match device {
        Device::Cuda => (&["float16", "float32"], "float16"),
        Device::Cpu => (&["int8", "float32"], "int8"),
    };

    if allowed.contains(&configured.as_str()) {
        configured
    } else {
        if configured != "auto" {
            warn!(
                "Compute type {} is not supported on {}, using {}",
                configured,
                device.as_str(),
                default
            );
        }
        default.to_string()
    }
}

/// Approximate confidence from the mean segment log-probability
pub fn confidence_from_logprobs(segments: &[RawSegment]) -> Option<f64> {
    let logprobs: Vec<f64> = segments.iter().filter_map(|s| s.avg_logprob).collect();
    if logprobs.is_empty() {
        return None;
    }
    let mean = logprobs.iter().sum::<f64>() / logprobs.len() as f64;
    Some(((mean + 1.0) / 2.0).clamp(0.0, 1.0))
}

/// Shared transcription engine
pub struct TranscriptionEngine {
    config: Arc<Config>,
    loader: Arc<dyn ModelLoader>,
    validator: MediaValidator,
    preprocessor: Preprocessor,
    device: Device,
    compute_type: String,
    model: RwLock<Option<LoadedModel>>,
    load_lock: Mutex<()>,
    workers: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    shutting_down: AtomicBool,
    started: Instant,
}

impl TranscriptionEngine {
    pub fn new(config: Arc<Config>, loader: Arc<dyn ModelLoader>) -> Self {
        let device = if loader.accelerator_available() {
            Device::Cuda
        } else {
            Device::Cpu
        };
        let compute_type = select_compute_type(device, &config.transcription.compute_type);
        let workers = config.transcription.max_concurrent_transcriptions.max(1);
        let scratch = ScratchSpace::new(config.upload.scratch_dir.clone());

        info!(
            "🔧 Transcription engine: device={}, compute_type={}, workers={}",
            device.as_str(),
            compute_type,
            workers
        );

        Self {
            validator: MediaValidator::new(&config),
            preprocessor: Preprocessor::new(&config, scratch),
            config,
            loader,
            device,
            compute_type,
            model: RwLock::new(None),
            load_lock: Mutex::new(()),
            workers: Arc::new(Semaphore::new(workers)),
            active: Arc::new(AtomicUsize::new(0)),
            shutting_down: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    pub fn with_preprocessor(mut self, preprocessor: Preprocessor) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    pub fn with_validator(mut self, validator: MediaValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn compute_type(&self) -> &str {
        &self.compute_type
    }

    pub async fn is_model_loaded(&self) -> bool {
        self.model.read().await.is_some()
    }

    pub async fn current_model_size(&self) -> Option<String> {
        self.model.read().await.as_ref().map(|m| m.size.clone())
    }

    pub fn active_transcriptions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Load `size` (the configured default when `None`).
    ///
    /// Loading the model that is already loaded is a no-op. Only one load runs
    /// at a time; a request arriving while another load is running fails
    /// immediately instead of waiting.
    pub async fn load_model(&self, size: Option<&str>) -> Result<LoadOutcome> {
        self.resolve_model(size).await.map(|(outcome, _)| outcome)
    }

    /// Like `load_model`, but also hands back the model that was resolved so
    /// the caller keeps using it even if another request swaps the slot.
    async fn resolve_model(&self, size: Option<&str>) -> Result<(LoadOutcome, Arc<dyn SpeechModel>)> {
        let size = size.unwrap_or(&self.config.transcription.model_size).to_string();

        if let Some(model) = self.model_of_size(&size).await {
            return Ok((
                LoadOutcome {
                    message: format!("Model {} already loaded", size),
                    model_size: size,
                    already_loaded: true,
                    load_time_seconds: 0.0,
                },
                model,
            ));
        }

        if !self.config.transcription.available_models.iter().any(|m| m == &size) {
            return Err(ServiceError::ModelLoadFailed {
                model: size,
                reason: "Unsupported model size".to_string(),
            });
        }

        let _loading = self.load_lock.try_lock().map_err(|_| ServiceError::ModelLoadFailed {
            model: size.clone(),
            reason: "Model is already being loaded".to_string(),
        })?;

        let start = Instant::now();
        info!("📦 Loading model {} on {} ({})", size, self.device.as_str(), self.compute_type);

        let model = self
            .loader
            .load(&size, self.device, &self.compute_type)
            .await
            .map_err(|e| {
                error!("❌ Failed to load model {}: {}", size, e);
                ServiceError::ModelLoadFailed {
                    model: size.clone(),
                    reason: format!("{:#}", e),
                }
            })?;

        *self.model.write().await = Some(LoadedModel {
            size: size.clone(),
            model: Arc::clone(&model),
            loaded_at: Utc::now(),
            loaded_instant: Instant::now(),
        });

        let load_time = start.elapsed().as_secs_f64();
        info!("✅ Model {} loaded in {:.2}s", size, load_time);
        Ok((
            LoadOutcome {
                message: format!("Model {} loaded successfully", size),
                model_size: size,
                already_loaded: false,
                load_time_seconds: (load_time * 1000.0).round() / 1000.0,
            },
            model,
        ))
    }

    async fn model_of_size(&self, size: &str) -> Option<Arc<dyn SpeechModel>> {
        self.model
            .read()
            .await
            .as_ref()
            .filter(|m| m.size == size)
            .map(|m| Arc::clone(&m.model))
    }

    async fn loaded_model(&self) -> Result<(String, Arc<dyn SpeechModel>)> {
        self.model
            .read()
            .await
            .as_ref()
            .map(|m| (m.size.clone(), Arc::clone(&m.model)))
            .ok_or_else(|| ServiceError::ModelNotLoaded("No model is currently loaded".to_string()))
    }

    /// Validate, preprocess and transcribe one file.
    ///
    /// `progress` receives the job-global scale: preprocessing fills the
    /// configured low sub-range, the runtime the high one.
    pub async fn transcribe(
        &self,
        request: TranscriptionRequest,
        progress: &ProgressReporter,
    ) -> Result<TranscriptionResult> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ServiceError::ModelNotLoaded("Service is shutting down".to_string()));
        }
        if !self.is_model_loaded().await {
            return Err(ServiceError::ModelNotLoaded("No model is currently loaded".to_string()));
        }

        let _active = ActiveGuard::enter(&self.active);

        // the handle resolved here serves the whole call
        let (model_used, model) = match request.model_size.as_deref() {
            Some(size) => {
                let (outcome, model) = self.resolve_model(Some(size)).await?;
                (outcome.model_size, model)
            }
            None => self.loaded_model().await?,
        };

        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| ServiceError::ModelNotLoaded("Worker pool closed".to_string()))?;
        debug!("Worker acquired for {}", request.path.display());

        let start = Instant::now();
        let ranges = &self.config.progress;

        progress.report(0.0, "Validating file format...");
        self.validator.validate(&request.path).await?;

        let preprocessing = progress.child(0.0, ranges.preprocessing_max);
        let audio = self.preprocessor.run(&request.path, &preprocessing).await?;

        let canonical = ScratchFile::new(audio.path.clone());
        let canonical_path = if self.config.audio.cleanup_temp_files {
            audio.path.clone()
        } else {
            canonical.persist()
        };

        let stage = progress.child(ranges.transcription_min, ranges.transcription_max);
        stage.report(0.0, "Initializing Whisper model...");

        let options = DecodeOptions {
            beam_size: self.config.transcription.beam_size,
            temperature: request.temperature,
            task: request.task,
            language: request.language.clone(),
        };
        stage.report(5.0, "Starting audio transcription...");

        let output = model.transcribe(&canonical_path, &options).await.map_err(|e| {
            error!("❌ Runtime failed on {}: {:#}", canonical_path.display(), e);
            ServiceError::transcription("Transcription failed", Some(format!("{:#}", e)))
        })?;

        stage.report(10.0, "Processing audio segments...");
        let tcfg = &self.config.transcription;
        let interval = tcfg.segment_progress_interval.max(1);
        for idx in (0..output.segments.len()).step_by(interval) {
            let percent = (tcfg.segment_progress_base + idx as f64 * tcfg.segment_progress_multiplier)
                .min(tcfg.segment_progress_max);
            stage.report(percent, format!("Transcribed {} segment(s)...", idx + 1));
        }

        stage.report(95.0, "Formatting transcription results...");
        let result = assemble_result(output, audio.duration, model_used, start.elapsed());
        stage.report(100.0, "Transcription completed successfully");

        info!(
            "✅ Transcribed {} in {:.2}s ({} segments)",
            request.path.display(),
            result.processing_time,
            result.segments.len()
        );
        Ok(result)
    }

    pub async fn model_info(&self) -> ModelInfo {
        let model = self.model.read().await;
        ModelInfo {
            model_size: model.as_ref().map(|m| m.size.clone()),
            is_loaded: model.is_some(),
            device: self.device,
            compute_type: self.compute_type.clone(),
            last_loaded: model.as_ref().map(|m| m.loaded_at),
            loaded_for_seconds: model
                .as_ref()
                .map(|m| m.loaded_instant.elapsed().as_secs_f64())
                .unwrap_or(0.0),
            supported_languages: self.config.transcription.supported_languages.clone(),
            uptime_seconds: self.uptime().as_secs_f64(),
            active_transcriptions: self.active_transcriptions(),
        }
    }

    /// Stop accepting work, wait (bounded) for active calls, then drop the model
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let poll = Duration::from_millis(self.config.shutdown.drain_poll_millis.max(1));
        let deadline = Instant::now() + Duration::from_secs(self.config.shutdown.max_drain_seconds);

        while self.active_transcriptions() > 0 {
            if Instant::now() >= deadline {
                warn!(
                    "⚠️ Drain timeout reached with {} active transcription(s), proceeding",
                    self.active_transcriptions()
                );
                break;
            }
            tokio::time::sleep(poll).await;
        }

        *self.model.write().await = None;
        info!("🛑 Transcription engine shut down");
    }
}

fn assemble_result(
    output: RuntimeOutput,
    duration: f64,
    model_used: String,
    elapsed: Duration,
) -> TranscriptionResult {
    let confidence = confidence_from_logprobs(&output.segments);

    let segments: Vec<Segment> = output
        .segments
        .into_iter()
        .map(|seg| Segment {
            start: seg.start,
            end: seg.end,
            text: seg.text.trim().to_string(),
            avg_logprob: seg.avg_logprob,
            no_speech_prob: seg.no_speech_prob,
        })
        .collect();

    let text = segments
        .iter()
        .filter(|s| !s.text.is_empty())
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    TranscriptionResult {
        text,
        language: output.info.language,
        language_probability: output.info.probability,
        duration,
        segments,
        confidence,
        model_used,
        processing_time: (elapsed.as_secs_f64() * 1000.0).round() / 1000.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use async_trait::async_trait;
    use std::path::Path;

    fn segment(text: &str, logprob: Option<f64>) -> RawSegment {
        RawSegment {
            start: 0.0,
            end: 1.0,
            text: text.to_string(),
            avg_logprob: logprob,
            no_speech_prob: None,
        }
    }

    struct EchoModel(String);

    #[async_trait]
    impl SpeechModel for EchoModel {
        fn size(&self) -> &str {
            &self.0
        }

        async fn transcribe(&self, _audio: &Path, _options: &DecodeOptions) -> anyhow::Result<RuntimeOutput> {
            Ok(RuntimeOutput::default())
        }
    }

    struct SlowLoader {
        delay: Duration,
        gpu: bool,
    }

    #[async_trait]
    impl ModelLoader for SlowLoader {
        fn accelerator_available(&self) -> bool {
            self.gpu
        }

        async fn load(&self, size: &str, _device: Device, _compute: &str) -> anyhow::Result<Arc<dyn SpeechModel>> {
            tokio::time::sleep(self.delay).await;
            if size == "large" {
                anyhow::bail!("out of memory");
            }
            Ok(Arc::new(EchoModel(size.to_string())))
        }
    }

    fn engine(delay: Duration, gpu: bool) -> TranscriptionEngine {
        let config = Arc::new(ConfigBuilder::new().with_model_size("tiny").build());
        TranscriptionEngine::new(config, Arc::new(SlowLoader { delay, gpu }))
    }

    #[test]
    fn test_compute_type_selection() {
        assert_eq!(select_compute_type(Device::Cuda, "auto"), "float16");
        assert_eq!(select_compute_type(Device::Cuda, "float32"), "float32");
        assert_eq!(select_compute_type(Device::Cuda, "int8"), "float16");
        assert_eq!(select_compute_type(Device::Cpu, "auto"), "int8");
        assert_eq!(select_compute_type(Device::Cpu, "FLOAT32"), "float32");
        assert_eq!(select_compute_type(Device::Cpu, "float16"), "int8");
    }

    #[test]
    fn test_confidence_from_logprobs() {
        assert_eq!(confidence_from_logprobs(&[segment("a", None)]), None);
        let c = confidence_from_logprobs(&[segment("a", Some(-0.2)), segment("b", Some(-0.4))]).unwrap();
        assert!((c - 0.35).abs() < 1e-9);
        assert_eq!(confidence_from_logprobs(&[segment("a", Some(-5.0))]), Some(0.0));
        assert_eq!(confidence_from_logprobs(&[segment("a", Some(3.0))]), Some(1.0));
    }

    #[test]
    fn test_assemble_skips_empty_text() {
        let output = RuntimeOutput {
            segments: vec![segment(" Hello ", None), segment("   ", None), segment("world.", None)],
            info: LanguageInfo {
                language: Some("en".to_string()),
                probability: Some(0.98),
            },
        };
        let result = assemble_result(output, 5.0, "tiny".to_string(), Duration::from_millis(1500));
        assert_eq!(result.text, "Hello world.");
        assert_eq!(result.segments.len(), 3);
        assert_eq!(result.language.as_deref(), Some("en"));
        assert_eq!(result.processing_time, 1.5);
    }

    #[tokio::test]
    async fn test_device_follows_loader() {
        assert_eq!(engine(Duration::ZERO, true).device(), Device::Cuda);
        assert_eq!(engine(Duration::ZERO, true).compute_type(), "float16");
        assert_eq!(engine(Duration::ZERO, false).compute_type(), "int8");
    }

    #[tokio::test]
    async fn test_load_is_noop_when_already_loaded() {
        let engine = engine(Duration::ZERO, false);
        assert!(!engine.load_model(None).await.unwrap().already_loaded);
        let again = engine.load_model(Some("tiny")).await.unwrap();
        assert!(again.already_loaded);
        assert_eq!(again.load_time_seconds, 0.0);
        assert_eq!(engine.current_model_size().await.as_deref(), Some("tiny"));
    }

    #[tokio::test]
    async fn test_concurrent_load_fails_fast() {
        let engine = Arc::new(engine(Duration::from_millis(300), false));

        let first = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.load_model(Some("base")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let err = engine.load_model(Some("small")).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(err.to_string().contains("already being loaded"));

        assert!(first.await.unwrap().is_ok());
        assert_eq!(engine.current_model_size().await.as_deref(), Some("base"));
    }

    #[tokio::test]
    async fn test_resolved_model_survives_later_swap() {
        let engine = engine(Duration::ZERO, false);
        engine.load_model(None).await.unwrap();

        let (outcome, small) = engine.resolve_model(Some("small")).await.unwrap();
        assert_eq!(outcome.model_size, "small");
        engine.load_model(Some("base")).await.unwrap();

        assert_eq!(small.size(), "small");
        assert_eq!(engine.current_model_size().await.as_deref(), Some("base"));

        let (outcome, base) = engine.resolve_model(Some("base")).await.unwrap();
        assert!(outcome.already_loaded);
        assert_eq!(base.size(), "base");
    }

    #[tokio::test]
    async fn test_load_failure_and_unknown_size() {
        let engine = engine(Duration::ZERO, false);
        let err = engine.load_model(Some("large")).await.unwrap_err();
        assert!(matches!(err, ServiceError::ModelLoadFailed { .. }));
        assert!(!engine.is_model_loaded().await);

        let err = engine.load_model(Some("gigantic")).await.unwrap_err();
        assert!(err.to_string().contains("gigantic"));
    }

    #[tokio::test]
    async fn test_transcribe_requires_loaded_model() {
        let engine = engine(Duration::ZERO, false);
        let err = engine
            .transcribe(TranscriptionRequest::new("/nonexistent.wav"), &ProgressReporter::silent())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::ModelNotLoaded(_)));
        assert_eq!(engine.active_transcriptions(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_unloads_model() {
        let engine = engine(Duration::ZERO, false);
        engine.load_model(None).await.unwrap();
        engine.shutdown().await;

        let info = engine.model_info().await;
        assert!(!info.is_loaded);
        assert_eq!(info.active_transcriptions, 0);
    }
}
