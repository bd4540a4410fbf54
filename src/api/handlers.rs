//! API request handlers

use axum::extract::multipart::{Multipart, MultipartError};
use axum::http::StatusCode;
use serde_json::{json, Value};

use super::models::{ApiError, CorrelationId, TranscribeQuery};
use crate::config::Config;
use crate::engine::Task;
use crate::orchestrator::{Orchestrator, TranscribeOptions};

/// A file received in a multipart `file` field
#[derive(Debug)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Check query parameters against the configured limits
pub fn transcribe_options(query: &TranscribeQuery, config: &Config) -> Result<TranscribeOptions, String> {
    let tcfg = &config.transcription;

    let temperature = query.temperature.unwrap_or(0.0);
    if !(0.0..=1.0).contains(&temperature) {
        return Err(format!("temperature must be between 0.0 and 1.0, got {}", temperature));
    }

    if let Some(size) = &query.model_size {
        if !tcfg.available_models.iter().any(|m| m == size) {
            return Err(format!(
                "Unsupported model size: {}. Available: {}",
                size,
                tcfg.available_models.join(", ")
            ));
        }
    }

    let language = match query.language.as_deref().map(str::trim) {
        None | Some("") | Some("auto") => None,
        Some(lang) => {
            let lang = lang.to_lowercase();
            if !tcfg.supported_languages.contains(&lang) {
                return Err(format!("Unsupported language: {}", lang));
            }
            Some(lang)
        }
    };

    let task = query.task.as_deref().unwrap_or(&tcfg.default_task);
    let task: Task = task.parse().map_err(|e: anyhow::Error| e.to_string())?;

    Ok(TranscribeOptions {
        model_size: query.model_size.clone(),
        language,
        temperature,
        task,
    })
}

/// Read the `file` field of a multipart upload
pub async fn read_upload(
    multipart: &mut Multipart,
    max_size: u64,
    correlation_id: &CorrelationId,
) -> Result<Upload, ApiError> {
    let rejected = |e: MultipartError| upload_error(e, max_size, correlation_id);

    while let Some(field) = multipart.next_field().await.map_err(rejected)? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload").to_string();
        let bytes = field.bytes().await.map_err(rejected)?;
        return Ok(Upload {
            filename,
            bytes: bytes.to_vec(),
        });
    }

    Err(ApiError::validation("No file provided in the 'file' field", correlation_id))
}

fn upload_error(err: MultipartError, max_size: u64, correlation_id: &CorrelationId) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        let mut error = ApiError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "FILE_TOO_LARGE",
            format!("File too large (maximum {} bytes)", max_size),
            correlation_id,
        );
        error.body.details = json!({ "max_size": max_size, "category": "too_large" });
        error
    } else {
        ApiError::validation(format!("Invalid multipart upload: {}", err.body_text()), correlation_id)
    }
}

/// Handle health check requests
pub async fn health_check(orchestrator: &Orchestrator) -> Value {
    let report = orchestrator.health().await;
    json!({
        "status": report.status,
        "service": "whisperrr",
        "version": env!("CARGO_PKG_VERSION"),
        "model_loaded": report.model_loaded,
        "model_size": report.model_size,
        "uptime": report.uptime,
        "active_transcriptions": report.active_transcriptions,
        "tracked_jobs": report.tracked_jobs,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(temperature: Option<f64>, model: Option<&str>, task: Option<&str>) -> TranscribeQuery {
        TranscribeQuery {
            model_size: model.map(str::to_string),
            language: None,
            temperature,
            task: task.map(str::to_string),
        }
    }

    #[test]
    fn test_defaults() {
        let options = transcribe_options(&TranscribeQuery::default(), &Config::default()).unwrap();
        assert_eq!(options.temperature, 0.0);
        assert_eq!(options.task, Task::Transcribe);
        assert!(options.model_size.is_none());
        assert!(options.language.is_none());
    }

    #[test]
    fn test_rejects_bad_values() {
        let config = Config::default();
        assert!(transcribe_options(&query(Some(1.5), None, None), &config).is_err());
        assert!(transcribe_options(&query(None, Some("huge"), None), &config).is_err());
        assert!(transcribe_options(&query(None, None, Some("summarize")), &config).is_err());

        let options = transcribe_options(&query(Some(0.4), Some("small"), Some("translate")), &config).unwrap();
        assert_eq!(options.task, Task::Translate);
        assert_eq!(options.model_size.as_deref(), Some("small"));
    }

    #[test]
    fn test_language_normalisation() {
        let config = Config::default();
        let mut q = TranscribeQuery::default();
        q.language = Some("auto".to_string());
        assert!(transcribe_options(&q, &config).unwrap().language.is_none());

        q.language = Some("EN".to_string());
        assert_eq!(transcribe_options(&q, &config).unwrap().language.as_deref(), Some("en"));

        q.language = Some("xx".to_string());
        assert!(transcribe_options(&q, &config).is_err());
    }
}
