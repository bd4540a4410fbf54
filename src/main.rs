use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use whisperrr_service::engine::Task;
use whisperrr_service::progress::StageProgress;
use whisperrr_service::{Config, Orchestrator, ProgressReporter, TranscribeOptions, TranscriptionEngine, WhisperCliLoader};

#[derive(Parser)]
#[command(name = "whisperrr")]
#[command(about = "Media preprocessing and Whisper transcription service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to the standard search paths)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Transcribe one file and print the result as JSON
    Transcribe {
        /// Audio or video file
        file: PathBuf,
        /// Model size (tiny, base, small, ...)
        #[arg(long)]
        model: Option<String>,
        /// Language code; detected when omitted
        #[arg(long)]
        language: Option<String>,
        #[arg(long, default_value_t = 0.0)]
        temperature: f64,
        /// transcribe or translate
        #[arg(long)]
        task: Option<String>,
    },
    /// Run the HTTP service
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    init_logging(&config, cli.verbose);

    if let Commands::Transcribe { model: Some(model), .. } = &cli.command {
        config.transcription.model_size = model.clone();
    }
    config.validate()?;
    debug!("{}", config.summary());

    let config = Arc::new(config);
    let loader = Arc::new(WhisperCliLoader::new(&config.transcription));
    let engine = Arc::new(TranscriptionEngine::new(Arc::clone(&config), loader));
    let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&config), engine));

    match cli.command {
        Commands::Transcribe {
            file,
            language,
            temperature,
            task,
            ..
        } => {
            let task = task.as_deref().unwrap_or(&config.transcription.default_task);
            let options = TranscribeOptions {
                model_size: None,
                language,
                temperature,
                task: task.parse::<Task>()?,
            };
            transcribe(&orchestrator, file, options).await
        }
        Commands::Serve { port } => serve(orchestrator, Arc::clone(&config), port).await,
    }
}

fn init_logging(config: &Config, verbose: bool) {
    let fallback = if verbose { "debug" } else { config.server.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn transcribe(orchestrator: &Orchestrator, file: PathBuf, options: TranscribeOptions) -> Result<()> {
    if !file.exists() {
        return Err(anyhow!("Input file not found: {}", file.display()));
    }

    orchestrator.start().await?;
    info!("🎧 Transcribing {}", file.display());

    let reporter = ProgressReporter::new(Arc::new(|p: StageProgress| {
        info!("📊 {:>5.1}% {}", p.percent, p.message);
    }));
    let result = orchestrator.transcribe_file(&file, &options, &reporter).await;
    orchestrator.shutdown().await;

    let result = result?;
    info!(
        "🎉 Done in {:.2}s: {} segments, language {}",
        result.processing_time,
        result.segments.len(),
        result.language.as_deref().unwrap_or("unknown")
    );
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[cfg(feature = "api")]
async fn serve(orchestrator: Arc<Orchestrator>, config: Arc<Config>, port: Option<u16>) -> Result<()> {
    use whisperrr_service::api::ApiServer;

    // the service stays up in a degraded state without a model
    if let Err(e) = orchestrator.start().await {
        warn!("⚠️ Startup model load failed: {}", e);
    }

    let port = port.unwrap_or(config.server.port);
    let result = ApiServer::new(Arc::clone(&orchestrator), config, port).start().await;
    orchestrator.shutdown().await;
    result
}

#[cfg(not(feature = "api"))]
async fn serve(_orchestrator: Arc<Orchestrator>, _config: Arc<Config>, _port: Option<u16>) -> Result<()> {
    warn!("Rebuild with --features api to run the HTTP service");
    Err(anyhow!("whisperrr was built without the api feature"))
}
