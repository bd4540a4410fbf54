//! HTTP surface for the transcription service
//!
//! A thin adapter over the [`Orchestrator`]: multipart uploads in,
//! transcription results, job handles and progress snapshots out.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::orchestrator::Orchestrator;

pub mod handlers;
pub mod models;
pub mod server;

pub use server::{router, start_http_server, AppState};

/// API server bound to one orchestrator
pub struct ApiServer {
    orchestrator: Arc<Orchestrator>,
    config: Arc<Config>,
    port: u16,
}

impl ApiServer {
    pub fn new(orchestrator: Arc<Orchestrator>, config: Arc<Config>, port: u16) -> Self {
        Self {
            orchestrator,
            config,
            port,
        }
    }

    /// Serve until a shutdown signal arrives
    pub async fn start(self) -> Result<()> {
        info!("🚀 Starting API server on port {}", self.port);
        server::start_http_server(self.orchestrator, self.config, self.port).await
    }
}
