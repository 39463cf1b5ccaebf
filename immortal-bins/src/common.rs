//! Common utilities for all binaries
//!
//! Shared initialization, CLI parsing, and setup code.

use anyhow::Result;
use clap::Args;
use immortal_core::config::{Config, LoggingConfig};
use immortal_core::monitoring::{MetricsRegistry, MetricsServer, MetricsServerConfig};
use immortal_core::utils::init_logger;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Common CLI arguments for all binaries
#[derive(Args, Debug)]
pub struct CommonArgs {
    /// JSON configuration file; defaults apply when absent
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (overridden by RUST_LOG)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    pub json_logs: bool,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,
}

impl CommonArgs {
    /// Load the configuration file and apply command-line overrides
    pub fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.json_logs {
            config.logging.json = true;
        }
        if let Some(addr) = self.metrics_addr {
            config.metrics = Some(MetricsServerConfig {
                listen_addr: addr,
                ..config.metrics.take().unwrap_or_default()
            });
        }

        config.validate()?;
        Ok(config)
    }
}

/// Initialize tracing/logging
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    init_logger(config)
}

/// Flag flipped by Ctrl+C
pub fn install_shutdown_handler() -> Result<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::warn!("Received Ctrl+C, initiating graceful shutdown...");
        flag.store(true, Ordering::SeqCst);
    })?;
    Ok(shutdown)
}

/// Run the metrics endpoint on its own tokio runtime until `shutdown` is set
pub fn spawn_metrics_server(
    config: MetricsServerConfig,
    registry: MetricsRegistry,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let handle = std::thread::Builder::new()
        .name("metrics".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                let server = match MetricsServer::bind(&config, registry).await {
                    Ok(server) => server,
                    Err(e) => {
                        tracing::error!("Metrics server failed to start: {:#}", e);
                        return;
                    }
                };
                let stop = async move {
                    while !shutdown.load(Ordering::SeqCst) {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                };
                if let Err(e) = server.serve(stop).await {
                    tracing::error!("Metrics server error: {:#}", e);
                }
            });
        })?;

    Ok(handle)
}
