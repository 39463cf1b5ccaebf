//! HTTP endpoint for Prometheus scraping
//!
//! Serves `/metrics` (text exposition format) and `/health` over HTTP/1 on a
//! tokio runtime. Pipes and streams run on plain threads; only this server
//! needs the runtime.

use super::MetricsRegistry;
use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Configuration for the metrics HTTP server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsServerConfig {
    /// Address to bind to
    pub listen_addr: SocketAddr,
    /// Path to serve metrics on
    pub metrics_path: String,
}

impl Default for MetricsServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 9090)),
            metrics_path: "/metrics".to_string(),
        }
    }
}

/// Bound metrics server, ready to serve
pub struct MetricsServer {
    listener: TcpListener,
    metrics_path: String,
    registry: MetricsRegistry,
}

impl MetricsServer {
    /// Bind the listening socket
    pub async fn bind(config: &MetricsServerConfig, registry: MetricsRegistry) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind metrics server on {}", config.listen_addr))?;

        Ok(Self {
            listener,
            metrics_path: config.metrics_path.clone(),
            registry,
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read metrics server address")
    }

    /// Serve until `shutdown` resolves
    pub async fn serve<S>(self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        info!(
            "Metrics server listening on http://{}{}",
            self.local_addr()?,
            self.metrics_path
        );

        tokio::pin!(shutdown);

        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = &mut shutdown => {
                    info!("Metrics server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let registry = self.registry.clone();
            let metrics_path = self.metrics_path.clone();

            tokio::spawn(async move {
                let io = TokioIo::new(stream);

                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let response = route(req.uri().path(), &registry, &metrics_path);
                    async move { Ok::<_, hyper::Error>(response) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Connection error from {}: {}", remote_addr, err);
                }
            });
        }
    }
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn route(path: &str, registry: &MetricsRegistry, metrics_path: &str) -> Response<Full<Bytes>> {
    debug!("Metrics request: {}", path);

    if path == "/health" || path == "/healthz" {
        return respond(StatusCode::OK, "OK");
    }

    if path == metrics_path {
        return match encode_metrics(registry) {
            Ok(text) => {
                let mut response = respond(StatusCode::OK, text);
                response.headers_mut().insert(
                    hyper::header::CONTENT_TYPE,
                    hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
            Err(e) => {
                error!("Failed to encode metrics: {}", e);
                respond(StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {e:#}"))
            }
        };
    }

    warn!("Unknown metrics endpoint requested: {}", path);
    respond(StatusCode::NOT_FOUND, "Not Found")
}

/// Encode every registered family in Prometheus text format
pub fn encode_metrics(registry: &MetricsRegistry) -> Result<String> {
    let encoder = TextEncoder::new();
    let families = registry.registry().gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&families, &mut buffer)
        .context("Failed to encode metrics")?;

    String::from_utf8(buffer).context("Invalid UTF-8 in metrics")
}
