//! Monitoring and observability
//!
//! Prometheus metric families for pipes and streams, plus an HTTP server
//! that exposes them for scraping.

pub mod metrics;
pub mod server;

pub use metrics::{MetricsRegistry, PipeMetrics, StreamMetrics};
pub use server::{encode_metrics, MetricsServer, MetricsServerConfig};
