use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to install Prometheus exporter: {0}")]
    Install(#[from] BuildError),
}

/// Install the global Prometheus recorder and serve `/metrics` on every
/// interface at `port`. Must be called inside a tokio runtime.
pub fn install_exporter(port: u16) -> Result<SocketAddr, ExportError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!("Listening for /metrics requests on {}", addr);
    Ok(addr)
}
