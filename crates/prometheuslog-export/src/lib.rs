//! Prometheus exposition for prometheuslog
//!
//! This crate installs the `/metrics` HTTP endpoint and periodically copies
//! every application's metric sink into the process-wide `metrics` recorder.

mod bridge;
mod exporter;

pub use bridge::{ExportBridge, exposed_name};
pub use exporter::{ExportError, install_exporter};
