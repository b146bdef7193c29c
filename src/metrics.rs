//! Lifecycle metrics
//!
//! Emitted through the `metrics` facade; whichever recorder the embedding
//! process installs collects them. The CLI installs a Prometheus recorder on
//! request.

use anyhow::Result;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install a Prometheus recorder as the global recorder
///
/// The returned handle renders the text exposition format.
pub fn setup_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

    tracing::debug!("Prometheus metrics recorder installed");

    Ok(handle)
}

/// Record a download run starting
pub fn record_download_started(name: &str) {
    metrics::counter!("diffuser_manager_downloads_started_total",
        "model" => name.to_string()
    )
    .increment(1);
}

/// Record a download run that verified
pub fn record_download_completed(name: &str) {
    metrics::counter!("diffuser_manager_downloads_completed_total",
        "model" => name.to_string()
    )
    .increment(1);
}

/// Record a failed download run
pub fn record_download_failed(name: &str) {
    metrics::counter!("diffuser_manager_downloads_failed_total",
        "model" => name.to_string()
    )
    .increment(1);
}

/// Update bytes on disk for an in-flight download
pub fn update_downloaded_bytes(name: &str, bytes: u64) {
    metrics::gauge!("diffuser_manager_downloaded_bytes",
        "model" => name.to_string()
    )
    .set(bytes as f64);
}

/// Record a successful model load
pub fn record_model_loaded(name: &str) {
    metrics::counter!("diffuser_manager_model_loads_total",
        "model" => name.to_string()
    )
    .increment(1);
}

/// Record a failed model load
pub fn record_load_failure(name: &str) {
    metrics::counter!("diffuser_manager_model_load_failures_total",
        "model" => name.to_string()
    )
    .increment(1);
}

/// Record a model unload
pub fn record_model_unloaded(name: &str) {
    metrics::counter!("diffuser_manager_model_unloads_total",
        "model" => name.to_string()
    )
    .increment(1);
}
