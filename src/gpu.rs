//! GPU detection and hardware advisories
//!
//! Detects visible GPUs and their memory via nvidia-smi. The result only feeds
//! advisories: a model whose declared VRAM minimum exceeds what is detected is
//! logged, never refused.

use crate::models::ModelDescriptor;
use std::process::Command;
use std::sync::OnceLock;

/// Cached GPU information detected on first use
static GPU_INFO: OnceLock<GpuInfo> = OnceLock::new();

#[derive(Debug, Clone, PartialEq)]
pub struct GpuDevice {
    pub index: u32,
    pub memory_total_mb: u64,
}

/// Information about available GPUs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpuInfo {
    pub devices: Vec<GpuDevice>,
}

impl GpuInfo {
    pub fn count(&self) -> usize {
        self.devices.len()
    }

    /// Memory of the largest visible device, in GB
    pub fn max_vram_gb(&self) -> Option<f32> {
        self.devices
            .iter()
            .map(|d| d.memory_total_mb)
            .max()
            .map(|mb| mb as f32 / 1024.0)
    }
}

/// Parse `index, memory.total` CSV rows (no header, no units)
fn parse_devices(stdout: &str) -> Vec<GpuDevice> {
    stdout
        .lines()
        .filter_map(|line| {
            let (index, memory) = line.split_once(',')?;
            Some(GpuDevice {
                index: index.trim().parse().ok()?,
                memory_total_mb: memory.trim().parse().ok()?,
            })
        })
        .collect()
}

/// Detect available GPUs using nvidia-smi
pub fn detect_gpus() -> GpuInfo {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output();

    match output {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let devices = parse_devices(&stdout);

            tracing::info!(
                gpu_count = devices.len(),
                devices = ?devices,
                "Detected available GPUs"
            );

            GpuInfo { devices }
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(
                stderr = %stderr,
                "nvidia-smi failed, assuming no GPUs available"
            );
            GpuInfo::default()
        }
        Err(e) => {
            tracing::debug!(
                error = %e,
                "Failed to run nvidia-smi, assuming no GPUs available"
            );
            GpuInfo::default()
        }
    }
}

/// Get cached GPU info, or detect if not initialized
pub fn get_or_init() -> &'static GpuInfo {
    GPU_INFO.get_or_init(detect_gpus)
}

/// Advisory message when a model's VRAM minimum exceeds the detected GPUs
///
/// Returns `None` when the model declares no minimum or nothing was detected
/// (no GPU tooling is not evidence of too little memory).
pub fn check_requirements(descriptor: &ModelDescriptor, info: &GpuInfo) -> Option<String> {
    let required = descriptor
        .hardware_requirements
        .as_ref()
        .and_then(|h| h.min_vram_gb)?;
    let available = info.max_vram_gb()?;

    (available < required).then(|| {
        format!(
            "'{}' needs at least {required:.1} GB VRAM, largest GPU has {available:.1} GB",
            descriptor.name
        )
    })
}

/// Log the hardware advisory for a model, if any
pub fn advise(descriptor: &ModelDescriptor) {
    if let Some(message) = check_requirements(descriptor, get_or_init()) {
        tracing::warn!(model = %descriptor.name, "{message}");
    }
}
