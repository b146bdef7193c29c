//! Download subsystem: orchestration, progress sampling and the per-model lock

pub mod lock;
pub mod orchestrator;
pub mod progress;

pub use lock::{DownloadLock, LockInfo};
pub use orchestrator::{DownloadOrchestrator, DownloadReport, DownloadState};
pub use progress::{DownloadSession, ProgressSnapshot, format_duration};
