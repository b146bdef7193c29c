//! Download progress sampling
//!
//! Progress is derived purely from bytes on disk at successive instants, so
//! the same computation works for the downloading process and for any other
//! process watching the directory.

use crate::models::{LocalInventory, format_bytes};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Point-in-time view of a download
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub downloaded_bytes: u64,
    pub expected_bytes: Option<u64>,
    /// Bytes per second between the last two samples
    pub throughput_bps: Option<f64>,
    pub eta: Option<Duration>,
    pub partial_files: usize,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    pub fn percent(&self) -> Option<f64> {
        self.expected_bytes
            .filter(|expected| *expected > 0)
            .map(|expected| (self.downloaded_bytes as f64 / expected as f64 * 100.0).min(100.0))
    }

    /// One-line human summary
    pub fn describe(&self) -> String {
        let size = match self.expected_bytes {
            Some(expected) => format!(
                "{} / {} ({:.1}%)",
                format_bytes(self.downloaded_bytes),
                format_bytes(expected),
                self.percent().unwrap_or(0.0)
            ),
            None => format_bytes(self.downloaded_bytes),
        };
        let speed = match self.throughput_bps {
            Some(bps) => format!("{}/s", format_bytes(bps as u64)),
            None => "unknown speed".to_string(),
        };
        let eta = self
            .eta
            .map(format_duration)
            .unwrap_or_else(|| "unknown".to_string());

        format!("{size}, {speed}, ETA {eta}, {} partial file(s)", self.partial_files)
    }
}

/// Rolling sample history for one download
#[derive(Debug, Clone)]
pub struct DownloadSession {
    started: Instant,
    expected_bytes: Option<u64>,
    history: VecDeque<(Instant, u64)>,
    history_len: usize,
    last_total: u64,
}

impl DownloadSession {
    pub fn new(expected_bytes: Option<u64>, history_len: usize) -> Self {
        Self::starting_at(expected_bytes, history_len, Instant::now())
    }

    pub fn starting_at(expected_bytes: Option<u64>, history_len: usize, started: Instant) -> Self {
        Self {
            started,
            expected_bytes: expected_bytes.filter(|b| *b > 0),
            history: VecDeque::with_capacity(history_len.max(2)),
            history_len: history_len.max(2),
            last_total: 0,
        }
    }

    /// Record bytes on disk at `at`
    ///
    /// Totals are clamped so they never decrease within a session.
    pub fn record(&mut self, at: Instant, total: u64) -> ProgressSnapshot {
        let downloaded = total.max(self.last_total);
        self.last_total = downloaded;

        let throughput_bps = self.history.back().and_then(|(prev_at, prev_bytes)| {
            let dt = at.saturating_duration_since(*prev_at).as_secs_f64();
            (dt > 0.0).then(|| (downloaded - prev_bytes) as f64 / dt)
        });

        self.history.push_back((at, downloaded));
        while self.history.len() > self.history_len {
            self.history.pop_front();
        }

        let eta = match (self.expected_bytes, throughput_bps) {
            (Some(expected), Some(bps)) if bps > 0.0 => {
                let remaining = expected.saturating_sub(downloaded);
                Some(Duration::from_secs_f64(remaining as f64 / bps))
            }
            _ => None,
        };

        ProgressSnapshot {
            downloaded_bytes: downloaded,
            expected_bytes: self.expected_bytes,
            throughput_bps,
            eta,
            partial_files: 0,
            elapsed: at.saturating_duration_since(self.started),
        }
    }

    /// Record a scanned inventory
    pub fn record_inventory(&mut self, at: Instant, inventory: &LocalInventory) -> ProgressSnapshot {
        let mut snapshot = self.record(at, inventory.total_bytes);
        snapshot.partial_files = inventory.partial.len();
        snapshot
    }
}

/// `42s`, `3m 5s`, `2h 14m`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
