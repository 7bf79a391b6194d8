//! Normalization of engine progress reports.
//!
//! The engine reports raw byte counters; this module turns them into the
//! task-level progress record shown to polling clients. While a transfer is
//! in flight the percentage is capped at 99; 100 is reserved for the
//! finished/processing transition, so a client never sees "complete" before
//! the output file has actually been confirmed on disk.

use super::task::MediaKind;

/// Ceiling for in-flight progress.
const DOWNLOADING_CAP: f64 = 99.0;

/// A normalized progress record, ready to apply to a task.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Percentage in [0, 99]
    pub percent: f64,
    /// Instantaneous transfer rate, display only
    pub speed: Option<String>,
    /// Estimated time remaining, display only
    pub eta: Option<String>,
    /// Human-readable status line
    pub message: String,
}

impl ProgressUpdate {
    /// Build an update from a raw downloading report. A missing or zero
    /// total size means the percentage is not computable; the update then
    /// carries 0 rather than erroring.
    pub fn downloading(
        kind: MediaKind,
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
        speed: Option<String>,
        eta: Option<String>,
    ) -> Self {
        let percent = match total_bytes {
            Some(total) if total > 0 => {
                ((downloaded_bytes as f64 / total as f64) * 100.0).min(DOWNLOADING_CAP)
            }
            _ => 0.0,
        };
        let message = format!("Downloading {}... {:.0}%", kind.label(), percent);
        Self {
            percent,
            speed,
            eta,
            message,
        }
    }
}
