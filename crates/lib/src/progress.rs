//! The installation progress record and the cooperative abort flag.
//!
//! The record lives behind its own mutex so a client can poll it while a
//! long write holds the main service lock. The session only ever sees
//! this narrow handle, never the service itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum ProgressStatus {
    #[default]
    NoOperation,
    Working,
    Complete,
}

impl ProgressStatus {
    /// The wire encoding shared with clients.
    pub fn code(self) -> i32 {
        match self {
            ProgressStatus::NoOperation => 0,
            ProgressStatus::Working => 1,
            ProgressStatus::Complete => 2,
        }
    }
}

impl From<ProgressStatus> for i32 {
    fn from(status: ProgressStatus) -> Self {
        status.code()
    }
}

impl TryFrom<i32> for ProgressStatus {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(ProgressStatus::NoOperation),
            1 => Ok(ProgressStatus::Working),
            2 => Ok(ProgressStatus::Complete),
            other => Err(format!("invalid progress status {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub step: String,
    pub status: ProgressStatus,
    pub bytes_processed: u64,
    pub total_bytes: u64,
}

/// Shared between the service and the active install session.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    progress: Mutex<Progress>,
    abort: AtomicBool,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a new asynchronous operation; resets the byte counters.
    pub fn start_operation(&self, step: &str, total_bytes: u64) {
        let mut progress = self.progress.lock().unwrap();
        *progress = Progress {
            step: step.to_string(),
            status: ProgressStatus::Working,
            bytes_processed: 0,
            total_bytes,
        };
    }

    pub fn update(&self, status: ProgressStatus, bytes_processed: u64) {
        let mut progress = self.progress.lock().unwrap();
        progress.status = status;
        progress.bytes_processed = if status == ProgressStatus::Complete {
            progress.total_bytes
        } else {
            bytes_processed
        };
    }

    /// An atomic copy of the record; never observes a torn update.
    pub fn snapshot(&self) -> Progress {
        self.progress.lock().unwrap().clone()
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn clear_abort(&self) {
        self.abort.store(false, Ordering::SeqCst);
    }

    pub fn should_abort(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_lifecycle() {
        let tracker = ProgressTracker::new();
        assert_eq!(tracker.snapshot(), Progress::default());

        tracker.start_operation("write gsi", 1000);
        let p = tracker.snapshot();
        assert_eq!(p.step, "write gsi");
        assert_eq!(p.status, ProgressStatus::Working);
        assert_eq!(p.total_bytes, 1000);

        tracker.update(ProgressStatus::Working, 512);
        assert_eq!(tracker.snapshot().bytes_processed, 512);

        // Completion snaps the counter to the total.
        tracker.update(ProgressStatus::Complete, 512);
        let p = tracker.snapshot();
        assert_eq!(p.bytes_processed, 1000);
        assert_eq!(p.status, ProgressStatus::Complete);
    }

    #[test]
    fn test_abort_flag() {
        let tracker = ProgressTracker::new();
        assert!(!tracker.should_abort());
        tracker.request_abort();
        assert!(tracker.should_abort());
        tracker.clear_abort();
        assert!(!tracker.should_abort());
    }

    #[test]
    fn test_status_wire_encoding() {
        // Clients see the status as its numeric code.
        let progress = Progress {
            step: "write gsi".into(),
            status: ProgressStatus::Working,
            bytes_processed: 512,
            total_bytes: 1000,
        };
        let line = serde_json::to_string(&progress).unwrap();
        assert_eq!(
            line,
            r#"{"step":"write gsi","status":1,"bytes_processed":512,"total_bytes":1000}"#
        );
        let back: Progress = serde_json::from_str(&line).unwrap();
        assert_eq!(back, progress);

        assert_eq!(ProgressStatus::NoOperation.code(), 0);
        assert_eq!(ProgressStatus::Complete.code(), 2);
        assert!(serde_json::from_str::<ProgressStatus>("7").is_err());
    }
}
