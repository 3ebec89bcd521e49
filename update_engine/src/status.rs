use crate::action::ActionCode;
use log::info;
use serde::{Deserialize, Serialize};

/// Externally observable lifecycle of the attempter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStatus {
    Idle,
    CheckingForUpdate,
    UpdateAvailable,
    Downloading,
    Verifying,
    Finalizing,
    UpdatedNeedReboot,
    ReportingError,
}

serde_plain::derive_display_from_serialize!(UpdateStatus);
serde_plain::derive_fromstr_from_deserialize!(UpdateStatus);

/// One status broadcast: the state plus the attempt's progress and last
/// error, enough for a bus service to answer callers without touching the
/// attempter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub status: UpdateStatus,
    pub display_version: String,
    pub bytes_written: u64,
    pub payload_size: u64,
    pub last_error: Option<ActionCode>,
}

impl StatusSnapshot {
    pub fn idle() -> Self {
        Self {
            status: UpdateStatus::Idle,
            display_version: String::new(),
            bytes_written: 0,
            payload_size: 0,
            last_error: None,
        }
    }
}

/// Receives every state transition the attempter makes. The daemon installs
/// a log-backed observer; the system-bus service would install another.
pub trait StatusObserver {
    fn on_status(&self, snapshot: &StatusSnapshot);
}

pub struct LogObserver;

impl StatusObserver for LogObserver {
    fn on_status(&self, snapshot: &StatusSnapshot) {
        match snapshot.status {
            UpdateStatus::Downloading if snapshot.payload_size > 0 => info!(
                "Status: {} ({}/{} bytes)",
                snapshot.status, snapshot.bytes_written, snapshot.payload_size
            ),
            _ => info!("Status: {}", snapshot.status),
        }
    }
}
