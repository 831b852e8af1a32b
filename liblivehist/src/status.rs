use std::path::PathBuf;
use std::sync::mpsc::Sender;

use super::attach::AttachmentState;

/// Progress messages from the acquisition thread
#[derive(Debug, Clone, PartialEq)]
pub enum AttachStatus {
    Attached {
        state: AttachmentState,
        source: String,
    },
    /// Sent every `status_interval` buffers
    BufferCount { buffers: u64 },
    Truncated { expected: usize, received: usize },
    BadEvent { buffers: u64 },
    ListEntrySkipped { path: PathBuf, reason: String },
    /// The end of an offline source was reached
    RunComplete { buffers: u64, bytes: u64 },
    /// The source failed or went away
    Aborted { reason: String },
    Detached,
}

/// Sends status messages if anyone asked for them. A receiver that hung up is not an error;
/// acquisition carries on without reporting.
#[derive(Debug, Clone, Default)]
pub struct StatusReporter {
    tx: Option<Sender<AttachStatus>>,
}

impl StatusReporter {
    pub fn new(tx: Option<Sender<AttachStatus>>) -> Self {
        Self { tx }
    }

    pub fn send(&self, status: AttachStatus) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reporter_ignores_hangup() {
        let (tx, rx) = std::sync::mpsc::channel();
        let reporter = StatusReporter::new(Some(tx));
        reporter.send(AttachStatus::BufferCount { buffers: 10 });
        assert_eq!(rx.recv().unwrap(), AttachStatus::BufferCount { buffers: 10 });
        drop(rx);
        reporter.send(AttachStatus::Detached);
        StatusReporter::default().send(AttachStatus::Detached);
    }
}
