//! Events the backup engine reports while a session runs
//!
//! The engine never blocks on its listeners: events flow through an
//! unbounded channel the caller may or may not supply.

use std::path::PathBuf;

use tokio::sync::mpsc;

/// One file announced by the device during a transfer batch
#[derive(Debug, Clone)]
pub struct BackupFile {
    /// Path of the source file on the device
    pub device_path: String,
    /// Path relative to the device's directory in the backup
    pub backup_path: String,
    /// Where the file lands on the host
    pub local_path: PathBuf,
}

/// Progress and lifecycle notifications for one backup session
#[derive(Debug, Clone)]
pub enum BackupEvent {
    Started,
    /// Human-readable state, e.g. snapshot phase changes
    Status(String),
    /// Overall progress, scaled 0-100 as the device reports it
    Progress(f64),
    BeforeReceivingFile(BackupFile),
    /// A chunk of at most 32 KiB was appended to the file
    FileReceiving { file: BackupFile, chunk: usize },
    FileReceived(BackupFile),
    /// A single file failed; the session continues
    FileTransferError {
        file: BackupFile,
        code: u8,
        message: String,
    },
    /// The device has a passcode set; it may need unlocking during backup
    PasscodeRequiredForBackup,
    Error(String),
    Completed {
        failed_files: Vec<BackupFile>,
        user_cancelled: bool,
        device_disconnected: bool,
    },
}

/// Fire-and-forget wrapper around the caller's event channel
#[derive(Debug, Clone, Default)]
pub(crate) struct EventSink {
    tx: Option<mpsc::UnboundedSender<BackupEvent>>,
}

impl EventSink {
    pub(crate) fn new(tx: Option<mpsc::UnboundedSender<BackupEvent>>) -> Self {
        Self { tx }
    }

    pub(crate) fn emit(&self, event: BackupEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
