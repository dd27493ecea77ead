//! Backup engine
//!
//! Drives the mobilebackup2 conversation after DeviceLink is ready: acquires
//! the on-device sync lock over AFC, assembles Info.plist, sends the Backup
//! request and serves the device's messages until it disconnects or reports
//! a result. Files stream into `backupRoot/<UDID>/` with the content-addressed
//! layout the device dictates.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use plist::{Dictionary, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};

use crate::afc::errors::AfcError;
use crate::afc::opcode::{AfcFopenMode, AfcLockType};
use crate::afc::AfcClient;
use crate::devicelink::DeviceLinkClient;
use crate::installation_proxy::InstallationProxyClient;
use crate::lockdown::LockdownClient;
use crate::notification_proxy::NotificationProxyClient;
use crate::provider::DeviceProvider;
use crate::springboardservices::SpringBoardServicesClient;
use crate::{DeviceConnection, DeviceService, MobiledeviceError};

mod event;
mod info_plist;
mod status;

pub use event::{BackupEvent, BackupFile};
pub use status::{BackupStatus, SnapshotState};

use event::EventSink;
use info_plist::InfoPlistInputs;

/// Result codes in the file streaming sublanguage
pub const CODE_SUCCESS: u8 = 0x00;
pub const CODE_FILE_NOT_FOUND: u8 = 0x06;
pub const CODE_REMOTE_ERROR: u8 = 0x0b;
pub const CODE_FILE_DATA: u8 = 0x0c;

const LOCK_SYNC_PATH: &str = "/com.apple.itunes.lock_sync";
const LOCK_ATTEMPTS: u32 = 50;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(200);

const SYNC_WILL_START: &str = "com.apple.itunes-client.syncWillStart";
const SYNC_LOCK_REQUEST: &str = "com.apple.itunes-mobdev.syncLockRequest";
const SYNC_DID_START: &str = "com.apple.itunes-client.syncDidStart";
const SYNC_DID_FINISH: &str = "com.apple.itunes-mobdev.syncDidFinish";

/// Streaming buffer size for file reception
const FILE_CHUNK: usize = 32 * 1024;
const NOT_READY_DELAY: Duration = Duration::from_millis(100);

/// Options for one backup run
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Directory that holds one subdirectory per device UDID
    pub backup_root: PathBuf,
    pub force_full_backup: bool,
    /// Service socket read timeout; a lapse is treated as "device not ready"
    pub read_timeout: Duration,
}

impl BackupOptions {
    pub fn new(backup_root: impl Into<PathBuf>) -> Self {
        Self {
            backup_root: backup_root.into(),
            force_full_backup: true,
            read_timeout: Duration::from_secs(180),
        }
    }
}

/// How a backup session ended
#[derive(Debug)]
pub struct BackupOutcome {
    pub failed_files: Vec<BackupFile>,
    pub user_cancelled: bool,
    pub device_disconnected: bool,
}

/// Client for the mobilebackup2 service
#[derive(Debug)]
pub struct BackupClient {
    dl: DeviceLinkClient,
    /// Protocol version negotiated with the device
    pub protocol_version: f64,
}

impl DeviceService for BackupClient {
    fn service_name() -> std::borrow::Cow<'static, str> {
        std::borrow::Cow::Borrowed("com.apple.mobilebackup2")
    }

    fn escrowed() -> bool {
        true
    }

    async fn from_stream(connection: DeviceConnection) -> Result<Self, MobiledeviceError> {
        let dl = DeviceLinkClient::new(connection).await?;
        let mut client = Self {
            dl,
            protocol_version: 0.0,
        };
        client.version_exchange().await?;
        Ok(client)
    }
}

/// Per-session bookkeeping shared by the message handlers
struct SessionState {
    sink: EventSink,
    stop: watch::Receiver<bool>,
    udid: String,
    /// `backup_root/<UDID>`, the containment root for every device path
    device_dir: PathBuf,
    failed_files: Vec<BackupFile>,
    snapshot: SnapshotState,
    finished: bool,
    user_cancelled: bool,
}

impl SessionState {
    /// Joins a device-supplied path under the device directory
    ///
    /// Absolute paths and `..` segments escape the backup and are rejected.
    fn resolve(&self, relative: &str) -> Option<PathBuf> {
        let mut clean = PathBuf::new();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(c) => clean.push(c),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(self.device_dir.join(clean))
    }
}

/// Services held open for the duration of a session
///
/// Released on every exit path; release is idempotent.
#[derive(Default)]
struct SessionResources {
    notifications: Option<NotificationProxyClient>,
    afc: Option<AfcClient>,
    lock_fd: Option<u64>,
}

impl SessionResources {
    async fn release(&mut self) {
        if let Some(afc) = self.afc.as_mut() {
            if let Some(fd) = self.lock_fd.take() {
                let _ = afc.lock(fd, AfcLockType::Unlock).await;
                let _ = afc.close(fd).await;
            }
        }
        self.afc = None;
        if let Some(mut np) = self.notifications.take() {
            let _ = np.post_notification(SYNC_DID_FINISH).await;
        }
    }
}

enum FileOutcome {
    Received,
    Failed { code: u8, message: String },
    EndOfBatch,
    Cancelled,
}

impl BackupClient {
    /// The version pair DeviceLink negotiated
    pub fn device_link_version(&self) -> (u64, u64) {
        self.dl.version()
    }

    /// Exchanges supported protocol versions with the device
    async fn version_exchange(&mut self) -> Result<(), MobiledeviceError> {
        debug!("Starting mobilebackup2 version exchange");
        let mut hello = Dictionary::new();
        hello.insert("MessageName".into(), "Hello".into());
        hello.insert(
            "SupportedProtocolVersions".into(),
            Value::Array(vec![Value::Real(2.0), Value::Real(2.1)]),
        );
        self.dl.send_process_message(hello).await?;

        let (tag, items) = self.dl.receive_message().await?;
        if tag != "DLMessageProcessMessage" {
            return Err(MobiledeviceError::ProtocolViolation(format!(
                "version exchange answered with {tag}"
            )));
        }
        let Some(Value::Dictionary(response)) = items.first() else {
            return Err(MobiledeviceError::UnexpectedResponse);
        };
        if let Some(code) = response.get("ErrorCode").and_then(|c| c.as_unsigned_integer()) {
            if code != 0 {
                warn!("Version exchange failed with error code {code}");
                return Err(MobiledeviceError::UnexpectedResponse);
            }
        }
        match response.get("ProtocolVersion").and_then(|v| v.as_real()) {
            Some(version) => {
                debug!("Negotiated protocol version {version}");
                self.protocol_version = version;
                Ok(())
            }
            None => Err(MobiledeviceError::UnexpectedResponse),
        }
    }

    /// Runs one full backup session
    ///
    /// Acquires the sync lock, writes Info.plist, sends the Backup request
    /// and serves device messages until termination. Cleanup (lock release,
    /// service teardown, the final `Completed` event) runs on every exit
    /// path. Exactly one session may run per client at a time.
    ///
    /// # Arguments
    /// * `provider` - Source of the ancillary service connections
    /// * `options` - Backup root and tuning
    /// * `events` - Optional sink for progress events
    /// * `stop` - Cancellation token; flipping it to `true` stops the session
    pub async fn perform_backup(
        &mut self,
        provider: &dyn DeviceProvider,
        options: &BackupOptions,
        events: Option<mpsc::UnboundedSender<BackupEvent>>,
        stop: watch::Receiver<bool>,
    ) -> Result<BackupOutcome, MobiledeviceError> {
        let udid = provider.udid().to_string();
        let mut state = SessionState {
            sink: EventSink::new(events),
            stop,
            device_dir: options.backup_root.join(&udid),
            udid,
            failed_files: Vec::new(),
            snapshot: SnapshotState::Uninitialized,
            finished: false,
            user_cancelled: false,
        };
        let mut resources = SessionResources::default();

        state.sink.emit(BackupEvent::Started);
        let result = self
            .run_session(provider, options, &mut state, &mut resources)
            .await;
        resources.release().await;

        let mut device_disconnected = false;
        let result = match result {
            Err(MobiledeviceError::Socket(e)) => {
                match provider.is_device_connected().await {
                    Ok(false) => {
                        device_disconnected = true;
                        Ok(())
                    }
                    _ => Err(MobiledeviceError::Socket(e)),
                }
            }
            other => other,
        };

        match result {
            Ok(()) => {
                let outcome = BackupOutcome {
                    failed_files: state.failed_files.clone(),
                    user_cancelled: state.user_cancelled,
                    device_disconnected,
                };
                state.sink.emit(BackupEvent::Completed {
                    failed_files: state.failed_files,
                    user_cancelled: outcome.user_cancelled,
                    device_disconnected,
                });
                Ok(outcome)
            }
            Err(e) => {
                state.sink.emit(BackupEvent::Error(e.to_string()));
                state.sink.emit(BackupEvent::Completed {
                    failed_files: state.failed_files,
                    user_cancelled: state.user_cancelled,
                    device_disconnected,
                });
                Err(e)
            }
        }
    }

    async fn run_session(
        &mut self,
        provider: &dyn DeviceProvider,
        options: &BackupOptions,
        state: &mut SessionState,
        resources: &mut SessionResources,
    ) -> Result<(), MobiledeviceError> {
        tokio::fs::create_dir_all(&state.device_dir).await?;

        let pairing_file = provider.get_pairing_file().await?;
        let mut lockdown = LockdownClient::connect(provider).await?;
        lockdown.start_session(&pairing_file).await?;

        let version = lockdown.product_version().await?;
        if passcode_gate_applies(version) {
            match lockdown
                .get_value(Some("PasswordConfigured"), Some("com.apple.mobile.MobileGestalt"))
                .await
            {
                Ok(v) if v.as_boolean() == Some(true) => {
                    state.sink.emit(BackupEvent::PasscodeRequiredForBackup);
                }
                // The query is gone on some versions; assume a passcode
                Err(MobiledeviceError::Deprecated) => {
                    state.sink.emit(BackupEvent::PasscodeRequiredForBackup);
                }
                _ => {}
            }
        }
        let device_values = lockdown.get_all_values().await.unwrap_or_default();

        // Sync lock acquisition
        let mut np = NotificationProxyClient::connect(provider).await?;
        np.post_notification(SYNC_WILL_START).await?;
        resources.notifications = Some(np);

        let mut afc = AfcClient::connect(provider).await?;
        let lock_fd = afc.open(LOCK_SYNC_PATH, AfcFopenMode::Rw).await?;
        resources.afc = Some(afc);
        if let Some(np) = resources.notifications.as_mut() {
            np.post_notification(SYNC_LOCK_REQUEST).await?;
        }
        if let Some(afc) = resources.afc.as_mut() {
            match acquire_sync_lock(afc, lock_fd).await {
                Ok(()) => resources.lock_fd = Some(lock_fd),
                Err(e) => {
                    let _ = afc.close(lock_fd).await;
                    return Err(e);
                }
            }
        }
        if let Some(np) = resources.notifications.as_mut() {
            np.post_notification(SYNC_DID_START).await?;
        }
        state.sink.emit(BackupEvent::Status("sync lock acquired".into()));

        // Info.plist
        let inputs = gather_info_inputs(
            provider,
            &mut lockdown,
            resources.afc.as_mut(),
            device_values,
            &state.udid,
        )
        .await;
        let info = info_plist::build_info_plist(&inputs);
        let mut xml = Vec::new();
        plist::to_writer_xml(&mut xml, &info)?;
        tokio::fs::write(state.device_dir.join("Info.plist"), xml).await?;
        lockdown.goodbye().await;

        // Backup request
        let mut message = Dictionary::new();
        message.insert("MessageName".into(), "Backup".into());
        message.insert("TargetIdentifier".into(), state.udid.clone().into());
        message.insert("SourceIdentifier".into(), state.udid.clone().into());
        let mut backup_options = Dictionary::new();
        backup_options.insert("ForceFullBackup".into(), options.force_full_backup.into());
        message.insert("Options".into(), Value::Dictionary(backup_options));
        self.dl.send_process_message(message).await?;

        self.message_loop(options, state).await?;
        debug!(
            "Session over (finished: {}, cancelled: {})",
            state.finished, state.user_cancelled
        );
        Ok(())
    }

    /// Serves device messages until disconnect, result, cancel or error
    async fn message_loop(
        &mut self,
        options: &BackupOptions,
        state: &mut SessionState,
    ) -> Result<(), MobiledeviceError> {
        loop {
            if *state.stop.borrow() {
                state.user_cancelled = true;
                self.dl.disconnect().await;
                break;
            }

            let received = if state.stop.has_changed().is_err() {
                // The stop sender is gone; cancellation can no longer arrive
                Some(tokio::time::timeout(options.read_timeout, self.dl.receive_message()).await)
            } else {
                let mut stop = state.stop.clone();
                tokio::select! {
                    r = tokio::time::timeout(options.read_timeout, self.dl.receive_message()) => Some(r),
                    _ = stop.changed() => None,
                }
            };
            let Some(received) = received else {
                continue; // cancellation flag flipped; re-check at the top
            };
            let (tag, items) = match received {
                Err(_) => {
                    // Read timeout: the device is not ready yet
                    state.snapshot.reenter_waiting();
                    state
                        .sink
                        .emit(BackupEvent::Status("device not ready".into()));
                    tokio::time::sleep(NOT_READY_DELAY).await;
                    continue;
                }
                Ok(Ok(message)) => message,
                Ok(Err(e)) => return Err(e),
            };

            debug!("Handling {tag}");
            match tag.as_str() {
                "DLMessageDownloadFiles" => {
                    self.handle_download_files(&items, state).await?;
                }
                "DLMessageUploadFiles" => {
                    // Device-driven restore; acknowledged, not served
                    self.dl
                        .send_status_response(0, None, Some(empty_dict()))
                        .await?;
                }
                "DLMessageGetFreeDiskSpace" => {
                    self.handle_free_disk_space(state).await?;
                }
                "DLMessageContentsOfDirectory" | "DLContentsOfDirectory" => {
                    self.handle_contents_of_directory(&items, state).await?;
                }
                "DLMessageCreateDirectory" => {
                    self.handle_create_directory(&items, state).await?;
                }
                "DLMessageMoveFiles" | "DLMessageMoveItems" => {
                    self.handle_move_items(&items, state).await?;
                }
                "DLMessageRemoveFiles" | "DLMessageRemoveItems" => {
                    self.handle_remove_items(&items, state).await?;
                }
                "DLMessageCopyItem" => {
                    self.handle_copy_item(&items, state).await?;
                }
                "DLMessageProcessMessage" => {
                    if self.handle_process_message(&items, state)? {
                        break;
                    }
                }
                "DLMessageDisconnect" => break,
                other => {
                    warn!("Unsupported DeviceLink message: {other}");
                    self.dl
                        .send_status_response(-1, Some("Operation not supported"), None)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Inner application result; `true` ends the session
    fn handle_process_message(
        &mut self,
        items: &[Value],
        state: &mut SessionState,
    ) -> Result<bool, MobiledeviceError> {
        let Some(Value::Dictionary(message)) = items.first() else {
            return Err(MobiledeviceError::ProtocolViolation(
                "process message without a payload".into(),
            ));
        };
        let code = message
            .get("ErrorCode")
            .and_then(|c| c.as_signed_integer())
            .unwrap_or(0);
        match code {
            0 => {
                state.finished = true;
                Ok(true)
            }
            -208 => Err(MobiledeviceError::DeviceLocked),
            -38 | -207 => Err(MobiledeviceError::PolicyDenied),
            other => {
                let description = message
                    .get("ErrorDescription")
                    .and_then(|d| d.as_string())
                    .unwrap_or("no description");
                Err(MobiledeviceError::UnknownErrorType(format!(
                    "backup ended with result {other}: {description}"
                )))
            }
        }
    }

    async fn handle_download_files(
        &mut self,
        items: &[Value],
        state: &mut SessionState,
    ) -> Result<(), MobiledeviceError> {
        if let Some(progress) = items.get(2).and_then(|v| v.as_real()) {
            state.sink.emit(BackupEvent::Progress(progress));
        }

        let mut failures = Dictionary::new();
        loop {
            let device_path_len = self.read_i32().await?;
            if device_path_len <= 0 {
                break;
            }
            let device_path = self.read_string(device_path_len as usize).await?;
            let backup_path_len = self.read_i32().await?;
            if backup_path_len <= 0 {
                // Announcement without a backup path; skip the entry
                warn!("File announcement for {device_path} has no backup path");
                continue;
            }
            let backup_path = self.read_string(backup_path_len as usize).await?;

            let Some(local_path) = state.resolve(&backup_path) else {
                let file = BackupFile {
                    device_path,
                    backup_path: backup_path.clone(),
                    local_path: PathBuf::new(),
                };
                let message = "backup path escapes the backup directory".to_string();
                warn!("{message}: {backup_path}");
                state.sink.emit(BackupEvent::FileTransferError {
                    file: file.clone(),
                    code: CODE_FILE_NOT_FOUND,
                    message: message.clone(),
                });
                state.failed_files.push(file);
                failures.insert(backup_path, failure_entry(CODE_FILE_NOT_FOUND, &message));
                match self.drain_file().await? {
                    FileOutcome::EndOfBatch => break,
                    _ => continue,
                }
            };

            let file = BackupFile {
                device_path,
                backup_path,
                local_path,
            };
            match self.receive_file(&file, state).await? {
                FileOutcome::Received => {
                    self.note_status_plist(&file, state).await;
                }
                FileOutcome::Failed { code, message } => {
                    state.sink.emit(BackupEvent::FileTransferError {
                        file: file.clone(),
                        code,
                        message: message.clone(),
                    });
                    failures.insert(file.backup_path.clone(), failure_entry(code, &message));
                    let _ = tokio::fs::remove_file(&file.local_path).await;
                    state.failed_files.push(file);
                }
                FileOutcome::EndOfBatch => break,
                FileOutcome::Cancelled => {
                    state.user_cancelled = true;
                    break;
                }
            }
        }

        if failures.is_empty() {
            self.dl
                .send_status_response(0, None, Some(empty_dict()))
                .await
        } else {
            self.dl
                .send_status_response(
                    -13,
                    Some("Multi status"),
                    Some(Value::Dictionary(failures)),
                )
                .await
        }
    }

    /// Streams one announced file to disk
    async fn receive_file(
        &mut self,
        file: &BackupFile,
        state: &mut SessionState,
    ) -> Result<FileOutcome, MobiledeviceError> {
        state
            .sink
            .emit(BackupEvent::BeforeReceivingFile(file.clone()));
        if let Some(parent) = file.local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut out = tokio::fs::File::create(&file.local_path).await?;

        loop {
            let size = self.read_i32().await?;
            if size == 0 {
                // End of file without an explicit success trailer
                out.flush().await?;
                state.sink.emit(BackupEvent::FileReceived(file.clone()));
                return Ok(FileOutcome::Received);
            }
            if size < 0 {
                return Ok(FileOutcome::EndOfBatch);
            }
            let code = self.read_u8().await?;
            let mut remaining = (size - 1) as usize;
            match code {
                CODE_FILE_DATA => {
                    while remaining > 0 {
                        let take = remaining.min(FILE_CHUNK);
                        let buf = self.dl.connection.read_raw(take).await?;
                        out.write_all(&buf).await?;
                        remaining -= take;
                        state.sink.emit(BackupEvent::FileReceiving {
                            file: file.clone(),
                            chunk: take,
                        });
                        // Cancellation lands between chunks, never inside one
                        if *state.stop.borrow() {
                            out.flush().await?;
                            return Ok(FileOutcome::Cancelled);
                        }
                    }
                }
                CODE_SUCCESS => {
                    if remaining > 0 {
                        let _ = self.dl.connection.read_raw(remaining).await?;
                    }
                    out.flush().await?;
                    state.sink.emit(BackupEvent::FileReceived(file.clone()));
                    return Ok(FileOutcome::Received);
                }
                code => {
                    let message = String::from_utf8_lossy(
                        &self.dl.connection.read_raw(remaining).await?,
                    )
                    .to_string();
                    return Ok(FileOutcome::Failed { code, message });
                }
            }
        }
    }

    /// Consumes a file's chunk stream without writing anything
    async fn drain_file(&mut self) -> Result<FileOutcome, MobiledeviceError> {
        loop {
            let size = self.read_i32().await?;
            if size == 0 {
                return Ok(FileOutcome::Received);
            }
            if size < 0 {
                return Ok(FileOutcome::EndOfBatch);
            }
            let code = self.read_u8().await?;
            let mut remaining = (size - 1) as usize;
            while remaining > 0 {
                let take = remaining.min(FILE_CHUNK);
                let _ = self.dl.connection.read_raw(take).await?;
                remaining -= take;
            }
            if code != CODE_FILE_DATA {
                return Ok(FileOutcome::Received);
            }
        }
    }

    /// Decodes Status.plist revisions as they land on disk
    async fn note_status_plist(&self, file: &BackupFile, state: &mut SessionState) {
        if !file.backup_path.ends_with("Status.plist") {
            return;
        }
        if let Ok(bytes) = tokio::fs::read(&file.local_path).await {
            if let Some(status) = BackupStatus::from_bytes(&bytes) {
                state.snapshot.advance(status.snapshot_state);
                state.sink.emit(BackupEvent::Status(format!(
                    "snapshot {}",
                    state.snapshot.as_str()
                )));
            }
        }
    }

    async fn handle_free_disk_space(
        &mut self,
        state: &mut SessionState,
    ) -> Result<(), MobiledeviceError> {
        match free_disk_space(&state.device_dir) {
            Some(free) => {
                self.dl
                    .send_status_response(0, None, Some(Value::Integer(free.into())))
                    .await
            }
            None => {
                self.dl
                    .send_status_response(-1, None, Some(Value::Integer(0u64.into())))
                    .await
            }
        }
    }

    async fn handle_contents_of_directory(
        &mut self,
        items: &[Value],
        state: &mut SessionState,
    ) -> Result<(), MobiledeviceError> {
        let dir = items
            .first()
            .and_then(|v| v.as_string())
            .and_then(|p| state.resolve(p));
        let Some(dir) = dir else {
            return self
                .dl
                .send_status_response(-1, Some("Invalid path"), None)
                .await;
        };

        let mut listing = Dictionary::new();
        if let Ok(mut entries) = tokio::fs::read_dir(&dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let Ok(metadata) = entry.metadata().await else {
                    continue;
                };
                let mut info = Dictionary::new();
                info.insert(
                    "DLFileType".into(),
                    if metadata.is_dir() {
                        "DLFileTypeDirectory".into()
                    } else {
                        "DLFileTypeRegular".into()
                    },
                );
                info.insert("DLFileSize".into(), metadata.len().into());
                listing.insert(
                    entry.file_name().to_string_lossy().into_owned(),
                    Value::Dictionary(info),
                );
            }
        }
        self.dl
            .send_status_response(0, None, Some(Value::Dictionary(listing)))
            .await
    }

    async fn handle_create_directory(
        &mut self,
        items: &[Value],
        state: &mut SessionState,
    ) -> Result<(), MobiledeviceError> {
        let dir = items
            .first()
            .and_then(|v| v.as_string())
            .and_then(|p| state.resolve(p));
        let status = match dir {
            Some(path) => match tokio::fs::create_dir_all(&path).await {
                Ok(()) => 0,
                Err(e) => e.raw_os_error().unwrap_or(-1) as i64,
            },
            None => -1,
        };
        self.dl.send_status_response(status, None, None).await
    }

    async fn handle_move_items(
        &mut self,
        items: &[Value],
        state: &mut SessionState,
    ) -> Result<(), MobiledeviceError> {
        if let Some(progress) = items.get(2).and_then(|v| v.as_real()) {
            state.sink.emit(BackupEvent::Progress(progress));
        }

        let mut status = 0;
        if let Some(Value::Dictionary(moves)) = items.first() {
            for (source, target) in moves {
                let target = target.as_string();
                let (Some(from), Some(to)) = (
                    state.resolve(source),
                    target.and_then(|t| state.resolve(t)),
                ) else {
                    status = -1;
                    continue;
                };
                if let Some(parent) = to.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                if let Err(e) = tokio::fs::rename(&from, &to).await {
                    warn!("Move {from:?} -> {to:?} failed: {e}");
                    status = -1;
                }
            }
        } else {
            status = -1;
        }
        self.dl
            .send_status_response(status, None, Some(empty_dict()))
            .await
    }

    async fn handle_remove_items(
        &mut self,
        items: &[Value],
        state: &mut SessionState,
    ) -> Result<(), MobiledeviceError> {
        if let Some(progress) = items.get(2).and_then(|v| v.as_real()) {
            state.sink.emit(BackupEvent::Progress(progress));
        }

        let mut status = 0;
        if let Some(Value::Array(paths)) = items.first() {
            for path in paths {
                let Some(path) = path.as_string().and_then(|p| state.resolve(p)) else {
                    status = -1;
                    continue;
                };
                let removed = if path.is_dir() {
                    tokio::fs::remove_dir_all(&path).await
                } else if path.exists() {
                    tokio::fs::remove_file(&path).await
                } else {
                    Ok(())
                };
                if let Err(e) = removed {
                    warn!("Remove {path:?} failed: {e}");
                    status = -1;
                }
            }
        } else {
            status = -1;
        }
        self.dl
            .send_status_response(status, None, Some(empty_dict()))
            .await
    }

    async fn handle_copy_item(
        &mut self,
        items: &[Value],
        state: &mut SessionState,
    ) -> Result<(), MobiledeviceError> {
        let source = items
            .first()
            .and_then(|v| v.as_string())
            .and_then(|p| state.resolve(p));
        let target = items
            .get(1)
            .and_then(|v| v.as_string())
            .and_then(|p| state.resolve(p));

        let mut status = 0;
        match (source, target) {
            (Some(from), Some(to)) => {
                if let Some(parent) = to.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                if from.is_dir() {
                    debug!("Copy of directory {from:?} skipped");
                } else if let Err(e) = tokio::fs::copy(&from, &to).await {
                    warn!("Copy {from:?} -> {to:?} failed: {e}");
                    status = -1;
                }
            }
            _ => status = -1,
        }
        // The device expects an answer here even though iTunes historically
        // never sent one.
        self.dl
            .send_status_response(status, None, Some(empty_dict()))
            .await
    }

    async fn read_i32(&mut self) -> Result<i32, MobiledeviceError> {
        let buf = self.dl.connection.read_raw(4).await?;
        Ok(i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]))
    }

    async fn read_u8(&mut self) -> Result<u8, MobiledeviceError> {
        let buf = self.dl.connection.read_raw(1).await?;
        Ok(buf[0])
    }

    async fn read_string(&mut self, len: usize) -> Result<String, MobiledeviceError> {
        let buf = self.dl.connection.read_raw(len).await?;
        Ok(String::from_utf8_lossy(&buf).to_string())
    }
}

fn empty_dict() -> Value {
    Value::Dictionary(Dictionary::new())
}

fn failure_entry(code: u8, message: &str) -> Value {
    let mut entry = Dictionary::new();
    entry.insert("DLFileErrorString".into(), message.into());
    entry.insert("DLFileErrorCode".into(), (code as i64).into());
    Value::Dictionary(entry)
}

/// Whether this device version needs the passcode prerequisite check
///
/// Applies to [15.7.1, 16.0) and [16.1, onward).
fn passcode_gate_applies(version: (u32, u32, u32)) -> bool {
    let (major, minor, patch) = version;
    match major {
        0..=14 => false,
        15 => (minor, patch) >= (7, 1),
        16 => minor >= 1,
        _ => true,
    }
}

/// Retries the exclusive lock while the device reports contention
async fn acquire_sync_lock(afc: &mut AfcClient, fd: u64) -> Result<(), MobiledeviceError> {
    for attempt in 1..=LOCK_ATTEMPTS {
        match afc.lock(fd, AfcLockType::Exclusive).await {
            Ok(()) => {
                debug!("Acquired sync lock on attempt {attempt}");
                return Ok(());
            }
            Err(MobiledeviceError::Afc(AfcError::OpWouldBlock)) => {
                tokio::time::sleep(LOCK_RETRY_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(MobiledeviceError::Afc(AfcError::OpWouldBlock))
}

/// Gathers the Info.plist inputs, tolerating every individual failure
async fn gather_info_inputs(
    provider: &dyn DeviceProvider,
    lockdown: &mut LockdownClient,
    afc: Option<&mut AfcClient>,
    device_values: Dictionary,
    udid: &str,
) -> InfoPlistInputs {
    let apps = match InstallationProxyClient::connect(provider).await {
        Ok(mut proxy) => proxy
            .browse_user_apps(&["CFBundleIdentifier", "ApplicationSINF", "iTunesMetadata"])
            .await
            .unwrap_or_default(),
        Err(e) => {
            debug!("Installation proxy unavailable: {e}");
            HashMap::new()
        }
    };

    let mut icons = HashMap::new();
    if !apps.is_empty() {
        if let Ok(mut springboard) = SpringBoardServicesClient::connect(provider).await {
            for bundle_id in apps.keys() {
                if let Ok(png) = springboard.get_icon_pngdata(bundle_id.clone()).await {
                    icons.insert(bundle_id.clone(), png);
                }
            }
        }
    }

    let mut itunes_files = Vec::new();
    let mut ibooks_data = None;
    if let Some(afc) = afc {
        for name in info_plist::ITUNES_FILES {
            let path = format!("{}/{name}", info_plist::ITUNES_FILES_DEVICE_DIR);
            if let Ok(contents) = read_device_file(afc, &path).await {
                itunes_files.push((name.to_string(), contents));
            }
        }
        ibooks_data = read_device_file(afc, info_plist::IBOOKS_DATA_DEVICE_PATH)
            .await
            .ok();
    }

    let itunes_settings = lockdown.get_value(None, Some("com.apple.iTunes")).await.ok();
    let itunes_version = lockdown
        .get_string_value("MinITunesVersion", Some("com.apple.mobile.iTunes"))
        .await
        .ok();

    InfoPlistInputs {
        device_values,
        udid: udid.to_string(),
        apps,
        icons,
        itunes_files,
        ibooks_data,
        itunes_settings,
        itunes_version,
    }
}

async fn read_device_file(
    afc: &mut AfcClient,
    path: &str,
) -> Result<Vec<u8>, MobiledeviceError> {
    let fd = afc.open(path, AfcFopenMode::RdOnly).await?;
    let contents = afc.read_to_end(fd).await;
    let _ = afc.close(fd).await;
    contents
}

/// Available bytes on the volume holding the backup
#[cfg(unix)]
fn free_disk_space(path: &Path) -> Option<u64> {
    use std::os::unix::ffi::OsStrExt;

    let path = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(path.as_ptr(), &mut stat) } == 0 {
        Some(stat.f_bavail as u64 * stat.f_frsize as u64)
    } else {
        None
    }
}

#[cfg(not(unix))]
fn free_disk_space(_path: &Path) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devicelink::{DL_DEVICE_READY, DL_PROCESS_MESSAGE, DL_VERSION_EXCHANGE};

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("mobiledevice-tests")
            .join(format!("{name}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    async fn send_dl(server: &mut DeviceConnection, items: Vec<Value>) {
        server.send_plist(Value::Array(items)).await.unwrap();
    }

    /// Plays the device side of the DeviceLink + mobilebackup2 handshakes
    async fn mock_backup_client(buffer: usize) -> (BackupClient, DeviceConnection) {
        let (client, server) = tokio::io::duplex(buffer);
        let client = DeviceConnection::new(Box::new(client), "test");
        let mut server = DeviceConnection::new(Box::new(server), "mock");

        send_dl(
            &mut server,
            vec![
                Value::String(DL_VERSION_EXCHANGE.into()),
                Value::Integer(400u64.into()),
                Value::Integer(0u64.into()),
            ],
        )
        .await;
        send_dl(&mut server, vec![Value::String(DL_DEVICE_READY.into())]).await;

        let mut response = Dictionary::new();
        response.insert("MessageName".into(), "Response".into());
        response.insert("ErrorCode".into(), 0.into());
        response.insert("ProtocolVersion".into(), Value::Real(2.1));
        send_dl(
            &mut server,
            vec![
                Value::String(DL_PROCESS_MESSAGE.into()),
                Value::Dictionary(response),
            ],
        )
        .await;

        let backup = BackupClient::from_stream(client).await.unwrap();
        assert_eq!(backup.protocol_version, 2.1);
        // Drain what the client sent during the handshakes
        let _ = server.read_plist_value().await.unwrap();
        let _ = server.read_plist_value().await.unwrap();
        (backup, server)
    }

    fn session_state(
        device_dir: PathBuf,
        events: mpsc::UnboundedSender<BackupEvent>,
    ) -> (SessionState, watch::Sender<bool>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        (
            SessionState {
                sink: EventSink::new(Some(events)),
                stop: stop_rx,
                udid: "00008101-000A11111111001E".into(),
                device_dir,
                failed_files: Vec::new(),
                snapshot: SnapshotState::Uninitialized,
                finished: false,
                user_cancelled: false,
            },
            stop_tx,
        )
    }

    async fn announce_file(server: &mut DeviceConnection, device_path: &str, backup_path: &str) {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(device_path.len() as i32).to_be_bytes());
        bytes.extend_from_slice(device_path.as_bytes());
        bytes.extend_from_slice(&(backup_path.len() as i32).to_be_bytes());
        bytes.extend_from_slice(backup_path.as_bytes());
        server.send_raw(&bytes).await.unwrap();
    }

    async fn send_file_data(server: &mut DeviceConnection, data: &[u8]) {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(data.len() as i32 + 1).to_be_bytes());
        bytes.push(CODE_FILE_DATA);
        bytes.extend_from_slice(data);
        server.send_raw(&bytes).await.unwrap();
    }

    async fn send_file_trailer(server: &mut DeviceConnection, code: u8, message: &[u8]) {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(message.len() as i32 + 1).to_be_bytes());
        bytes.push(code);
        bytes.extend_from_slice(message);
        server.send_raw(&bytes).await.unwrap();
    }

    async fn end_batch(server: &mut DeviceConnection) {
        server.send_raw(&0i32.to_be_bytes()).await.unwrap();
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<BackupEvent>) -> Vec<BackupEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn download_files_lands_bytes_on_disk() {
        let root = test_dir("happy");
        let (mut backup, mut server) = mock_backup_client(256 * 1024).await;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (mut state, _stop) = session_state(root.clone(), events_tx);

        let payload = vec![7u8; 1024];
        announce_file(&mut server, "Media/file", "00/abcdef").await;
        send_file_data(&mut server, &payload).await;
        send_file_trailer(&mut server, CODE_SUCCESS, &[]).await;
        end_batch(&mut server).await;

        backup
            .handle_download_files(&[Value::Array(Vec::new())], &mut state)
            .await
            .unwrap();

        let written = std::fs::read(root.join("00/abcdef")).unwrap();
        assert_eq!(written, payload);
        assert!(state.failed_files.is_empty());

        let events = drain_events(&mut events_rx);
        let received = events
            .iter()
            .filter(|e| matches!(e, BackupEvent::FileReceived(_)))
            .count();
        assert_eq!(received, 1);

        // The device hears a zero status with an empty dictionary
        let Value::Array(reply) = server.read_plist_value().await.unwrap() else {
            panic!("no status response")
        };
        assert_eq!(reply[0].as_string(), Some("DLMessageStatusResponse"));
        assert_eq!(reply[1].as_signed_integer(), Some(0));
    }

    #[tokio::test]
    async fn failed_file_does_not_abort_the_batch() {
        let root = test_dir("partial");
        let (mut backup, mut server) = mock_backup_client(256 * 1024).await;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (mut state, _stop) = session_state(root.clone(), events_tx);

        announce_file(&mut server, "Media/one", "00/first").await;
        send_file_data(&mut server, b"first file").await;
        send_file_trailer(&mut server, CODE_SUCCESS, &[]).await;

        announce_file(&mut server, "Media/two", "00/second").await;
        send_file_trailer(&mut server, CODE_REMOTE_ERROR, b"denied").await;
        end_batch(&mut server).await;

        backup
            .handle_download_files(&[Value::Array(Vec::new())], &mut state)
            .await
            .unwrap();

        assert!(root.join("00/first").exists());
        assert!(!root.join("00/second").exists());
        assert_eq!(state.failed_files.len(), 1);
        assert_eq!(state.failed_files[0].backup_path, "00/second");

        let events = drain_events(&mut events_rx);
        let errors: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                BackupEvent::FileTransferError { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec!["denied".to_string()]);

        let Value::Array(reply) = server.read_plist_value().await.unwrap() else {
            panic!("no status response")
        };
        assert_eq!(reply[1].as_signed_integer(), Some(-13));
    }

    #[tokio::test]
    async fn escaping_backup_path_is_rejected_and_drained() {
        let root = test_dir("containment");
        let (mut backup, mut server) = mock_backup_client(256 * 1024).await;
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (mut state, _stop) = session_state(root.clone(), events_tx);

        announce_file(&mut server, "Media/evil", "../outside").await;
        send_file_data(&mut server, b"should never land").await;
        send_file_trailer(&mut server, CODE_SUCCESS, &[]).await;

        announce_file(&mut server, "Media/good", "00/good").await;
        send_file_data(&mut server, b"ok").await;
        send_file_trailer(&mut server, CODE_SUCCESS, &[]).await;
        end_batch(&mut server).await;

        backup
            .handle_download_files(&[Value::Array(Vec::new())], &mut state)
            .await
            .unwrap();

        assert!(!root.parent().unwrap().join("outside").exists());
        assert!(root.join("00/good").exists());
        assert_eq!(state.failed_files.len(), 1);
        assert_eq!(state.failed_files[0].backup_path, "../outside");
    }

    #[tokio::test]
    async fn message_loop_exits_on_zero_result_code() {
        let root = test_dir("result");
        let (mut backup, mut server) = mock_backup_client(256 * 1024).await;
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (mut state, _stop) = session_state(root, events_tx);

        let mut result = Dictionary::new();
        result.insert("ErrorCode".into(), 0.into());
        send_dl(
            &mut server,
            vec![
                Value::String(DL_PROCESS_MESSAGE.into()),
                Value::Dictionary(result),
            ],
        )
        .await;

        let options = BackupOptions::new("unused");
        backup.message_loop(&options, &mut state).await.unwrap();
        assert!(state.finished);
    }

    #[tokio::test]
    async fn device_locked_result_code_is_fatal() {
        let root = test_dir("locked");
        let (mut backup, mut server) = mock_backup_client(256 * 1024).await;
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (mut state, _stop) = session_state(root, events_tx);

        let mut result = Dictionary::new();
        result.insert("ErrorCode".into(), plist::Value::Integer((-208i64).into()));
        send_dl(
            &mut server,
            vec![
                Value::String(DL_PROCESS_MESSAGE.into()),
                Value::Dictionary(result),
            ],
        )
        .await;

        let options = BackupOptions::new("unused");
        match backup.message_loop(&options, &mut state).await {
            Err(MobiledeviceError::DeviceLocked) => {}
            other => panic!("expected DeviceLocked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_token_cancels_before_next_message() {
        let root = test_dir("cancel");
        let (mut backup, mut server) = mock_backup_client(256 * 1024).await;
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (mut state, stop) = session_state(root, events_tx);

        stop.send(true).unwrap();
        let options = BackupOptions::new("unused");
        backup.message_loop(&options, &mut state).await.unwrap();
        assert!(state.user_cancelled);

        // The engine said goodbye on the wire
        let Value::Array(reply) = server.read_plist_value().await.unwrap() else {
            panic!("no disconnect")
        };
        assert_eq!(reply[0].as_string(), Some("DLMessageDisconnect"));
    }

    #[test]
    fn passcode_gate_version_windows() {
        assert!(!passcode_gate_applies((15, 7, 0)));
        assert!(passcode_gate_applies((15, 7, 1)));
        assert!(passcode_gate_applies((15, 8, 0)));
        assert!(!passcode_gate_applies((16, 0, 2)));
        assert!(passcode_gate_applies((16, 1, 0)));
        assert!(passcode_gate_applies((17, 4, 0)));
        assert!(!passcode_gate_applies((14, 8, 0)));
    }

    #[test]
    fn resolve_keeps_paths_inside_the_device_dir() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (state, _stop) = session_state(PathBuf::from("/backups/UDID"), events_tx);
        assert_eq!(
            state.resolve("00/abcdef"),
            Some(PathBuf::from("/backups/UDID/00/abcdef"))
        );
        assert_eq!(state.resolve("../escape"), None);
        assert_eq!(state.resolve("/absolute"), None);
        assert_eq!(state.resolve("a/../../b"), None);
    }
}
