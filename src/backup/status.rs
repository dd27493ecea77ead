//! Status.plist decoding
//!
//! The device rewrites Status.plist as the snapshot advances; the engine
//! decodes each revision and enforces that the snapshot only moves forward.

use log::warn;

/// Stage of the snapshot inside one backup run
///
/// Ordering matters: a run only moves forward, except that a read timeout
/// re-enters `Waiting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SnapshotState {
    Uninitialized,
    Waiting,
    Modeling,
    Metadata,
    Running,
    Finished,
}

impl SnapshotState {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "uninitialized" => Some(Self::Uninitialized),
            "waiting" => Some(Self::Waiting),
            "modeling" => Some(Self::Modeling),
            "metadata" => Some(Self::Metadata),
            "running" => Some(Self::Running),
            "finished" => Some(Self::Finished),
            _ => None,
        }
    }

    /// Moves forward only; older states are ignored
    pub fn advance(&mut self, next: SnapshotState) {
        if next > *self {
            *self = next;
        }
    }

    /// Transient timeout recovery re-enters the waiting stage
    pub fn reenter_waiting(&mut self) {
        *self = SnapshotState::Waiting;
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Waiting => "waiting",
            Self::Modeling => "modeling",
            Self::Metadata => "metadata",
            Self::Running => "running",
            Self::Finished => "finished",
        }
    }
}

/// Decoded Status.plist, replaced wholesale on each device update
#[derive(Debug, Clone)]
pub struct BackupStatus {
    pub snapshot_state: SnapshotState,
    pub backup_state: Option<String>,
    pub date: Option<plist::Date>,
    pub version: Option<String>,
    pub uuid: Option<String>,
    pub is_full_backup: bool,
}

impl BackupStatus {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let dict: plist::Dictionary = match plist::from_bytes(bytes) {
            Ok(d) => d,
            Err(e) => {
                warn!("Status.plist did not parse: {e:?}");
                return None;
            }
        };
        Some(Self::from_dictionary(&dict))
    }

    pub fn from_dictionary(dict: &plist::Dictionary) -> Self {
        let snapshot_state = dict
            .get("SnapshotState")
            .and_then(|s| s.as_string())
            .and_then(SnapshotState::parse)
            .unwrap_or(SnapshotState::Uninitialized);
        Self {
            snapshot_state,
            backup_state: dict
                .get("BackupState")
                .and_then(|s| s.as_string())
                .map(|s| s.to_string()),
            date: dict.get("Date").and_then(|d| d.as_date()),
            version: dict
                .get("Version")
                .and_then(|s| s.as_string())
                .map(|s| s.to_string()),
            uuid: dict
                .get("UUID")
                .and_then(|s| s.as_string())
                .map(|s| s.to_string()),
            is_full_backup: dict
                .get("IsFullBackup")
                .and_then(|b| b.as_boolean())
                .unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_state_never_moves_backwards() {
        let mut state = SnapshotState::Uninitialized;
        state.advance(SnapshotState::Running);
        assert_eq!(state, SnapshotState::Running);

        state.advance(SnapshotState::Modeling);
        assert_eq!(state, SnapshotState::Running);

        state.advance(SnapshotState::Finished);
        assert_eq!(state, SnapshotState::Finished);
    }

    #[test]
    fn timeout_reenters_waiting_from_any_state() {
        let mut state = SnapshotState::Running;
        state.reenter_waiting();
        assert_eq!(state, SnapshotState::Waiting);

        state.advance(SnapshotState::Running);
        assert_eq!(state, SnapshotState::Running);
    }

    #[test]
    fn status_plist_decodes() {
        let mut dict = plist::Dictionary::new();
        dict.insert("SnapshotState".into(), "finished".into());
        dict.insert("BackupState".into(), "new".into());
        dict.insert("UUID".into(), "F5D2BAF2".into());
        dict.insert("IsFullBackup".into(), true.into());
        dict.insert("Version".into(), "3.3".into());

        let status = BackupStatus::from_dictionary(&dict);
        assert_eq!(status.snapshot_state, SnapshotState::Finished);
        assert_eq!(status.backup_state.as_deref(), Some("new"));
        assert!(status.is_full_backup);
        assert_eq!(status.version.as_deref(), Some("3.3"));
    }
}
