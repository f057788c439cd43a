//! Typed views of the Velero resources this operator writes and observes.
//!
//! Velero owns these CRDs; the structs here model the fields the non-admin
//! controller reads and sets. Unknown fields on the server side are ignored
//! on deserialization, and every field is optional so a partial view never
//! fails to decode.

pub mod v1;
pub mod v2alpha1;

pub use v1::{
    Backup, BackupSpec, BackupStatus, BackupStorageLocation, BackupStorageLocationSpec,
    BackupStorageLocationStatus, DeleteBackupRequest, DeleteBackupRequestSpec,
    DeleteBackupRequestStatus, DownloadRequest, DownloadRequestSpec, DownloadRequestStatus,
    DownloadTarget, ObjectStorageLocation, PodVolumeBackup, PodVolumeBackupSpec,
    PodVolumeBackupStatus, PodVolumeRestore, PodVolumeRestoreSpec, PodVolumeRestoreStatus, Restore,
    RestoreSpec, RestoreStatus,
};
pub use v2alpha1::{
    DataDownload, DataDownloadSpec, DataDownloadStatus, DataUpload, DataUploadSpec,
    DataUploadStatus,
};

/// Phases after which a Velero backup no longer occupies a queue slot.
pub fn backup_phase_is_terminal(phase: &str) -> bool {
    matches!(
        phase,
        "Completed" | "PartiallyFailed" | "Failed" | "FailedValidation"
    )
}

/// Phases after which a Velero restore no longer occupies a queue slot.
pub fn restore_phase_is_terminal(phase: &str) -> bool {
    matches!(phase, "Completed" | "PartiallyFailed" | "Failed" | "FailedValidation")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_backup_phases() {
        for phase in ["Completed", "PartiallyFailed", "Failed", "FailedValidation"] {
            assert!(backup_phase_is_terminal(phase), "{phase} should be terminal");
        }
        for phase in ["", "New", "InProgress", "WaitingForPluginOperations", "Finalizing", "Deleting"] {
            assert!(!backup_phase_is_terminal(phase), "{phase} should not be terminal");
        }
    }
}
