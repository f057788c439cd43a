//! Projection of engine-side state into tenant-visible status.
//!
//! Every helper here mutates a status struct in place and reports whether it
//! changed anything, so a reconciliation pass can accumulate all projections
//! into a single status update and skip the write entirely when the pass was
//! a no-op.

use kube::api::ListParams;
use kube::{Api, Client, Resource};

use crate::api::v1alpha1::{
    DataMoverDataDownloads, DataMoverDataUploads, FileSystemPodVolumeBackups,
    FileSystemPodVolumeRestores, NonAdminBackupStatus, NonAdminBackupStorageLocationStatus,
    NonAdminDownloadRequestStatus, NonAdminRestoreStatus, QueueInfo,
};
use crate::common::constants::{VELERO_BACKUP_NAME_LABEL, VELERO_RESTORE_NAME_LABEL};
use crate::common::naming::valid_label_value;
use crate::util::errors::{Error, Result};
use crate::velero::{
    backup_phase_is_terminal, restore_phase_is_terminal, Backup, BackupStorageLocation,
    DataDownload, DataUpload, DeleteBackupRequest, DownloadRequest, PodVolumeBackup,
    PodVolumeRestore, Restore,
};

/// Deep-copies the Velero backup's spec and status into the tenant mirror.
pub fn mirror_velero_backup(status: &mut NonAdminBackupStatus, backup: &Backup) -> bool {
    let reference = status.velero_backup.get_or_insert_with(Default::default);
    let spec = Some(backup.spec.clone());
    let backup_status = backup.status.clone();
    if reference.spec == spec && reference.status == backup_status {
        return false;
    }
    reference.spec = spec;
    reference.status = backup_status;
    true
}

/// Mirrors the DeleteBackupRequest status created on the graceful-delete path.
pub fn mirror_delete_backup_request(
    status: &mut NonAdminBackupStatus,
    request: &DeleteBackupRequest,
) -> bool {
    let Some(reference) = status.velero_delete_backup_request.as_mut() else {
        return false;
    };
    if reference.status == request.status {
        return false;
    }
    reference.status = request.status.clone();
    true
}

pub fn mirror_velero_restore(status: &mut NonAdminRestoreStatus, restore: &Restore) -> bool {
    let reference = status.velero_restore.get_or_insert_with(Default::default);
    let spec = Some(restore.spec.clone());
    let restore_status = restore.status.clone();
    if reference.spec == spec && reference.status == restore_status {
        return false;
    }
    reference.spec = spec;
    reference.status = restore_status;
    true
}

pub fn mirror_velero_bsl(
    status: &mut NonAdminBackupStorageLocationStatus,
    bsl: &BackupStorageLocation,
) -> bool {
    let Some(reference) = status.velero_backup_storage_location.as_mut() else {
        return false;
    };
    if reference.status == bsl.status {
        return false;
    }
    reference.status = bsl.status.clone();
    true
}

pub fn mirror_velero_download_request(
    status: &mut NonAdminDownloadRequestStatus,
    request: &DownloadRequest,
) -> bool {
    let Some(reference) = status.velero_download_request.as_mut() else {
        return false;
    };
    if reference.status == request.status {
        return false;
    }
    reference.status = request.status.clone();
    true
}

/// How many backups sit ahead of `target` in the engine's work queue: those
/// created earlier that have not reached a terminal phase. Position 1 means
/// next in line (or running).
pub fn backup_queue_position(target: &Backup, all: &[Backup]) -> i64 {
    let target_created = target.meta().creation_timestamp.as_ref();
    let ahead = all
        .iter()
        .filter(|candidate| candidate.meta().uid != target.meta().uid)
        .filter(|candidate| {
            let phase = candidate
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .unwrap_or_default();
            !backup_phase_is_terminal(phase)
        })
        .filter(|candidate| match (candidate.meta().creation_timestamp.as_ref(), target_created) {
            (Some(theirs), Some(ours)) => theirs < ours,
            // missing timestamps only happen on objects not yet persisted;
            // count them in rather than under-reporting the position
            _ => true,
        })
        .count();
    ahead as i64 + 1
}

/// Lists all engine backups and computes the queue position of `target`.
pub async fn backup_queue_info(
    client: &Client,
    namespace: &str,
    target: &Backup,
) -> Result<QueueInfo> {
    let api: Api<Backup> = Api::namespaced(client.clone(), namespace);
    let backups = api
        .list(&ListParams::default())
        .await
        .map_err(Error::KubeError)?;
    Ok(QueueInfo {
        estimated_queue_position: backup_queue_position(target, &backups.items),
    })
}

pub fn restore_queue_position(target: &Restore, all: &[Restore]) -> i64 {
    let target_created = target.meta().creation_timestamp.as_ref();
    let ahead = all
        .iter()
        .filter(|candidate| candidate.meta().uid != target.meta().uid)
        .filter(|candidate| {
            let phase = candidate
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .unwrap_or_default();
            !restore_phase_is_terminal(phase)
        })
        .filter(|candidate| match (candidate.meta().creation_timestamp.as_ref(), target_created) {
            (Some(theirs), Some(ours)) => theirs < ours,
            _ => true,
        })
        .count();
    ahead as i64 + 1
}

pub async fn restore_queue_info(
    client: &Client,
    namespace: &str,
    target: &Restore,
) -> Result<QueueInfo> {
    let api: Api<Restore> = Api::namespaced(client.clone(), namespace);
    let restores = api
        .list(&ListParams::default())
        .await
        .map_err(Error::KubeError)?;
    Ok(QueueInfo {
        estimated_queue_position: restore_queue_position(target, &restores.items),
    })
}

/// Lists the PodVolumeBackups Velero labeled with this backup's name.
pub async fn list_pod_volume_backups(
    client: &Client,
    namespace: &str,
    backup_name: &str,
) -> Result<Vec<PodVolumeBackup>> {
    let api: Api<PodVolumeBackup> = Api::namespaced(client.clone(), namespace);
    let selector = format!("{VELERO_BACKUP_NAME_LABEL}={}", valid_label_value(backup_name));
    Ok(api
        .list(&ListParams::default().labels(&selector))
        .await
        .map_err(Error::KubeError)?
        .items)
}

pub async fn list_data_uploads(
    client: &Client,
    namespace: &str,
    backup_name: &str,
) -> Result<Vec<DataUpload>> {
    let api: Api<DataUpload> = Api::namespaced(client.clone(), namespace);
    let selector = format!("{VELERO_BACKUP_NAME_LABEL}={}", valid_label_value(backup_name));
    Ok(api
        .list(&ListParams::default().labels(&selector))
        .await
        .map_err(Error::KubeError)?
        .items)
}

pub async fn list_pod_volume_restores(
    client: &Client,
    namespace: &str,
    restore_name: &str,
) -> Result<Vec<PodVolumeRestore>> {
    let api: Api<PodVolumeRestore> = Api::namespaced(client.clone(), namespace);
    let selector = format!("{VELERO_RESTORE_NAME_LABEL}={}", valid_label_value(restore_name));
    Ok(api
        .list(&ListParams::default().labels(&selector))
        .await
        .map_err(Error::KubeError)?
        .items)
}

pub async fn list_data_downloads(
    client: &Client,
    namespace: &str,
    restore_name: &str,
) -> Result<Vec<DataDownload>> {
    let api: Api<DataDownload> = Api::namespaced(client.clone(), namespace);
    let selector = format!("{VELERO_RESTORE_NAME_LABEL}={}", valid_label_value(restore_name));
    Ok(api
        .list(&ListParams::default().labels(&selector))
        .await
        .map_err(Error::KubeError)?
        .items)
}

fn pod_volume_backup_counters(items: &[PodVolumeBackup]) -> FileSystemPodVolumeBackups {
    let mut counters = FileSystemPodVolumeBackups {
        total: items.len() as i64,
        ..Default::default()
    };
    for item in items {
        match item.status.as_ref().and_then(|s| s.phase.as_deref()) {
            Some("New") => counters.new += 1,
            Some("InProgress") => counters.in_progress += 1,
            Some("Failed") => counters.failed += 1,
            Some("Completed") => counters.completed += 1,
            _ => continue,
        }
    }
    counters
}

pub fn update_pod_volume_backups(
    status: &mut NonAdminBackupStatus,
    items: &[PodVolumeBackup],
) -> bool {
    let counters = pod_volume_backup_counters(items);
    if status.file_system_pod_volume_backups.as_ref() == Some(&counters) {
        return false;
    }
    status.file_system_pod_volume_backups = Some(counters);
    true
}

fn data_upload_counters(items: &[DataUpload]) -> DataMoverDataUploads {
    let mut counters = DataMoverDataUploads {
        total: items.len() as i64,
        ..Default::default()
    };
    for item in items {
        match item.status.as_ref().and_then(|s| s.phase.as_deref()) {
            Some("New") => counters.new += 1,
            Some("Accepted") => counters.accepted += 1,
            Some("Prepared") => counters.prepared += 1,
            Some("InProgress") => counters.in_progress += 1,
            Some("Canceling") => counters.canceling += 1,
            Some("Canceled") => counters.canceled += 1,
            Some("Failed") => counters.failed += 1,
            Some("Completed") => counters.completed += 1,
            _ => continue,
        }
    }
    counters
}

pub fn update_data_uploads(status: &mut NonAdminBackupStatus, items: &[DataUpload]) -> bool {
    let counters = data_upload_counters(items);
    if status.data_mover_data_uploads.as_ref() == Some(&counters) {
        return false;
    }
    status.data_mover_data_uploads = Some(counters);
    true
}

fn pod_volume_restore_counters(items: &[PodVolumeRestore]) -> FileSystemPodVolumeRestores {
    let mut counters = FileSystemPodVolumeRestores {
        total: items.len() as i64,
        ..Default::default()
    };
    for item in items {
        match item.status.as_ref().and_then(|s| s.phase.as_deref()) {
            Some("New") => counters.new += 1,
            Some("InProgress") => counters.in_progress += 1,
            Some("Failed") => counters.failed += 1,
            Some("Completed") => counters.completed += 1,
            _ => continue,
        }
    }
    counters
}

pub fn update_pod_volume_restores(
    status: &mut NonAdminRestoreStatus,
    items: &[PodVolumeRestore],
) -> bool {
    let counters = pod_volume_restore_counters(items);
    if status.file_system_pod_volume_restores.as_ref() == Some(&counters) {
        return false;
    }
    status.file_system_pod_volume_restores = Some(counters);
    true
}

fn data_download_counters(items: &[DataDownload]) -> DataMoverDataDownloads {
    let mut counters = DataMoverDataDownloads {
        total: items.len() as i64,
        ..Default::default()
    };
    for item in items {
        match item.status.as_ref().and_then(|s| s.phase.as_deref()) {
            Some("New") => counters.new += 1,
            Some("Accepted") => counters.accepted += 1,
            Some("Prepared") => counters.prepared += 1,
            Some("InProgress") => counters.in_progress += 1,
            Some("Canceling") => counters.canceling += 1,
            Some("Canceled") => counters.canceled += 1,
            Some("Failed") => counters.failed += 1,
            Some("Completed") => counters.completed += 1,
            _ => continue,
        }
    }
    counters
}

pub fn update_data_downloads(status: &mut NonAdminRestoreStatus, items: &[DataDownload]) -> bool {
    let counters = data_download_counters(items);
    if status.data_mover_data_downloads.as_ref() == Some(&counters) {
        return false;
    }
    status.data_mover_data_downloads = Some(counters);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::velero::{BackupSpec, BackupStatus, PodVolumeBackupStatus};
    use chrono::{TimeZone, Utc};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn backup(name: &str, created_minute: u32, phase: Option<&str>) -> Backup {
        let mut backup = Backup::new(name, BackupSpec::default());
        backup.metadata.uid = Some(format!("uid-{name}"));
        backup.metadata.creation_timestamp = Some(Time(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, created_minute, 0).unwrap(),
        ));
        backup.status = phase.map(|p| BackupStatus {
            phase: Some(p.to_string()),
            ..Default::default()
        });
        backup
    }

    #[test]
    fn queue_position_counts_earlier_non_terminal_backups() {
        let target = backup("target", 30, None);
        let all = vec![
            backup("done-earlier", 10, Some("Completed")),
            backup("running-earlier", 15, Some("InProgress")),
            backup("waiting-earlier", 20, None),
            backup("later", 40, None),
            target.clone(),
        ];
        assert_eq!(backup_queue_position(&target, &all), 3);
    }

    #[test]
    fn queue_position_is_one_for_front_of_queue() {
        let target = backup("target", 5, None);
        let all = vec![backup("done", 1, Some("Failed")), target.clone()];
        assert_eq!(backup_queue_position(&target, &all), 1);
    }

    #[test]
    fn backup_mirror_reports_change_once() {
        let mut status = NonAdminBackupStatus::default();
        let mut velero_backup = backup("b", 1, Some("InProgress"));

        assert!(mirror_velero_backup(&mut status, &velero_backup));
        assert!(!mirror_velero_backup(&mut status, &velero_backup));

        velero_backup.status.as_mut().unwrap().phase = Some("Completed".to_string());
        assert!(mirror_velero_backup(&mut status, &velero_backup));
        assert_eq!(
            status
                .velero_backup
                .as_ref()
                .and_then(|r| r.status.as_ref())
                .and_then(|s| s.phase.as_deref()),
            Some("Completed")
        );
    }

    fn pod_volume_backup(phase: Option<&str>) -> PodVolumeBackup {
        let mut pvb = PodVolumeBackup::new("pvb", Default::default());
        pvb.status = phase.map(|p| PodVolumeBackupStatus {
            phase: Some(p.to_string()),
            ..Default::default()
        });
        pvb
    }

    #[test]
    fn pod_volume_backup_tally() {
        let items = vec![
            pod_volume_backup(Some("New")),
            pod_volume_backup(Some("InProgress")),
            pod_volume_backup(Some("InProgress")),
            pod_volume_backup(Some("Completed")),
            pod_volume_backup(Some("Failed")),
            pod_volume_backup(None),
        ];

        let mut status = NonAdminBackupStatus::default();
        assert!(update_pod_volume_backups(&mut status, &items));
        let counters = status.file_system_pod_volume_backups.as_ref().unwrap();
        assert_eq!(counters.total, 6);
        assert_eq!(counters.new, 1);
        assert_eq!(counters.in_progress, 2);
        assert_eq!(counters.completed, 1);
        assert_eq!(counters.failed, 1);

        // unchanged input does not report a change
        assert!(!update_pod_volume_backups(&mut status, &items));
    }

    #[test]
    fn delete_backup_request_mirror_requires_reference() {
        let mut status = NonAdminBackupStatus::default();
        let request = DeleteBackupRequest::new("req", Default::default());
        // no reference recorded yet, nothing to mirror into
        assert!(!mirror_delete_backup_request(&mut status, &request));
    }
}
