//! oadp.openshift.io/v1alpha1 tenant-facing resources.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

mod dataprotectionapplication;
mod nonadminbackup;
mod nonadminbackupstoragelocation;
mod nonadmindownloadrequest;
mod nonadminrestore;

pub use dataprotectionapplication::{
    DataProtectionApplication, DataProtectionApplicationSpec, NonAdminConfig,
};
pub use nonadminbackup::{
    NonAdminBackup, NonAdminBackupSpec, NonAdminBackupStatus, VeleroBackupReference,
    VeleroDeleteBackupRequestReference, NAB_FINALIZER,
};
pub use nonadminbackupstoragelocation::{
    NonAdminBackupStorageLocation, NonAdminBackupStorageLocationSpec,
    NonAdminBackupStorageLocationStatus, VeleroBackupStorageLocationReference, NABSL_FINALIZER,
};
pub use nonadmindownloadrequest::{
    NonAdminDownloadRequest, NonAdminDownloadRequestSpec, NonAdminDownloadRequestStatus,
    VeleroDownloadRequestReference,
};
pub use nonadminrestore::{
    NonAdminRestore, NonAdminRestoreSpec, NonAdminRestoreStatus, VeleroRestoreReference,
    NAR_FINALIZER,
};

/// Plural resource names, used for the always-excluded backup resource lists.
pub const NON_ADMIN_BACKUPS: &str = "nonadminbackups";
pub const NON_ADMIN_RESTORES: &str = "nonadminrestores";
pub const NON_ADMIN_BACKUP_STORAGE_LOCATIONS: &str = "nonadminbackupstoragelocations";

/// High-level lifecycle phase shared by all non-admin kinds.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum NonAdminPhase {
    New,
    BackingOff,
    Created,
    Deleting,
}

impl fmt::Display for NonAdminPhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NonAdminPhase::New => write!(f, "New"),
            NonAdminPhase::BackingOff => write!(f, "BackingOff"),
            NonAdminPhase::Created => write!(f, "Created"),
            NonAdminPhase::Deleting => write!(f, "Deleting"),
        }
    }
}

/// Condition types recognized on non-admin objects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NonAdminCondition {
    Accepted,
    Queued,
    Deleting,
}

impl NonAdminCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            NonAdminCondition::Accepted => "Accepted",
            NonAdminCondition::Queued => "Queued",
            NonAdminCondition::Deleting => "Deleting",
        }
    }
}

impl fmt::Display for NonAdminCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue placement of the underlying Velero object.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueInfo {
    pub estimated_queue_position: i64,
}

/// Phase tally of PodVolumeBackups belonging to one backup.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemPodVolumeBackups {
    pub total: i64,
    pub new: i64,
    pub in_progress: i64,
    pub failed: i64,
    pub completed: i64,
}

/// Phase tally of PodVolumeRestores belonging to one restore.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemPodVolumeRestores {
    pub total: i64,
    pub new: i64,
    pub in_progress: i64,
    pub failed: i64,
    pub completed: i64,
}

/// Phase tally of DataUploads belonging to one backup.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataMoverDataUploads {
    pub total: i64,
    pub new: i64,
    pub accepted: i64,
    pub prepared: i64,
    pub in_progress: i64,
    pub canceling: i64,
    pub canceled: i64,
    pub failed: i64,
    pub completed: i64,
}

/// Phase tally of DataDownloads belonging to one restore.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataMoverDataDownloads {
    pub total: i64,
    pub new: i64,
    pub accepted: i64,
    pub prepared: i64,
    pub in_progress: i64,
    pub canceling: i64,
    pub canceled: i64,
    pub failed: i64,
    pub completed: i64,
}

pub(crate) fn conditions_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    serde_json::from_value(serde_json::json!({
        "type": "array",
        "x-kubernetes-list-type": "map",
        "x-kubernetes-list-map-keys": ["type"],
        "items": {
            "type": "object",
            "properties": {
                "lastTransitionTime": { "format": "date-time", "type": "string" },
                "message": { "type": "string" },
                "observedGeneration": { "type": "integer", "format": "int64", "default": 0 },
                "reason": { "type": "string" },
                "status": { "type": "string" },
                "type": { "type": "string" }
            },
            "required": [
                "lastTransitionTime",
                "message",
                "reason",
                "status",
                "type"
            ],
        },
    }))
    .unwrap()
}
