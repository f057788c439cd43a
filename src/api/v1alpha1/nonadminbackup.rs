use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    conditions_schema, DataMoverDataUploads, FileSystemPodVolumeBackups, NonAdminPhase, QueueInfo,
};
use crate::velero::{BackupSpec, BackupStatus, DeleteBackupRequestStatus};

pub static NAB_FINALIZER: &str = "nonadminbackup.oadp.openshift.io/finalizer";

/// Generate the Kubernetes wrapper struct `NonAdminBackup` from our Spec and Status struct
///
/// This provides a hook for generating the CRD yaml (in crdgen.rs)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "NonAdminBackup",
    group = "oadp.openshift.io",
    version = "v1alpha1",
    namespaced
)]
#[kube(status = "NonAdminBackupStatus", shortname = "nab")]
#[serde(rename_all = "camelCase")]
pub struct NonAdminBackupSpec {
    /// Backup specification as understood by the backup engine. The
    /// controller confines it to the tenant namespace and layers the
    /// admin-enforced fields on top before handing it to Velero.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_spec: Option<BackupSpec>,

    /// Request permanent deletion of the backed-up data. Setting this to
    /// true is the only way to remove data from object storage; deleting
    /// the NonAdminBackup object alone keeps the data.
    #[serde(default)]
    pub delete_backup: bool,
}

/// The status object of `NonAdminBackup`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NonAdminBackupStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<NonAdminPhase>,
    #[schemars(schema_with = "conditions_schema")]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub velero_backup: Option<VeleroBackupReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub velero_delete_backup_request: Option<VeleroDeleteBackupRequestReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_info: Option<QueueInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_system_pod_volume_backups: Option<FileSystemPodVolumeBackups>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_mover_data_uploads: Option<DataMoverDataUploads>,
}

/// Binding to the Velero Backup in the OADP namespace, plus a mirror of its
/// spec and status. The `nacuuid` is minted once and never regenerated; the
/// Velero object is named after it.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VeleroBackupReference {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nacuuid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec: Option<BackupSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<BackupStatus>,
}

/// Reference to the in-flight Velero DeleteBackupRequest, if any.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VeleroDeleteBackupRequestReference {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nacuuid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DeleteBackupRequestStatus>,
}

impl NonAdminBackup {
    /// NAC UUID recorded in status, if one has been assigned.
    pub fn nac_uuid(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.velero_backup.as_ref())
            .map(|vb| vb.nacuuid.as_str())
            .filter(|uuid| !uuid.is_empty())
    }
}
