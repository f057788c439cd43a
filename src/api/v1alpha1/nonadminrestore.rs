use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    conditions_schema, DataMoverDataDownloads, FileSystemPodVolumeRestores, NonAdminPhase,
    QueueInfo,
};
use crate::velero::{RestoreSpec, RestoreStatus};

pub static NAR_FINALIZER: &str = "nonadminrestore.oadp.openshift.io/finalizer";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "NonAdminRestore",
    group = "oadp.openshift.io",
    version = "v1alpha1",
    namespaced
)]
#[kube(status = "NonAdminRestoreStatus", shortname = "nar")]
#[serde(rename_all = "camelCase")]
pub struct NonAdminRestoreSpec {
    /// Restore specification. `backupName` must name a NonAdminBackup in the
    /// same namespace; the controller rewrites it to the Velero backup name
    /// before creating the engine restore.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore_spec: Option<RestoreSpec>,
}

/// The status object of `NonAdminRestore`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NonAdminRestoreStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<NonAdminPhase>,
    #[schemars(schema_with = "conditions_schema")]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub velero_restore: Option<VeleroRestoreReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_info: Option<QueueInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_system_pod_volume_restores: Option<FileSystemPodVolumeRestores>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_mover_data_downloads: Option<DataMoverDataDownloads>,
}

/// Binding to the Velero Restore in the OADP namespace.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VeleroRestoreReference {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nacuuid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec: Option<RestoreSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RestoreStatus>,
}

impl NonAdminRestore {
    pub fn nac_uuid(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.velero_restore.as_ref())
            .map(|vr| vr.nacuuid.as_str())
            .filter(|uuid| !uuid.is_empty())
    }

    /// The NonAdminBackup name the tenant asked to restore from.
    pub fn backup_name(&self) -> Option<&str> {
        self.spec
            .restore_spec
            .as_ref()
            .map(|rs| rs.backup_name.as_str())
            .filter(|name| !name.is_empty())
    }
}
