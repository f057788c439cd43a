use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{conditions_schema, NonAdminPhase};
use crate::velero::{BackupStorageLocationSpec, BackupStorageLocationStatus};

pub static NABSL_FINALIZER: &str = "nonadminbackupstoragelocation.oadp.openshift.io/finalizer";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "NonAdminBackupStorageLocation",
    group = "oadp.openshift.io",
    version = "v1alpha1",
    namespaced
)]
#[kube(status = "NonAdminBackupStorageLocationStatus", shortname = "nabsl")]
#[serde(rename_all = "camelCase")]
pub struct NonAdminBackupStorageLocationSpec {
    /// Storage location specification. The referenced credential secret must
    /// live in the tenant namespace; the controller copies it into the OADP
    /// namespace alongside the promoted Velero BackupStorageLocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_storage_location_spec: Option<BackupStorageLocationSpec>,
}

/// The status object of `NonAdminBackupStorageLocation`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NonAdminBackupStorageLocationStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<NonAdminPhase>,
    #[schemars(schema_with = "conditions_schema")]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub velero_backup_storage_location: Option<VeleroBackupStorageLocationReference>,
}

/// Binding to the promoted Velero BackupStorageLocation (and its credential
/// secret copy, which shares the NAC UUID name).
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VeleroBackupStorageLocationReference {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nacuuid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<BackupStorageLocationStatus>,
}

impl NonAdminBackupStorageLocation {
    pub fn nac_uuid(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.velero_backup_storage_location.as_ref())
            .map(|bsl| bsl.nacuuid.as_str())
            .filter(|uuid| !uuid.is_empty())
    }

    /// Name of the promoted Velero BSL, once the binding exists.
    pub fn velero_bsl_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.velero_backup_storage_location.as_ref())
            .map(|bsl| bsl.name.as_str())
            .filter(|name| !name.is_empty())
    }
}
