use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::velero::{BackupSpec, RestoreSpec};

/// The slice of the OADP operator's DataProtectionApplication this controller
/// reads at startup: the non-admin feature toggle and the admin-enforced
/// spec fields. The rest of the DPA belongs to the installer and is ignored.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "DataProtectionApplication",
    group = "oadp.openshift.io",
    version = "v1alpha1",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DataProtectionApplicationSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub non_admin: Option<NonAdminConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NonAdminConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enforce_backup_spec: Option<BackupSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enforce_restore_spec: Option<RestoreSpec>,
}
