use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{conditions_schema, NonAdminPhase};
use crate::velero::{DownloadRequestStatus, DownloadTarget};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "NonAdminDownloadRequest",
    group = "oadp.openshift.io",
    version = "v1alpha1",
    namespaced
)]
#[kube(status = "NonAdminDownloadRequestStatus", shortname = "nadr")]
#[serde(rename_all = "camelCase")]
pub struct NonAdminDownloadRequestSpec {
    /// Artifact to fetch. `target.name` refers to a NonAdminBackup or
    /// NonAdminRestore in the same namespace; the controller rewrites it to
    /// the corresponding Velero object name.
    pub target: DownloadTarget,
}

/// The status object of `NonAdminDownloadRequest`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NonAdminDownloadRequestStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<NonAdminPhase>,
    #[schemars(schema_with = "conditions_schema")]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub velero_download_request: Option<VeleroDownloadRequestReference>,
}

/// Binding to the Velero DownloadRequest, including the signed URL mirror.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VeleroDownloadRequestReference {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nacuuid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DownloadRequestStatus>,
}

impl NonAdminDownloadRequest {
    pub fn nac_uuid(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.velero_download_request.as_ref())
            .map(|dr| dr.nacuuid.as_str())
            .filter(|uuid| !uuid.is_empty())
    }

    /// Whether the target kind refers to restore artifacts.
    pub fn targets_restore(&self) -> bool {
        self.spec.target.kind.starts_with("Restore")
    }
}
