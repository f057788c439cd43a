//! Label, annotation and environment names shared across controllers.

/// Environment variable naming the privileged namespace all Velero objects
/// live in.
pub const OADP_NAMESPACE_ENV: &str = "OADP_NAMESPACE";

/// Marker label present on every Velero object this operator creates.
pub static NAC_MANAGED_LABEL: &str = "oadp.openshift.io/nac-managed";

/// Primary binding key: the NAC UUID of the owning non-admin object.
pub static NAC_ORIGIN_UUID_LABEL: &str = "oadp.openshift.io/nac-origin-uuid";

pub static MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub static MANAGED_BY_VALUE: &str = "oadp-nac-controller";

/// Origin annotations pointing from an engine object back to its tenant.
pub static ORIGIN_NAMESPACE_ANNOTATION: &str = "oadp.openshift.io/origin-namespace";
pub static ORIGIN_NAME_ANNOTATION: &str = "oadp.openshift.io/origin-name";
pub static ORIGIN_UID_ANNOTATION: &str = "oadp.openshift.io/origin-uid";

/// Label a tenant may put on a fresh NonAdminBackup to adopt a surviving
/// Velero backup instead of creating a new one.
pub static NAB_SYNC_LABEL: &str = "oadp.openshift.io/sync-from-nac-uuid";

/// Labels Velero itself stamps on child workload objects.
pub static VELERO_BACKUP_NAME_LABEL: &str = "velero.io/backup-name";
pub static VELERO_BACKUP_UID_LABEL: &str = "velero.io/backup-uid";
pub static VELERO_RESTORE_NAME_LABEL: &str = "velero.io/restore-name";
