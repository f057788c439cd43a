//! Event fan-in: translating engine-namespace events into tenant work items.
//!
//! Engine objects carry no owner reference into tenant namespaces (the API
//! server forbids cross-namespace owners), so every mapper here resolves the
//! origin annotations instead. Objects without the non-admin marker label
//! are dropped before any annotation is consulted.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use kube::Resource;

use crate::common::constants::{
    NAC_MANAGED_LABEL, ORIGIN_NAMESPACE_ANNOTATION, ORIGIN_NAME_ANNOTATION,
};
use crate::velero::{backup_phase_is_terminal, restore_phase_is_terminal, Backup, Restore};

/// Whether an engine object was created by this operator.
pub fn is_nac_managed(meta: &ObjectMeta) -> bool {
    meta.labels
        .as_ref()
        .and_then(|labels| labels.get(NAC_MANAGED_LABEL))
        .map(String::as_str)
        == Some("true")
}

/// Work-queue key of the tenant object an engine object points back to.
pub fn origin_tenant_ref<Owner>(meta: &ObjectMeta) -> Option<ObjectRef<Owner>>
where
    Owner: Resource<DynamicType = ()>,
{
    let annotations = meta.annotations.as_ref()?;
    let namespace = annotations.get(ORIGIN_NAMESPACE_ANNOTATION)?;
    let name = annotations.get(ORIGIN_NAME_ANNOTATION)?;
    if namespace.is_empty() || name.is_empty() {
        return None;
    }
    Some(ObjectRef::new(name).within(namespace))
}

/// Maps an engine-object event to the owning tenant object, dropping events
/// for objects this operator does not manage.
pub fn engine_to_tenant<Owner, K>(object: K) -> Option<ObjectRef<Owner>>
where
    K: Resource,
    Owner: Resource<DynamicType = ()>,
{
    let meta = object.meta();
    if !is_nac_managed(meta) {
        return None;
    }
    origin_tenant_ref(meta)
}

/// Maps a child workload event (PodVolumeBackup, DataUpload, ...) to the
/// tenant object, via the engine parent named in `parent_name_label`. The
/// parent lookup goes through a reflector store; a miss means the parent is
/// unknown (foreign, or already gone) and the event is dropped.
pub fn child_to_tenant<Owner, Parent>(
    child_meta: &ObjectMeta,
    parent_name_label: &str,
    parents: &Store<Parent>,
    operator_namespace: &str,
) -> Option<ObjectRef<Owner>>
where
    Owner: Resource<DynamicType = ()>,
    Parent: Resource<DynamicType = ()> + Clone + 'static,
{
    let parent_name = child_meta.labels.as_ref()?.get(parent_name_label)?;
    let parent = parents.get(&ObjectRef::new(parent_name).within(operator_namespace))?;
    if !is_nac_managed(parent.meta()) {
        return None;
    }
    origin_tenant_ref(parent.meta())
}

/// True when an engine backup event can shift tenant queue positions: a
/// backup entered the queue or left it (deleted, or reached a terminal
/// phase). Such events re-enqueue every tenant backup.
pub fn backup_queue_shift(event: &watcher::Event<Backup>) -> bool {
    match event {
        watcher::Event::Delete(_) => true,
        watcher::Event::Apply(backup) => {
            let phase = backup
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .unwrap_or_default();
            phase.is_empty() || backup_phase_is_terminal(phase)
        }
        _ => false,
    }
}

/// Restore-side analog of [`backup_queue_shift`].
pub fn restore_queue_shift(event: &watcher::Event<Restore>) -> bool {
    match event {
        watcher::Event::Delete(_) => true,
        watcher::Event::Apply(restore) => {
            let phase = restore
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .unwrap_or_default();
            phase.is_empty() || restore_phase_is_terminal(phase)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1alpha1::NonAdminBackup;
    use crate::common::constants::{NAC_ORIGIN_UUID_LABEL, VELERO_BACKUP_NAME_LABEL};
    use crate::common::naming::{non_admin_labels, origin_annotations};
    use crate::velero::{BackupSpec, BackupStatus, PodVolumeBackup};
    use kube::runtime::reflector;

    fn engine_backup(uuid: &str, origin_namespace: &str, origin_name: &str) -> Backup {
        let mut backup = Backup::new(uuid, BackupSpec::default());
        backup.metadata.namespace = Some("openshift-adp".to_string());
        let mut labels = non_admin_labels();
        labels.insert(NAC_ORIGIN_UUID_LABEL.to_string(), uuid.to_string());
        backup.metadata.labels = Some(labels);
        backup.metadata.annotations = Some(origin_annotations(&ObjectMeta {
            namespace: Some(origin_namespace.to_string()),
            name: Some(origin_name.to_string()),
            uid: Some("uid-1".to_string()),
            ..Default::default()
        }));
        backup
    }

    #[test]
    fn engine_events_map_to_the_origin_tenant() {
        let backup = engine_backup("0495ba35", "team-a", "db");
        let mapped = engine_to_tenant::<NonAdminBackup, _>(backup);
        assert_eq!(mapped, Some(ObjectRef::new("db").within("team-a")));
    }

    #[test]
    fn unmanaged_engine_objects_are_dropped() {
        let mut backup = engine_backup("0495ba35", "team-a", "db");
        backup.metadata.labels = None;
        assert_eq!(engine_to_tenant::<NonAdminBackup, _>(backup), None);

        // marker without origin annotations is dropped too
        let mut backup = engine_backup("0495ba35", "team-a", "db");
        backup.metadata.annotations = None;
        assert_eq!(engine_to_tenant::<NonAdminBackup, _>(backup), None);
    }

    #[test]
    fn child_events_resolve_through_the_parent_store() {
        let (reader, mut writer) = reflector::store::<Backup>();
        writer.apply_watcher_event(&watcher::Event::Apply(engine_backup(
            "0495ba35", "team-a", "db",
        )));

        let mut pvb = PodVolumeBackup::new("pvb-1", Default::default());
        pvb.metadata.namespace = Some("openshift-adp".to_string());
        pvb.metadata.labels = Some(
            [(VELERO_BACKUP_NAME_LABEL.to_string(), "0495ba35".to_string())]
                .into_iter()
                .collect(),
        );

        let mapped = child_to_tenant::<NonAdminBackup, Backup>(
            &pvb.metadata,
            VELERO_BACKUP_NAME_LABEL,
            &reader,
            "openshift-adp",
        );
        assert_eq!(mapped, Some(ObjectRef::new("db").within("team-a")));

        // unknown parent: event dropped
        pvb.metadata.labels = Some(
            [(VELERO_BACKUP_NAME_LABEL.to_string(), "unknown".to_string())]
                .into_iter()
                .collect(),
        );
        assert_eq!(
            child_to_tenant::<NonAdminBackup, Backup>(
                &pvb.metadata,
                VELERO_BACKUP_NAME_LABEL,
                &reader,
                "openshift-adp",
            ),
            None
        );
    }

    #[test]
    fn queue_shifts_on_departures_and_arrivals() {
        let mut backup = engine_backup("u1", "team-a", "db");
        assert!(backup_queue_shift(&watcher::Event::Apply(backup.clone())));

        backup.status = Some(BackupStatus {
            phase: Some("InProgress".to_string()),
            ..Default::default()
        });
        assert!(!backup_queue_shift(&watcher::Event::Apply(backup.clone())));

        backup.status.as_mut().unwrap().phase = Some("Completed".to_string());
        assert!(backup_queue_shift(&watcher::Event::Apply(backup.clone())));
        assert!(backup_queue_shift(&watcher::Event::Delete(backup)));
    }
}
