//! NonAdminBackup controller.
//!
//! Translates a tenant's NonAdminBackup into a Velero Backup in the OADP
//! namespace, keeps a status mirror flowing back, and coordinates deletion
//! across both namespaces. Each reconciliation selects one of four paths and
//! walks its steps in order; every step is idempotent and a pass performs at
//! most one status write.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType};
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tracing::*;

use crate::api::v1alpha1::{
    NonAdminBackup, NonAdminBackupStorageLocation, NonAdminCondition, NonAdminPhase,
    NonAdminRestore, VeleroBackupReference, VeleroDeleteBackupRequestReference, NAB_FINALIZER,
    NON_ADMIN_BACKUPS, NON_ADMIN_BACKUP_STORAGE_LOCATIONS, NON_ADMIN_RESTORES,
};
use crate::common::constants::{
    NAB_SYNC_LABEL, NAC_ORIGIN_UUID_LABEL, ORIGIN_NAMESPACE_ANNOTATION, VELERO_BACKUP_NAME_LABEL,
    VELERO_BACKUP_UID_LABEL,
};
use crate::common::lookup::find_engine_object_by_uuid;
use crate::common::naming::{
    generate_nac_uuid, non_admin_labels, origin_annotations, valid_label_value,
    valid_label_value_from,
};
use crate::common::projection::{
    backup_queue_info, list_data_uploads, list_pod_volume_backups, mirror_delete_backup_request,
    mirror_velero_backup, update_data_uploads, update_pod_volume_backups,
};
use crate::config::OperatorConfig;
use crate::controllers::{error_action, handlers, run_steps, Context, State, Step};
use crate::merge_enforced_fields;
use crate::util::errors::{Error, Result};
use crate::util::status::{
    is_status_condition_true, new_condition, set_status_condition, update_phase,
};
use crate::velero::{
    Backup, BackupSpec, DataUpload, DeleteBackupRequest, DeleteBackupRequestSpec, PodVolumeBackup,
};

const CONTROLLER: &str = "nonadminbackup";

/// Namespaced resources every non-admin backup must exclude, so a tenant
/// cannot back up and restore the control-plane objects themselves.
static ALWAYS_EXCLUDED_NAMESPACED_RESOURCES: &[&str] = &[
    NON_ADMIN_BACKUPS,
    NON_ADMIN_RESTORES,
    NON_ADMIN_BACKUP_STORAGE_LOCATIONS,
];

static ALWAYS_EXCLUDED_CLUSTER_RESOURCES: &[&str] = &[
    "securitycontextconstraints",
    "clusterroles",
    "clusterrolebindings",
    "priorityclasses",
    "customresourcedefinitions",
    "virtualmachineclusterinstancetypes",
    "virtualmachineclusterpreferences",
];

/// The four reconciliation paths, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconcilePath {
    /// `spec.deleteBackup` is set: remove the Velero backup and its data.
    GracefulDelete,
    /// The object was deleted through the API: clean up metadata, keep data.
    DirectDelete,
    /// A valid sync label adopts a surviving Velero backup.
    SyncImport,
    CreateOrUpdate,
}

impl ReconcilePath {
    fn select(nab: &NonAdminBackup) -> Self {
        if nab.spec.delete_backup {
            ReconcilePath::GracefulDelete
        } else if nab.meta().deletion_timestamp.is_some() {
            ReconcilePath::DirectDelete
        } else if valid_label_value_from(nab.metadata.labels.as_ref(), NAB_SYNC_LABEL).is_some() {
            ReconcilePath::SyncImport
        } else {
            ReconcilePath::CreateOrUpdate
        }
    }
}

#[instrument(skip(ctx, nab), fields(namespace = %nab.namespace().unwrap_or_default(), name = %nab.name_any()))]
pub async fn reconcile(nab: Arc<NonAdminBackup>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure(CONTROLLER);
    ctx.diagnostics.write().await.last_event = Utc::now();

    let mut nab = (*nab).clone();
    let path = ReconcilePath::select(&nab);
    debug!("executing {path:?} path");

    match path {
        ReconcilePath::GracefulDelete => {
            run_steps!(
                mark_deleting_and_request_delete(&ctx, &mut nab),
                delete_dependent_restores(&ctx, &nab),
                ensure_delete_backup_request(&ctx, &mut nab),
            );
        }
        ReconcilePath::DirectDelete => {
            run_steps!(
                mark_deleting_for_api_deletion(&ctx, &mut nab),
                cleanup_delete_backup_requests(&ctx, &nab),
                delete_engine_backup(&ctx, &mut nab),
            );
        }
        ReconcilePath::SyncImport => {
            run_steps!(
                ensure_uuid(&ctx, &mut nab),
                ensure_finalizer(&ctx, &mut nab),
                sync_engine_backup(&ctx, &mut nab, true),
            );
        }
        ReconcilePath::CreateOrUpdate => {
            run_steps!(
                init_phase(&ctx, &mut nab),
                validate_spec(&ctx, &mut nab),
                ensure_uuid(&ctx, &mut nab),
                ensure_finalizer(&ctx, &mut nab),
                sync_engine_backup(&ctx, &mut nab, false),
            );
        }
    }

    Ok(Action::await_change())
}

fn error_policy(nab: Arc<NonAdminBackup>, error: &Error, ctx: Arc<Context>) -> Action {
    debug!("error reconciling {}/{}", nab.namespace().unwrap_or_default(), nab.name_any());
    error_action(CONTROLLER, error, &ctx)
}

fn tenant_api(ctx: &Context, nab: &NonAdminBackup) -> Result<Api<NonAdminBackup>> {
    let namespace = nab
        .namespace()
        .ok_or_else(|| Error::MetadataMissing("NonAdminBackup has no namespace".to_string()))?;
    Ok(Api::namespaced(ctx.client.clone(), &namespace))
}

async fn patch_status(ctx: &Context, nab: &NonAdminBackup) -> Result<()> {
    let api = tenant_api(ctx, nab)?;
    api.patch_status(
        &nab.name_any(),
        &PatchParams::default(),
        &Patch::Merge(json!({ "status": nab.status })),
    )
    .await
    .map_err(Error::KubeError)?;
    Ok(())
}

fn has_finalizer(nab: &NonAdminBackup) -> bool {
    nab.finalizers().iter().any(|f| f == NAB_FINALIZER)
}

// --- create/update path ----------------------------------------------------

async fn init_phase(ctx: &Context, nab: &mut NonAdminBackup) -> Result<Step> {
    let status = nab.status.get_or_insert_with(Default::default);
    if status.phase.is_none() && update_phase(&mut status.phase, NonAdminPhase::New) {
        patch_status(ctx, nab).await?;
        debug!("phase initialized to New");
    }
    Ok(Step::Continue)
}

async fn validate_spec(ctx: &Context, nab: &mut NonAdminBackup) -> Result<Step> {
    match validate_backup_spec(ctx, nab).await {
        Ok(()) => {
            let status = nab.status.get_or_insert_with(Default::default);
            let changed = set_status_condition(
                &mut status.conditions,
                new_condition(
                    NonAdminCondition::Accepted.as_str(),
                    true,
                    "BackupAccepted",
                    "backup accepted",
                ),
            );
            if changed {
                patch_status(ctx, nab).await?;
            }
            Ok(Step::Continue)
        }
        Err(error @ Error::InvalidSpec(_)) => {
            let message = error.to_string();
            let status = nab.status.get_or_insert_with(Default::default);
            let mut changed = update_phase(&mut status.phase, NonAdminPhase::BackingOff);
            changed |= set_status_condition(
                &mut status.conditions,
                new_condition(
                    NonAdminCondition::Accepted.as_str(),
                    false,
                    "InvalidBackupSpec",
                    &message,
                ),
            );
            if changed {
                patch_status(ctx, nab).await?;
            }
            Err(error)
        }
        Err(error) => Err(error),
    }
}

async fn validate_backup_spec(ctx: &Context, nab: &NonAdminBackup) -> Result<()> {
    let namespace = nab
        .namespace()
        .ok_or_else(|| Error::MetadataMissing("NonAdminBackup has no namespace".to_string()))?;
    let spec = nab.spec.backup_spec.clone().unwrap_or_default();

    validate_namespace_confinement(&spec, &namespace)?;

    if let Some(location) = spec.storage_location.as_deref().filter(|l| !l.is_empty()) {
        let api: Api<NonAdminBackupStorageLocation> =
            Api::namespaced(ctx.client.clone(), &namespace);
        match api.get_opt(location).await.map_err(Error::KubeError)? {
            None => {
                return Err(Error::InvalidSpec(format!(
                    "NonAdminBackupStorageLocation {location} does not exist in namespace {namespace}"
                )))
            }
            Some(nabsl) if nabsl.velero_bsl_name().is_none() => {
                return Err(Error::InvalidSpec(format!(
                    "NonAdminBackupStorageLocation {location} is not ready for use: no Velero BackupStorageLocation associated yet"
                )))
            }
            Some(_) => {}
        }
    }

    Ok(())
}

fn validate_namespace_confinement(spec: &BackupSpec, namespace: &str) -> Result<()> {
    if let Some(included) = &spec.included_namespaces {
        if included.iter().any(|ns| ns != namespace) {
            return Err(Error::InvalidSpec(format!(
                "spec.backupSpec.includedNamespaces can not contain namespaces other than {namespace}"
            )));
        }
    }
    if let Some(excluded) = &spec.excluded_namespaces {
        if !excluded.is_empty() {
            return Err(Error::InvalidSpec(
                "spec.backupSpec.excludedNamespaces is not allowed on non-admin backups"
                    .to_string(),
            ));
        }
    }
    Ok(())
}

/// Stamps the NAC UUID into status, exactly once. The cached object may be
/// stale right after a status write, so the latest version is fetched first.
async fn ensure_uuid(ctx: &Context, nab: &mut NonAdminBackup) -> Result<Step> {
    let api = tenant_api(ctx, nab)?;
    *nab = api.get(&nab.name_any()).await.map_err(Error::KubeError)?;

    if nab.nac_uuid().is_none() {
        let uuid = valid_label_value_from(nab.metadata.labels.as_ref(), NAB_SYNC_LABEL)
            .map(str::to_string)
            .unwrap_or_else(generate_nac_uuid);
        let status = nab.status.get_or_insert_with(Default::default);
        status.velero_backup = Some(VeleroBackupReference {
            nacuuid: uuid.clone(),
            namespace: ctx.config.oadp_namespace.clone(),
            name: uuid,
            spec: None,
            status: None,
        });
        patch_status(ctx, nab).await?;
        debug!("status updated with Velero Backup UUID reference");
    }
    Ok(Step::Continue)
}

/// The finalizer goes on before the Velero backup is created, so a crash
/// between the two writes can never orphan an engine object.
async fn ensure_finalizer(ctx: &Context, nab: &mut NonAdminBackup) -> Result<Step> {
    if !has_finalizer(nab) {
        let finalizers: Vec<String> = nab
            .finalizers()
            .iter()
            .cloned()
            .chain([NAB_FINALIZER.to_string()])
            .collect();
        let api = tenant_api(ctx, nab)?;
        *nab = api
            .patch(
                &nab.name_any(),
                &PatchParams::default(),
                &Patch::Merge(json!({ "metadata": { "finalizers": finalizers } })),
            )
            .await
            .map_err(Error::KubeError)?;
        debug!("finalizer added");
    }
    Ok(Step::Continue)
}

/// Creates or adopts the Velero backup, then projects engine state into the
/// tenant status. With `sync_only` the step refuses to create: adoption of an
/// existing backup is the whole point of the sync path.
async fn sync_engine_backup(ctx: &Context, nab: &mut NonAdminBackup, sync_only: bool) -> Result<Step> {
    let namespace = nab
        .namespace()
        .ok_or_else(|| Error::MetadataMissing("NonAdminBackup has no namespace".to_string()))?;
    let uuid = nab
        .nac_uuid()
        .ok_or_else(|| Error::MetadataMissing("NAC UUID missing from status".to_string()))?
        .to_string();
    let oadp_namespace = ctx.config.oadp_namespace.clone();

    let found: Option<Backup> =
        find_engine_object_by_uuid(&ctx.client, &oadp_namespace, &uuid).await?;

    let velero_backup = match found {
        Some(backup) => {
            // an engine object bound to us but pointing at another tenant
            // namespace is foreign; never reconcile against it
            let origin = backup
                .annotations()
                .get(ORIGIN_NAMESPACE_ANNOTATION)
                .map(String::as_str);
            if origin != Some(namespace.as_str()) {
                let error = Error::ForeignEngineObject(format!(
                    "Velero Backup {} does not point back to namespace {namespace}",
                    backup.name_any()
                ));
                fail_with_condition(ctx, nab, "ForeignVeleroBackup", &error).await?;
                return Err(error);
            }
            backup
        }
        None => {
            let was_queued = nab.status.as_ref().is_some_and(|s| {
                s.phase == Some(NonAdminPhase::Created)
                    || is_status_condition_true(&s.conditions, NonAdminCondition::Queued.as_str())
            });
            if sync_only {
                let error = Error::SyncTargetMissing(format!(
                    "Velero Backup with NAC UUID {uuid} to adopt does not exist in {oadp_namespace}"
                ));
                fail_with_condition(ctx, nab, "VeleroBackupNotFound", &error).await?;
                return Err(error);
            }
            if was_queued {
                // never silently re-run a backup the user already saw queued
                let error = Error::EngineObjectVanished(
                    "NonAdminBackup is finalized and its Velero Backup has been removed, create a new NonAdminBackup to run another backup"
                        .to_string(),
                );
                fail_with_condition(ctx, nab, "VeleroBackupNotFound", &error).await?;
                return Err(error);
            }

            info!("Velero Backup with NAC UUID {uuid} not found, creating one");
            let spec = build_engine_backup_spec(ctx, nab, &namespace).await?;
            let mut labels = non_admin_labels();
            labels.insert(NAC_ORIGIN_UUID_LABEL.to_string(), uuid.clone());
            let backup = Backup {
                metadata: ObjectMeta {
                    name: Some(uuid.clone()),
                    namespace: Some(oadp_namespace.clone()),
                    labels: Some(labels),
                    annotations: Some(origin_annotations(&nab.metadata)),
                    ..Default::default()
                },
                spec,
                status: None,
            };
            let api: Api<Backup> = Api::namespaced(ctx.client.clone(), &oadp_namespace);
            // the UUID name is unique, a conflict here is a real error
            let created = api
                .create(&PostParams::default(), &backup)
                .await
                .map_err(Error::KubeError)?;
            info!("Velero Backup successfully created");
            created
        }
    };

    // best-effort projections: a failed lookup is logged and the remaining
    // status still goes out this pass
    let queue_info = match backup_queue_info(&ctx.client, &oadp_namespace, &velero_backup).await {
        Ok(info) => Some(info),
        Err(error) => {
            warn!("failed to compute queue position for Velero Backup: {error}");
            None
        }
    };
    let pod_volume_backups =
        match list_pod_volume_backups(&ctx.client, &oadp_namespace, &velero_backup.name_any()).await
        {
            Ok(items) => Some(items),
            Err(error) => {
                warn!("failed to list PodVolumeBackups: {error}");
                None
            }
        };
    let data_uploads =
        match list_data_uploads(&ctx.client, &oadp_namespace, &velero_backup.name_any()).await {
            Ok(items) => Some(items),
            Err(error) => {
                warn!("failed to list DataUploads: {error}");
                None
            }
        };

    let status = nab.status.get_or_insert_with(Default::default);
    let mut changed = mirror_velero_backup(status, &velero_backup);
    if let Some(info) = queue_info {
        if status.queue_info.as_ref() != Some(&info) {
            status.queue_info = Some(info);
            changed = true;
        }
    }
    changed |= update_phase(&mut status.phase, NonAdminPhase::Created);
    changed |= set_status_condition(
        &mut status.conditions,
        new_condition(
            NonAdminCondition::Queued.as_str(),
            true,
            "BackupScheduled",
            "Created Velero Backup object",
        ),
    );
    if let Some(items) = pod_volume_backups {
        changed |= update_pod_volume_backups(status, &items);
    }
    if let Some(items) = data_uploads {
        changed |= update_data_uploads(status, &items);
    }
    if changed {
        patch_status(ctx, nab).await?;
    }

    Ok(Step::Continue)
}

/// Records a terminal failure on the object before the error propagates.
async fn fail_with_condition(
    ctx: &Context,
    nab: &mut NonAdminBackup,
    reason: &str,
    error: &Error,
) -> Result<()> {
    let message = error.to_string();
    let status = nab.status.get_or_insert_with(Default::default);
    let mut changed = update_phase(&mut status.phase, NonAdminPhase::BackingOff);
    changed |= set_status_condition(
        &mut status.conditions,
        new_condition(NonAdminCondition::Accepted.as_str(), false, reason, &message),
    );
    if changed {
        patch_status(ctx, nab).await?;
    }
    Ok(())
}

/// Tenant spec merged with the enforced spec, confined to the tenant
/// namespace, with the control-plane resources excluded. Pure except for the
/// storage location, which resolves through the tenant's promoted BSL.
async fn build_engine_backup_spec(
    ctx: &Context,
    nab: &NonAdminBackup,
    namespace: &str,
) -> Result<BackupSpec> {
    let mut spec = compose_backup_spec(
        nab.spec.backup_spec.as_ref(),
        &ctx.config.enforced_backup_spec,
        namespace,
    );

    if let Some(location) = spec.storage_location.clone().filter(|l| !l.is_empty()) {
        let api: Api<NonAdminBackupStorageLocation> =
            Api::namespaced(ctx.client.clone(), namespace);
        let nabsl = api.get(&location).await.map_err(Error::KubeError)?;
        let velero_name = nabsl.velero_bsl_name().ok_or_else(|| {
            Error::InvalidSpec(format!(
                "NonAdminBackupStorageLocation {location} is not ready for use: no Velero BackupStorageLocation associated yet"
            ))
        })?;
        spec.storage_location = Some(velero_name.to_string());
    }

    Ok(spec)
}

pub(crate) fn compose_backup_spec(
    tenant: Option<&BackupSpec>,
    enforced: &BackupSpec,
    namespace: &str,
) -> BackupSpec {
    let mut spec = tenant.cloned().unwrap_or_default();
    merge_enforced_backup_spec(&mut spec, enforced);
    // the scope of a non-admin backup is exactly the tenant namespace,
    // regardless of what tenant or admin asked for
    spec.included_namespaces = Some(vec![namespace.to_string()]);
    spec.excluded_namespaces = None;
    apply_resource_exclusions(&mut spec);
    spec
}

fn merge_enforced_backup_spec(spec: &mut BackupSpec, enforced: &BackupSpec) {
    merge_enforced_fields!(
        spec,
        enforced,
        [
            included_resources,
            excluded_resources,
            included_cluster_scoped_resources,
            excluded_cluster_scoped_resources,
            included_namespace_scoped_resources,
            excluded_namespace_scoped_resources,
            label_selector,
            or_label_selectors,
            snapshot_volumes,
            include_cluster_resources,
            default_volumes_to_fs_backup,
            snapshot_move_data,
            datamover,
            ttl,
            storage_location,
            volume_snapshot_locations,
            csi_snapshot_timeout,
            item_operation_timeout,
        ]
    );
}

/// Appends the control-plane resources to the exclusion lists, preferring
/// the scoped vectors whenever the spec already uses scoped filtering.
fn apply_resource_exclusions(spec: &mut BackupSpec) {
    let uses_scoped_filters = [
        &spec.included_cluster_scoped_resources,
        &spec.excluded_cluster_scoped_resources,
        &spec.included_namespace_scoped_resources,
        &spec.excluded_namespace_scoped_resources,
    ]
    .iter()
    .any(|filter| filter.as_ref().is_some_and(|list| !list.is_empty()));

    if uses_scoped_filters {
        spec.excluded_namespace_scoped_resources
            .get_or_insert_with(Vec::new)
            .extend(ALWAYS_EXCLUDED_NAMESPACED_RESOURCES.iter().map(|r| r.to_string()));
        spec.excluded_cluster_scoped_resources
            .get_or_insert_with(Vec::new)
            .extend(ALWAYS_EXCLUDED_CLUSTER_RESOURCES.iter().map(|r| r.to_string()));
    } else {
        let excluded = spec.excluded_resources.get_or_insert_with(Vec::new);
        excluded.extend(ALWAYS_EXCLUDED_NAMESPACED_RESOURCES.iter().map(|r| r.to_string()));
        excluded.extend(ALWAYS_EXCLUDED_CLUSTER_RESOURCES.iter().map(|r| r.to_string()));
    }
}

// --- graceful-delete path --------------------------------------------------

async fn mark_deleting_and_request_delete(ctx: &Context, nab: &mut NonAdminBackup) -> Result<Step> {
    let status = nab.status.get_or_insert_with(Default::default);
    let mut changed = update_phase(&mut status.phase, NonAdminPhase::Deleting);
    changed |= set_status_condition(
        &mut status.conditions,
        new_condition(
            NonAdminCondition::Deleting.as_str(),
            true,
            "DeletionPending",
            "backup accepted for deletion",
        ),
    );
    if changed {
        patch_status(ctx, nab).await?;
    }

    if nab.meta().deletion_timestamp.is_none() {
        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone());
        if let Err(error) = recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: "DeleteRequested".into(),
                    note: Some(format!(
                        "Delete `{}` together with its backed up data",
                        nab.name_any()
                    )),
                    action: "Deleting".into(),
                    secondary: None,
                },
                &nab.object_ref(&()),
            )
            .await
        {
            warn!("failed to publish deletion event: {error}");
        }

        let api = tenant_api(ctx, nab)?;
        api.delete(&nab.name_any(), &DeleteParams::default())
            .await
            .map_err(Error::KubeError)?;
        // the finalizer holds the object; requeue to observe the timestamp
        return Ok(Step::Requeue);
    }
    Ok(Step::Continue)
}

/// A backup scheduled for data deletion takes its dependent restores along.
async fn delete_dependent_restores(ctx: &Context, nab: &NonAdminBackup) -> Result<Step> {
    let namespace = nab
        .namespace()
        .ok_or_else(|| Error::MetadataMissing("NonAdminBackup has no namespace".to_string()))?;
    let api: Api<NonAdminRestore> = Api::namespaced(ctx.client.clone(), &namespace);
    let restores = api
        .list(&ListParams::default())
        .await
        .map_err(Error::KubeError)?;
    for restore in restores.items {
        if restore.backup_name() == Some(nab.name_any().as_str()) {
            api.delete(&restore.name_any(), &DeleteParams::default())
                .await
                .map_err(Error::KubeError)?;
            info!("deleted dependent NonAdminRestore {}", restore.name_any());
        }
    }
    Ok(Step::Continue)
}

async fn ensure_delete_backup_request(ctx: &Context, nab: &mut NonAdminBackup) -> Result<Step> {
    if !has_finalizer(nab) {
        return Ok(Step::Continue);
    }
    let Some(uuid) = nab.nac_uuid().map(str::to_string) else {
        return Ok(Step::Continue);
    };
    let oadp_namespace = ctx.config.oadp_namespace.clone();

    let velero_backup: Option<Backup> =
        find_engine_object_by_uuid(&ctx.client, &oadp_namespace, &uuid).await?;
    let Some(velero_backup) = velero_backup else {
        // the engine already removed the backup; nothing left to guard
        return remove_finalizer(ctx, nab).await;
    };

    let existing: Option<DeleteBackupRequest> =
        find_engine_object_by_uuid(&ctx.client, &oadp_namespace, &uuid).await?;
    let request = match existing {
        Some(request) => request,
        None => create_delete_backup_request(ctx, nab, &velero_backup, &uuid).await?,
    };

    let status = nab.status.get_or_insert_with(Default::default);
    let mut changed = false;
    let recorded = status
        .velero_delete_backup_request
        .as_ref()
        .map(|r| r.name.clone());
    if recorded.as_deref() != Some(request.name_any().as_str()) {
        status.velero_delete_backup_request = Some(VeleroDeleteBackupRequestReference {
            nacuuid: uuid,
            namespace: oadp_namespace,
            name: request.name_any(),
            status: None,
        });
        changed = true;
    }
    changed |= mirror_delete_backup_request(status, &request);
    if changed {
        patch_status(ctx, nab).await?;
    }
    Ok(Step::Continue)
}

async fn create_delete_backup_request(
    ctx: &Context,
    nab: &NonAdminBackup,
    velero_backup: &Backup,
    uuid: &str,
) -> Result<DeleteBackupRequest> {
    let backup_name = velero_backup.name_any();
    let mut labels = non_admin_labels();
    labels.insert(NAC_ORIGIN_UUID_LABEL.to_string(), uuid.to_string());
    labels.insert(
        VELERO_BACKUP_NAME_LABEL.to_string(),
        valid_label_value(&backup_name),
    );
    labels.insert(
        VELERO_BACKUP_UID_LABEL.to_string(),
        velero_backup.meta().uid.clone().unwrap_or_default(),
    );

    let request = DeleteBackupRequest {
        metadata: ObjectMeta {
            generate_name: Some(format!("{backup_name}-")),
            namespace: Some(ctx.config.oadp_namespace.clone()),
            labels: Some(labels),
            annotations: Some(origin_annotations(&nab.metadata)),
            ..Default::default()
        },
        spec: DeleteBackupRequestSpec {
            backup_name: backup_name.clone(),
        },
        status: None,
    };

    let api: Api<DeleteBackupRequest> =
        Api::namespaced(ctx.client.clone(), &ctx.config.oadp_namespace);
    let mut attempts = 0;
    loop {
        match api.create(&PostParams::default(), &request).await {
            Ok(created) => {
                info!("request to delete Velero Backup {backup_name} submitted");
                return Ok(created);
            }
            // generateName can collide under load; retry with a fresh suffix
            Err(kube::Error::Api(response)) if response.code == 409 && attempts < 5 => {
                attempts += 1;
            }
            Err(error) => return Err(Error::KubeError(error)),
        }
    }
}

async fn remove_finalizer(ctx: &Context, nab: &mut NonAdminBackup) -> Result<Step> {
    info!("Velero Backup is gone, removing NonAdminBackup finalizer");
    let finalizers: Vec<String> = nab
        .finalizers()
        .iter()
        .filter(|f| *f != NAB_FINALIZER)
        .cloned()
        .collect();
    let api = tenant_api(ctx, nab)?;
    api.patch(
        &nab.name_any(),
        &PatchParams::default(),
        &Patch::Merge(json!({ "metadata": { "finalizers": finalizers } })),
    )
    .await
    .map_err(Error::KubeError)?;
    Ok(Step::Continue)
}

// --- direct-delete path ----------------------------------------------------

async fn mark_deleting_for_api_deletion(ctx: &Context, nab: &mut NonAdminBackup) -> Result<Step> {
    let status = nab.status.get_or_insert_with(Default::default);
    let mut changed = update_phase(&mut status.phase, NonAdminPhase::Deleting);
    changed |= set_status_condition(
        &mut status.conditions,
        new_condition(
            NonAdminCondition::Deleting.as_str(),
            true,
            "DeletionPending",
            "permanent backup deletion requires setting spec.deleteBackup to true",
        ),
    );
    if changed {
        patch_status(ctx, nab).await?;
    }
    Ok(Step::Continue)
}

/// Clears a half-finished graceful delete: an in-flight DeleteBackupRequest
/// would otherwise remove the stored data this path is meant to keep.
async fn cleanup_delete_backup_requests(ctx: &Context, nab: &NonAdminBackup) -> Result<Step> {
    let Some(uuid) = nab.nac_uuid() else {
        return Ok(Step::Continue);
    };
    let request: Option<DeleteBackupRequest> =
        find_engine_object_by_uuid(&ctx.client, &ctx.config.oadp_namespace, uuid).await?;
    if let Some(request) = request {
        let api: Api<DeleteBackupRequest> =
            Api::namespaced(ctx.client.clone(), &ctx.config.oadp_namespace);
        api.delete(&request.name_any(), &DeleteParams::default())
            .await
            .map_err(Error::KubeError)?;
        info!("deleted in-flight DeleteBackupRequest {}", request.name_any());
    }
    Ok(Step::Continue)
}

/// Removes the Velero Backup object only. The engine treats a direct delete
/// as metadata removal; the stored data stays in the bucket.
async fn delete_engine_backup(ctx: &Context, nab: &mut NonAdminBackup) -> Result<Step> {
    let Some(uuid) = nab.nac_uuid().map(str::to_string) else {
        // no binding was ever recorded, nothing blocks the deletion
        return remove_finalizer(ctx, nab).await;
    };
    let velero_backup: Option<Backup> =
        find_engine_object_by_uuid(&ctx.client, &ctx.config.oadp_namespace, &uuid).await?;
    match velero_backup {
        Some(backup) => {
            let api: Api<Backup> =
                Api::namespaced(ctx.client.clone(), &ctx.config.oadp_namespace);
            api.delete(&backup.name_any(), &DeleteParams::default())
                .await
                .map_err(Error::KubeError)?;
            info!("Velero Backup deletion initiated, keeping backed up data");
            Ok(Step::Continue)
        }
        None => remove_finalizer(ctx, nab).await,
    }
}

// --- controller wiring -----------------------------------------------------

/// Initialize the NonAdminBackup controller (given the crd is installed)
pub async fn run(state: State, config: Arc<OperatorConfig>) {
    let client = Client::try_default()
        .await
        .expect("failed to create kube Client");

    let nabs = Api::<NonAdminBackup>::all(client.clone());
    if let Err(e) = nabs.list(&ListParams::default().limit(1)).await {
        error!("NonAdminBackup CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    let oadp_namespace = config.oadp_namespace.clone();
    let velero_backups: Api<Backup> = Api::namespaced(client.clone(), &oadp_namespace);
    let pod_volume_backups: Api<PodVolumeBackup> = Api::namespaced(client.clone(), &oadp_namespace);
    let data_uploads: Api<DataUpload> = Api::namespaced(client.clone(), &oadp_namespace);

    // One watch on Velero backups feeds both the store backing the
    // child-event mappers and the queue-shift trigger re-enqueueing every
    // tenant backup when positions can move.
    let (backup_store, store_writer) = reflector::store::<Backup>();
    let (queue_tx, queue_rx) = tokio::sync::mpsc::channel::<()>(16);
    let backup_events = reflector(
        store_writer,
        watcher(velero_backups.clone(), watcher::Config::default()),
    );
    tokio::spawn(async move {
        let mut events = std::pin::pin!(backup_events.default_backoff());
        while let Some(event) = events.next().await {
            let Ok(event) = event else { continue };
            if handlers::backup_queue_shift(&event) {
                let _ = queue_tx.send(()).await;
            }
        }
    });

    let pvb_store = backup_store.clone();
    let pvb_namespace = oadp_namespace.clone();
    let upload_store = backup_store.clone();
    let upload_namespace = oadp_namespace.clone();

    Controller::new(nabs, watcher::Config::default().any_semantic())
        .watches(
            velero_backups,
            watcher::Config::default(),
            |backup: Backup| handlers::engine_to_tenant::<NonAdminBackup, _>(backup),
        )
        .watches(
            pod_volume_backups,
            watcher::Config::default(),
            move |pvb: PodVolumeBackup| {
                handlers::child_to_tenant::<NonAdminBackup, Backup>(
                    pvb.meta(),
                    VELERO_BACKUP_NAME_LABEL,
                    &pvb_store,
                    &pvb_namespace,
                )
            },
        )
        .watches(
            data_uploads,
            watcher::Config::default(),
            move |upload: DataUpload| {
                handlers::child_to_tenant::<NonAdminBackup, Backup>(
                    upload.meta(),
                    VELERO_BACKUP_NAME_LABEL,
                    &upload_store,
                    &upload_namespace,
                )
            },
        )
        .reconcile_all_on(ReceiverStream::new(queue_rx))
        .shutdown_on_signal()
        .run(reconcile, error_policy, state.to_context(client, config))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn nab(namespace: &str, name: &str) -> NonAdminBackup {
        let mut nab = NonAdminBackup::new(name, Default::default());
        nab.metadata.namespace = Some(namespace.to_string());
        nab
    }

    #[test]
    fn path_precedence() {
        let mut backup = nab("team-a", "db");
        assert_eq!(ReconcilePath::select(&backup), ReconcilePath::CreateOrUpdate);

        backup.metadata.labels = Some(
            [(NAB_SYNC_LABEL.to_string(), "0495ba35-4b9e".to_string())]
                .into_iter()
                .collect(),
        );
        assert_eq!(ReconcilePath::select(&backup), ReconcilePath::SyncImport);

        backup.metadata.deletion_timestamp = Some(Time(Utc::now()));
        assert_eq!(ReconcilePath::select(&backup), ReconcilePath::DirectDelete);

        // deleteBackup wins over everything else
        backup.spec.delete_backup = true;
        assert_eq!(ReconcilePath::select(&backup), ReconcilePath::GracefulDelete);
    }

    #[test]
    fn malformed_sync_label_falls_back_to_create() {
        let mut backup = nab("team-a", "db");
        backup.metadata.labels = Some(
            [(NAB_SYNC_LABEL.to_string(), "-not a label-".to_string())]
                .into_iter()
                .collect(),
        );
        assert_eq!(ReconcilePath::select(&backup), ReconcilePath::CreateOrUpdate);
    }

    #[test]
    fn composed_spec_is_confined_to_the_tenant_namespace() {
        let tenant = BackupSpec {
            included_namespaces: Some(vec!["team-a".to_string()]),
            ttl: Some("24h".to_string()),
            ..Default::default()
        };
        let spec = compose_backup_spec(Some(&tenant), &BackupSpec::default(), "team-a");
        assert_eq!(spec.included_namespaces, Some(vec!["team-a".to_string()]));
        assert_eq!(spec.ttl.as_deref(), Some("24h"));

        // even an admin-enforced namespace list is overridden
        let enforced = BackupSpec {
            included_namespaces: Some(vec!["prod".to_string()]),
            ..Default::default()
        };
        let spec = compose_backup_spec(None, &enforced, "team-b");
        assert_eq!(spec.included_namespaces, Some(vec!["team-b".to_string()]));
    }

    #[test]
    fn enforced_fields_fill_tenant_defaults_only() {
        let enforced = BackupSpec {
            ttl: Some("72h".to_string()),
            snapshot_move_data: Some(true),
            ..Default::default()
        };

        // tenant omitted ttl: enforced value wins
        let spec = compose_backup_spec(None, &enforced, "team-a");
        assert_eq!(spec.ttl.as_deref(), Some("72h"));
        assert_eq!(spec.snapshot_move_data, Some(true));

        // tenant set ttl: tenant value survives
        let tenant = BackupSpec {
            ttl: Some("1h".to_string()),
            ..Default::default()
        };
        let spec = compose_backup_spec(Some(&tenant), &enforced, "team-a");
        assert_eq!(spec.ttl.as_deref(), Some("1h"));
    }

    #[test]
    fn exclusions_use_the_legacy_vector_by_default() {
        let spec = compose_backup_spec(None, &BackupSpec::default(), "team-a");
        let excluded = spec.excluded_resources.unwrap();
        assert!(excluded.contains(&NON_ADMIN_BACKUPS.to_string()));
        assert!(excluded.contains(&NON_ADMIN_RESTORES.to_string()));
        assert!(excluded.contains(&NON_ADMIN_BACKUP_STORAGE_LOCATIONS.to_string()));
        assert!(excluded.contains(&"clusterroles".to_string()));
        assert!(spec.excluded_namespace_scoped_resources.is_none());
    }

    #[test]
    fn exclusions_prefer_scoped_vectors_when_scoped_filters_are_used() {
        let tenant = BackupSpec {
            included_namespace_scoped_resources: Some(vec!["deployments".to_string()]),
            ..Default::default()
        };
        let spec = compose_backup_spec(Some(&tenant), &BackupSpec::default(), "team-a");
        assert!(spec.excluded_resources.is_none());
        assert!(spec
            .excluded_namespace_scoped_resources
            .unwrap()
            .contains(&NON_ADMIN_BACKUPS.to_string()));
        assert!(spec
            .excluded_cluster_scoped_resources
            .unwrap()
            .contains(&"customresourcedefinitions".to_string()));
    }

    #[test]
    fn namespace_confinement_rejects_foreign_namespaces() {
        let spec = BackupSpec {
            included_namespaces: Some(vec!["team-b".to_string()]),
            ..Default::default()
        };
        assert!(matches!(
            validate_namespace_confinement(&spec, "team-a"),
            Err(Error::InvalidSpec(_))
        ));

        let spec = BackupSpec {
            included_namespaces: Some(vec!["team-a".to_string()]),
            ..Default::default()
        };
        assert!(validate_namespace_confinement(&spec, "team-a").is_ok());
        assert!(validate_namespace_confinement(&BackupSpec::default(), "team-a").is_ok());
    }
}
