//! NonAdminRestore controller.
//!
//! Structural variant of the backup state machine: a tenant restore names a
//! NonAdminBackup in its own namespace, and the controller creates the
//! Velero Restore against that backup's engine object. Restores own no
//! stored data, so there is no graceful/direct split; API deletion removes
//! the engine restore and releases the finalizer.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tracing::*;

use crate::api::v1alpha1::{
    NonAdminBackup, NonAdminCondition, NonAdminPhase, NonAdminRestore, VeleroRestoreReference,
    NAR_FINALIZER,
};
use crate::common::constants::{
    NAC_ORIGIN_UUID_LABEL, ORIGIN_NAMESPACE_ANNOTATION, VELERO_RESTORE_NAME_LABEL,
};
use crate::common::lookup::find_engine_object_by_uuid;
use crate::common::naming::{generate_nac_uuid, non_admin_labels, origin_annotations};
use crate::common::projection::{
    list_data_downloads, list_pod_volume_restores, mirror_velero_restore, restore_queue_info,
    update_data_downloads, update_pod_volume_restores,
};
use crate::config::OperatorConfig;
use crate::controllers::{error_action, handlers, run_steps, Context, State, Step};
use crate::merge_enforced_fields;
use crate::util::errors::{Error, Result};
use crate::util::status::{
    is_status_condition_true, new_condition, set_status_condition, update_phase,
};
use crate::velero::{DataDownload, PodVolumeRestore, Restore, RestoreSpec};

const CONTROLLER: &str = "nonadminrestore";

#[instrument(skip(ctx, nar), fields(namespace = %nar.namespace().unwrap_or_default(), name = %nar.name_any()))]
pub async fn reconcile(nar: Arc<NonAdminRestore>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure(CONTROLLER);
    ctx.diagnostics.write().await.last_event = Utc::now();

    let mut nar = (*nar).clone();
    if nar.meta().deletion_timestamp.is_some() {
        run_steps!(
            mark_deleting(&ctx, &mut nar),
            delete_engine_restore(&ctx, &mut nar),
        );
    } else {
        run_steps!(
            init_phase(&ctx, &mut nar),
            validate_spec(&ctx, &mut nar),
            ensure_uuid(&ctx, &mut nar),
            ensure_finalizer(&ctx, &mut nar),
            sync_engine_restore(&ctx, &mut nar),
        );
    }
    Ok(Action::await_change())
}

fn error_policy(_nar: Arc<NonAdminRestore>, error: &Error, ctx: Arc<Context>) -> Action {
    error_action(CONTROLLER, error, &ctx)
}

fn tenant_api(ctx: &Context, nar: &NonAdminRestore) -> Result<Api<NonAdminRestore>> {
    let namespace = nar
        .namespace()
        .ok_or_else(|| Error::MetadataMissing("NonAdminRestore has no namespace".to_string()))?;
    Ok(Api::namespaced(ctx.client.clone(), &namespace))
}

async fn patch_status(ctx: &Context, nar: &NonAdminRestore) -> Result<()> {
    let api = tenant_api(ctx, nar)?;
    api.patch_status(
        &nar.name_any(),
        &PatchParams::default(),
        &Patch::Merge(json!({ "status": nar.status })),
    )
    .await
    .map_err(Error::KubeError)?;
    Ok(())
}

fn has_finalizer(nar: &NonAdminRestore) -> bool {
    nar.finalizers().iter().any(|f| f == NAR_FINALIZER)
}

async fn init_phase(ctx: &Context, nar: &mut NonAdminRestore) -> Result<Step> {
    let status = nar.status.get_or_insert_with(Default::default);
    if status.phase.is_none() && update_phase(&mut status.phase, NonAdminPhase::New) {
        patch_status(ctx, nar).await?;
    }
    Ok(Step::Continue)
}

async fn validate_spec(ctx: &Context, nar: &mut NonAdminRestore) -> Result<Step> {
    match validate_restore_spec(ctx, nar).await {
        Ok(()) => {
            let status = nar.status.get_or_insert_with(Default::default);
            let changed = set_status_condition(
                &mut status.conditions,
                new_condition(
                    NonAdminCondition::Accepted.as_str(),
                    true,
                    "RestoreAccepted",
                    "restore accepted",
                ),
            );
            if changed {
                patch_status(ctx, nar).await?;
            }
            Ok(Step::Continue)
        }
        Err(error @ Error::InvalidSpec(_)) => {
            let message = error.to_string();
            let status = nar.status.get_or_insert_with(Default::default);
            let mut changed = update_phase(&mut status.phase, NonAdminPhase::BackingOff);
            changed |= set_status_condition(
                &mut status.conditions,
                new_condition(
                    NonAdminCondition::Accepted.as_str(),
                    false,
                    "InvalidRestoreSpec",
                    &message,
                ),
            );
            if changed {
                patch_status(ctx, nar).await?;
            }
            Err(error)
        }
        Err(error) => Err(error),
    }
}

/// The named backup must be a NonAdminBackup in the tenant namespace that
/// reached `Created`, so its Velero backup name is known and valid.
async fn validate_restore_spec(ctx: &Context, nar: &NonAdminRestore) -> Result<()> {
    let namespace = nar
        .namespace()
        .ok_or_else(|| Error::MetadataMissing("NonAdminRestore has no namespace".to_string()))?;
    let spec = nar.spec.restore_spec.clone().unwrap_or_default();

    validate_restore_scope(&spec)?;

    let Some(backup_name) = nar.backup_name() else {
        return Err(Error::InvalidSpec(
            "spec.restoreSpec.backupName is required".to_string(),
        ));
    };
    let api: Api<NonAdminBackup> = Api::namespaced(ctx.client.clone(), &namespace);
    let Some(nab) = api.get_opt(backup_name).await.map_err(Error::KubeError)? else {
        return Err(Error::InvalidSpec(format!(
            "NonAdminBackup {backup_name} does not exist in namespace {namespace}"
        )));
    };
    let created = nab
        .status
        .as_ref()
        .is_some_and(|s| s.phase == Some(NonAdminPhase::Created));
    if !created || nab.nac_uuid().is_none() {
        return Err(Error::InvalidSpec(format!(
            "NonAdminBackup {backup_name} has not been created in the OADP namespace yet"
        )));
    }
    Ok(())
}

fn validate_restore_scope(spec: &RestoreSpec) -> Result<()> {
    let names_namespaces = spec
        .included_namespaces
        .as_ref()
        .is_some_and(|list| !list.is_empty())
        || spec
            .excluded_namespaces
            .as_ref()
            .is_some_and(|list| !list.is_empty());
    if names_namespaces {
        return Err(Error::InvalidSpec(
            "restore scope comes from the backup, namespaces can not be selected".to_string(),
        ));
    }
    Ok(())
}

async fn ensure_uuid(ctx: &Context, nar: &mut NonAdminRestore) -> Result<Step> {
    let api = tenant_api(ctx, nar)?;
    *nar = api.get(&nar.name_any()).await.map_err(Error::KubeError)?;

    if nar.nac_uuid().is_none() {
        let uuid = generate_nac_uuid();
        let status = nar.status.get_or_insert_with(Default::default);
        status.velero_restore = Some(VeleroRestoreReference {
            nacuuid: uuid.clone(),
            namespace: ctx.config.oadp_namespace.clone(),
            name: uuid,
            spec: None,
            status: None,
        });
        patch_status(ctx, nar).await?;
    }
    Ok(Step::Continue)
}

async fn ensure_finalizer(ctx: &Context, nar: &mut NonAdminRestore) -> Result<Step> {
    if !has_finalizer(nar) {
        let finalizers: Vec<String> = nar
            .finalizers()
            .iter()
            .cloned()
            .chain([NAR_FINALIZER.to_string()])
            .collect();
        let api = tenant_api(ctx, nar)?;
        *nar = api
            .patch(
                &nar.name_any(),
                &PatchParams::default(),
                &Patch::Merge(json!({ "metadata": { "finalizers": finalizers } })),
            )
            .await
            .map_err(Error::KubeError)?;
    }
    Ok(Step::Continue)
}

async fn sync_engine_restore(ctx: &Context, nar: &mut NonAdminRestore) -> Result<Step> {
    let namespace = nar
        .namespace()
        .ok_or_else(|| Error::MetadataMissing("NonAdminRestore has no namespace".to_string()))?;
    let uuid = nar
        .nac_uuid()
        .ok_or_else(|| Error::MetadataMissing("NAC UUID missing from status".to_string()))?
        .to_string();
    let oadp_namespace = ctx.config.oadp_namespace.clone();

    let found: Option<Restore> =
        find_engine_object_by_uuid(&ctx.client, &oadp_namespace, &uuid).await?;

    let velero_restore = match found {
        Some(restore) => {
            let origin = restore
                .annotations()
                .get(ORIGIN_NAMESPACE_ANNOTATION)
                .map(String::as_str);
            if origin != Some(namespace.as_str()) {
                let error = Error::ForeignEngineObject(format!(
                    "Velero Restore {} does not point back to namespace {namespace}",
                    restore.name_any()
                ));
                fail_with_condition(ctx, nar, "ForeignVeleroRestore", &error).await?;
                return Err(error);
            }
            restore
        }
        None => {
            let was_queued = nar.status.as_ref().is_some_and(|s| {
                s.phase == Some(NonAdminPhase::Created)
                    || is_status_condition_true(&s.conditions, NonAdminCondition::Queued.as_str())
            });
            if was_queued {
                let error = Error::EngineObjectVanished(
                    "NonAdminRestore is finalized and its Velero Restore has been removed, create a new NonAdminRestore to run another restore"
                        .to_string(),
                );
                fail_with_condition(ctx, nar, "VeleroRestoreNotFound", &error).await?;
                return Err(error);
            }

            info!("Velero Restore with NAC UUID {uuid} not found, creating one");
            let spec = build_engine_restore_spec(ctx, nar, &namespace).await?;
            let mut labels = non_admin_labels();
            labels.insert(NAC_ORIGIN_UUID_LABEL.to_string(), uuid.clone());
            let restore = Restore {
                metadata: ObjectMeta {
                    name: Some(uuid.clone()),
                    namespace: Some(oadp_namespace.clone()),
                    labels: Some(labels),
                    annotations: Some(origin_annotations(&nar.metadata)),
                    ..Default::default()
                },
                spec,
                status: None,
            };
            let api: Api<Restore> = Api::namespaced(ctx.client.clone(), &oadp_namespace);
            let created = api
                .create(&PostParams::default(), &restore)
                .await
                .map_err(Error::KubeError)?;
            info!("Velero Restore successfully created");
            created
        }
    };

    let queue_info = match restore_queue_info(&ctx.client, &oadp_namespace, &velero_restore).await {
        Ok(info) => Some(info),
        Err(error) => {
            warn!("failed to compute queue position for Velero Restore: {error}");
            None
        }
    };
    let pod_volume_restores =
        match list_pod_volume_restores(&ctx.client, &oadp_namespace, &velero_restore.name_any())
            .await
        {
            Ok(items) => Some(items),
            Err(error) => {
                warn!("failed to list PodVolumeRestores: {error}");
                None
            }
        };
    let data_downloads =
        match list_data_downloads(&ctx.client, &oadp_namespace, &velero_restore.name_any()).await {
            Ok(items) => Some(items),
            Err(error) => {
                warn!("failed to list DataDownloads: {error}");
                None
            }
        };

    let status = nar.status.get_or_insert_with(Default::default);
    let mut changed = mirror_velero_restore(status, &velero_restore);
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
            "RestoreScheduled",
            "Created Velero Restore object",
        ),
    );
    if let Some(items) = pod_volume_restores {
        changed |= update_pod_volume_restores(status, &items);
    }
    if let Some(items) = data_downloads {
        changed |= update_data_downloads(status, &items);
    }
    if changed {
        patch_status(ctx, nar).await?;
    }

    Ok(Step::Continue)
}

async fn fail_with_condition(
    ctx: &Context,
    nar: &mut NonAdminRestore,
    reason: &str,
    error: &Error,
) -> Result<()> {
    let message = error.to_string();
    let status = nar.status.get_or_insert_with(Default::default);
    let mut changed = update_phase(&mut status.phase, NonAdminPhase::BackingOff);
    changed |= set_status_condition(
        &mut status.conditions,
        new_condition(NonAdminCondition::Accepted.as_str(), false, reason, &message),
    );
    if changed {
        patch_status(ctx, nar).await?;
    }
    Ok(())
}

/// Tenant restore spec with the backup reference rewritten to the engine
/// backup name and the enforced fields layered over tenant defaults.
async fn build_engine_restore_spec(
    ctx: &Context,
    nar: &NonAdminRestore,
    namespace: &str,
) -> Result<RestoreSpec> {
    let backup_name = nar.backup_name().ok_or_else(|| {
        Error::InvalidSpec("spec.restoreSpec.backupName is required".to_string())
    })?;
    let api: Api<NonAdminBackup> = Api::namespaced(ctx.client.clone(), namespace);
    let nab = api.get(backup_name).await.map_err(Error::KubeError)?;
    let velero_backup_name = nab
        .status
        .as_ref()
        .and_then(|s| s.velero_backup.as_ref())
        .map(|vb| vb.name.clone())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            Error::InvalidSpec(format!(
                "NonAdminBackup {backup_name} has no Velero Backup associated yet"
            ))
        })?;

    Ok(compose_restore_spec(
        nar.spec.restore_spec.as_ref(),
        &ctx.config.enforced_restore_spec,
        &velero_backup_name,
    ))
}

pub(crate) fn compose_restore_spec(
    tenant: Option<&RestoreSpec>,
    enforced: &RestoreSpec,
    velero_backup_name: &str,
) -> RestoreSpec {
    let mut spec = tenant.cloned().unwrap_or_default();
    merge_enforced_fields!(
        spec,
        enforced,
        [
            included_resources,
            excluded_resources,
            label_selector,
            or_label_selectors,
            restore_pvs,
            restore_status,
            item_operation_timeout,
        ]
    );
    // the engine restore targets the bound Velero backup, never a tenant name
    spec.backup_name = velero_backup_name.to_string();
    spec.schedule_name = None;
    spec.included_namespaces = None;
    spec.excluded_namespaces = None;
    spec
}

// --- deletion --------------------------------------------------------------

async fn mark_deleting(ctx: &Context, nar: &mut NonAdminRestore) -> Result<Step> {
    let status = nar.status.get_or_insert_with(Default::default);
    let mut changed = update_phase(&mut status.phase, NonAdminPhase::Deleting);
    changed |= set_status_condition(
        &mut status.conditions,
        new_condition(
            NonAdminCondition::Deleting.as_str(),
            true,
            "DeletionPending",
            "restore accepted for deletion",
        ),
    );
    if changed {
        patch_status(ctx, nar).await?;
    }
    Ok(Step::Continue)
}

async fn delete_engine_restore(ctx: &Context, nar: &mut NonAdminRestore) -> Result<Step> {
    let Some(uuid) = nar.nac_uuid().map(str::to_string) else {
        return remove_finalizer(ctx, nar).await;
    };
    let velero_restore: Option<Restore> =
        find_engine_object_by_uuid(&ctx.client, &ctx.config.oadp_namespace, &uuid).await?;
    match velero_restore {
        Some(restore) => {
            let api: Api<Restore> =
                Api::namespaced(ctx.client.clone(), &ctx.config.oadp_namespace);
            api.delete(&restore.name_any(), &DeleteParams::default())
                .await
                .map_err(Error::KubeError)?;
            info!("Velero Restore deletion initiated");
            Ok(Step::Continue)
        }
        None => remove_finalizer(ctx, nar).await,
    }
}

async fn remove_finalizer(ctx: &Context, nar: &mut NonAdminRestore) -> Result<Step> {
    if !has_finalizer(nar) {
        return Ok(Step::Continue);
    }
    info!("Velero Restore is gone, removing NonAdminRestore finalizer");
    let finalizers: Vec<String> = nar
        .finalizers()
        .iter()
        .filter(|f| *f != NAR_FINALIZER)
        .cloned()
        .collect();
    let api = tenant_api(ctx, nar)?;
    api.patch(
        &nar.name_any(),
        &PatchParams::default(),
        &Patch::Merge(json!({ "metadata": { "finalizers": finalizers } })),
    )
    .await
    .map_err(Error::KubeError)?;
    Ok(Step::Continue)
}

// --- controller wiring -----------------------------------------------------

/// Initialize the NonAdminRestore controller (given the crd is installed)
pub async fn run(state: State, config: Arc<OperatorConfig>) {
    let client = Client::try_default()
        .await
        .expect("failed to create kube Client");

    let nars = Api::<NonAdminRestore>::all(client.clone());
    if let Err(e) = nars.list(&ListParams::default().limit(1)).await {
        error!("NonAdminRestore CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    let oadp_namespace = config.oadp_namespace.clone();
    let velero_restores: Api<Restore> = Api::namespaced(client.clone(), &oadp_namespace);
    let pod_volume_restores: Api<PodVolumeRestore> =
        Api::namespaced(client.clone(), &oadp_namespace);
    let data_downloads: Api<DataDownload> = Api::namespaced(client.clone(), &oadp_namespace);

    let (restore_store, store_writer) = reflector::store::<Restore>();
    let (queue_tx, queue_rx) = tokio::sync::mpsc::channel::<()>(16);
    let restore_events = reflector(
        store_writer,
        watcher(velero_restores.clone(), watcher::Config::default()),
    );
    tokio::spawn(async move {
        let mut events = std::pin::pin!(restore_events.default_backoff());
        while let Some(event) = events.next().await {
            let Ok(event) = event else { continue };
            if handlers::restore_queue_shift(&event) {
                let _ = queue_tx.send(()).await;
            }
        }
    });

    let pvr_store = restore_store.clone();
    let pvr_namespace = oadp_namespace.clone();
    let download_store = restore_store.clone();
    let download_namespace = oadp_namespace.clone();

    Controller::new(nars, watcher::Config::default().any_semantic())
        .watches(
            velero_restores,
            watcher::Config::default(),
            |restore: Restore| handlers::engine_to_tenant::<NonAdminRestore, _>(restore),
        )
        .watches(
            pod_volume_restores,
            watcher::Config::default(),
            move |pvr: PodVolumeRestore| {
                handlers::child_to_tenant::<NonAdminRestore, Restore>(
                    pvr.meta(),
                    VELERO_RESTORE_NAME_LABEL,
                    &pvr_store,
                    &pvr_namespace,
                )
            },
        )
        .watches(
            data_downloads,
            watcher::Config::default(),
            move |download: DataDownload| {
                handlers::child_to_tenant::<NonAdminRestore, Restore>(
                    download.meta(),
                    VELERO_RESTORE_NAME_LABEL,
                    &download_store,
                    &download_namespace,
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

    #[test]
    fn composed_restore_targets_the_engine_backup() {
        let tenant = RestoreSpec {
            backup_name: "db".to_string(),
            restore_pvs: Some(false),
            ..Default::default()
        };
        let spec = compose_restore_spec(
            Some(&tenant),
            &RestoreSpec::default(),
            "0495ba35-4b9e-47b2-9896-0f91ae125cd8",
        );
        assert_eq!(spec.backup_name, "0495ba35-4b9e-47b2-9896-0f91ae125cd8");
        assert_eq!(spec.restore_pvs, Some(false));
        assert!(spec.included_namespaces.is_none());
    }

    #[test]
    fn enforced_restore_fields_fill_defaults_only() {
        let enforced = RestoreSpec {
            restore_pvs: Some(true),
            item_operation_timeout: Some("4h".to_string()),
            ..Default::default()
        };

        let spec = compose_restore_spec(None, &enforced, "uuid");
        assert_eq!(spec.restore_pvs, Some(true));
        assert_eq!(spec.item_operation_timeout.as_deref(), Some("4h"));

        let tenant = RestoreSpec {
            backup_name: "db".to_string(),
            restore_pvs: Some(false),
            ..Default::default()
        };
        let spec = compose_restore_spec(Some(&tenant), &enforced, "uuid");
        assert_eq!(spec.restore_pvs, Some(false));
    }

    #[test]
    fn restore_scope_must_not_name_namespaces() {
        let spec = RestoreSpec {
            included_namespaces: Some(vec!["team-b".to_string()]),
            ..Default::default()
        };
        assert!(matches!(
            validate_restore_scope(&spec),
            Err(Error::InvalidSpec(_))
        ));
        assert!(validate_restore_scope(&RestoreSpec::default()).is_ok());
    }
}
