//! NonAdminDownloadRequest controller.
//!
//! Smallest of the variants: resolves the tenant's target to the bound
//! Velero object, creates an engine DownloadRequest for it, and mirrors the
//! signed URL back. DownloadRequests expire server-side and guard no stored
//! data, so there is no finalizer; an expired engine request is simply
//! recreated on the next pass.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use tracing::*;

use crate::api::v1alpha1::{
    NonAdminBackup, NonAdminCondition, NonAdminDownloadRequest, NonAdminPhase, NonAdminRestore,
    VeleroDownloadRequestReference,
};
use crate::common::constants::{NAC_ORIGIN_UUID_LABEL, ORIGIN_NAMESPACE_ANNOTATION};
use crate::common::lookup::find_engine_object_by_uuid;
use crate::common::naming::{generate_nac_uuid, non_admin_labels, origin_annotations};
use crate::common::projection::mirror_velero_download_request;
use crate::config::OperatorConfig;
use crate::controllers::{error_action, handlers, run_steps, Context, State, Step};
use crate::util::errors::{Error, Result};
use crate::util::status::{new_condition, set_status_condition, update_phase};
use crate::velero::{DownloadRequest, DownloadRequestSpec, DownloadTarget};

const CONTROLLER: &str = "nonadmindownloadrequest";

static BACKUP_TARGET_KINDS: &[&str] = &[
    "BackupLog",
    "BackupContents",
    "BackupVolumeSnapshots",
    "BackupItemOperations",
    "BackupResults",
    "CSIBackupVolumeSnapshots",
    "CSIBackupVolumeSnapshotContents",
];

static RESTORE_TARGET_KINDS: &[&str] = &["RestoreLog", "RestoreResults", "RestoreItemOperations"];

#[instrument(skip(ctx, nadr), fields(namespace = %nadr.namespace().unwrap_or_default(), name = %nadr.name_any()))]
pub async fn reconcile(nadr: Arc<NonAdminDownloadRequest>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure(CONTROLLER);
    ctx.diagnostics.write().await.last_event = Utc::now();

    let mut nadr = (*nadr).clone();
    if nadr.meta().deletion_timestamp.is_some() {
        // no finalizer and no stored data: the engine request expires on its own
        return Ok(Action::await_change());
    }
    run_steps!(
        init_phase(&ctx, &mut nadr),
        validate_spec(&ctx, &mut nadr),
        ensure_uuid(&ctx, &mut nadr),
        sync_engine_download_request(&ctx, &mut nadr),
    );
    Ok(Action::await_change())
}

fn error_policy(_nadr: Arc<NonAdminDownloadRequest>, error: &Error, ctx: Arc<Context>) -> Action {
    error_action(CONTROLLER, error, &ctx)
}

fn tenant_api(ctx: &Context, nadr: &NonAdminDownloadRequest) -> Result<Api<NonAdminDownloadRequest>> {
    let namespace = nadr.namespace().ok_or_else(|| {
        Error::MetadataMissing("NonAdminDownloadRequest has no namespace".to_string())
    })?;
    Ok(Api::namespaced(ctx.client.clone(), &namespace))
}

async fn patch_status(ctx: &Context, nadr: &NonAdminDownloadRequest) -> Result<()> {
    let api = tenant_api(ctx, nadr)?;
    api.patch_status(
        &nadr.name_any(),
        &PatchParams::default(),
        &Patch::Merge(json!({ "status": nadr.status })),
    )
    .await
    .map_err(Error::KubeError)?;
    Ok(())
}

async fn init_phase(ctx: &Context, nadr: &mut NonAdminDownloadRequest) -> Result<Step> {
    let status = nadr.status.get_or_insert_with(Default::default);
    if status.phase.is_none() && update_phase(&mut status.phase, NonAdminPhase::New) {
        patch_status(ctx, nadr).await?;
    }
    Ok(Step::Continue)
}

async fn validate_spec(ctx: &Context, nadr: &mut NonAdminDownloadRequest) -> Result<Step> {
    match resolve_target(ctx, nadr).await {
        Ok(_) => {
            let status = nadr.status.get_or_insert_with(Default::default);
            let changed = set_status_condition(
                &mut status.conditions,
                new_condition(
                    NonAdminCondition::Accepted.as_str(),
                    true,
                    "DownloadRequestAccepted",
                    "download request accepted",
                ),
            );
            if changed {
                patch_status(ctx, nadr).await?;
            }
            Ok(Step::Continue)
        }
        Err(error @ Error::InvalidSpec(_)) => {
            let message = error.to_string();
            let status = nadr.status.get_or_insert_with(Default::default);
            let mut changed = update_phase(&mut status.phase, NonAdminPhase::BackingOff);
            changed |= set_status_condition(
                &mut status.conditions,
                new_condition(
                    NonAdminCondition::Accepted.as_str(),
                    false,
                    "InvalidDownloadRequestSpec",
                    &message,
                ),
            );
            if changed {
                patch_status(ctx, nadr).await?;
            }
            Err(error)
        }
        Err(error) => Err(error),
    }
}

fn validate_target_kind(kind: &str) -> Result<()> {
    if !BACKUP_TARGET_KINDS.contains(&kind) && !RESTORE_TARGET_KINDS.contains(&kind) {
        return Err(Error::InvalidSpec(format!(
            "spec.target.kind {kind} is not a downloadable artifact"
        )));
    }
    Ok(())
}

/// Maps the tenant-facing target name (a NonAdminBackup or NonAdminRestore)
/// to the bound Velero object name.
async fn resolve_target(ctx: &Context, nadr: &NonAdminDownloadRequest) -> Result<String> {
    let namespace = nadr.namespace().ok_or_else(|| {
        Error::MetadataMissing("NonAdminDownloadRequest has no namespace".to_string())
    })?;
    let target = &nadr.spec.target;
    validate_target_kind(&target.kind)?;
    if target.name.is_empty() {
        return Err(Error::InvalidSpec("spec.target.name is required".to_string()));
    }

    if nadr.targets_restore() {
        let api: Api<NonAdminRestore> = Api::namespaced(ctx.client.clone(), &namespace);
        let Some(nar) = api.get_opt(&target.name).await.map_err(Error::KubeError)? else {
            return Err(Error::InvalidSpec(format!(
                "NonAdminRestore {} does not exist in namespace {namespace}",
                target.name
            )));
        };
        nar.status
            .as_ref()
            .and_then(|s| s.velero_restore.as_ref())
            .map(|vr| vr.name.clone())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                Error::InvalidSpec(format!(
                    "NonAdminRestore {} has no Velero Restore associated yet",
                    target.name
                ))
            })
    } else {
        let api: Api<NonAdminBackup> = Api::namespaced(ctx.client.clone(), &namespace);
        let Some(nab) = api.get_opt(&target.name).await.map_err(Error::KubeError)? else {
            return Err(Error::InvalidSpec(format!(
                "NonAdminBackup {} does not exist in namespace {namespace}",
                target.name
            )));
        };
        nab.status
            .as_ref()
            .and_then(|s| s.velero_backup.as_ref())
            .map(|vb| vb.name.clone())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                Error::InvalidSpec(format!(
                    "NonAdminBackup {} has no Velero Backup associated yet",
                    target.name
                ))
            })
    }
}

async fn ensure_uuid(ctx: &Context, nadr: &mut NonAdminDownloadRequest) -> Result<Step> {
    let api = tenant_api(ctx, nadr)?;
    *nadr = api.get(&nadr.name_any()).await.map_err(Error::KubeError)?;

    if nadr.nac_uuid().is_none() {
        let uuid = generate_nac_uuid();
        let status = nadr.status.get_or_insert_with(Default::default);
        status.velero_download_request = Some(VeleroDownloadRequestReference {
            nacuuid: uuid.clone(),
            namespace: ctx.config.oadp_namespace.clone(),
            name: uuid,
            status: None,
        });
        patch_status(ctx, nadr).await?;
    }
    Ok(Step::Continue)
}

async fn sync_engine_download_request(
    ctx: &Context,
    nadr: &mut NonAdminDownloadRequest,
) -> Result<Step> {
    let namespace = nadr.namespace().ok_or_else(|| {
        Error::MetadataMissing("NonAdminDownloadRequest has no namespace".to_string())
    })?;
    let uuid = nadr
        .nac_uuid()
        .ok_or_else(|| Error::MetadataMissing("NAC UUID missing from status".to_string()))?
        .to_string();
    let oadp_namespace = ctx.config.oadp_namespace.clone();

    let found: Option<DownloadRequest> =
        find_engine_object_by_uuid(&ctx.client, &oadp_namespace, &uuid).await?;

    let velero_request = match found {
        Some(request) => {
            let origin = request
                .annotations()
                .get(ORIGIN_NAMESPACE_ANNOTATION)
                .map(String::as_str);
            if origin != Some(namespace.as_str()) {
                return Err(Error::ForeignEngineObject(format!(
                    "Velero DownloadRequest {} does not point back to namespace {namespace}",
                    request.name_any()
                )));
            }
            request
        }
        None => {
            // expired requests are garbage collected by the engine; a fresh
            // one is created whenever the tenant object is reconciled again
            let engine_target_name = resolve_target(ctx, nadr).await?;
            let mut labels = non_admin_labels();
            labels.insert(NAC_ORIGIN_UUID_LABEL.to_string(), uuid.clone());
            let request = DownloadRequest {
                metadata: ObjectMeta {
                    name: Some(uuid.clone()),
                    namespace: Some(oadp_namespace.clone()),
                    labels: Some(labels),
                    annotations: Some(origin_annotations(&nadr.metadata)),
                    ..Default::default()
                },
                spec: DownloadRequestSpec {
                    target: DownloadTarget {
                        kind: nadr.spec.target.kind.clone(),
                        name: engine_target_name,
                    },
                },
                status: None,
            };
            let api: Api<DownloadRequest> = Api::namespaced(ctx.client.clone(), &oadp_namespace);
            let created = api
                .create(&PostParams::default(), &request)
                .await
                .map_err(Error::KubeError)?;
            info!("Velero DownloadRequest successfully created");
            created
        }
    };

    let status = nadr.status.get_or_insert_with(Default::default);
    let mut changed = mirror_velero_download_request(status, &velero_request);
    changed |= update_phase(&mut status.phase, NonAdminPhase::Created);
    changed |= set_status_condition(
        &mut status.conditions,
        new_condition(
            NonAdminCondition::Queued.as_str(),
            true,
            "DownloadRequestScheduled",
            "Created Velero DownloadRequest object",
        ),
    );
    if changed {
        patch_status(ctx, nadr).await?;
    }
    Ok(Step::Continue)
}

// --- controller wiring -----------------------------------------------------

/// Initialize the NonAdminDownloadRequest controller (given the crd is installed)
pub async fn run(state: State, config: Arc<OperatorConfig>) {
    let client = Client::try_default()
        .await
        .expect("failed to create kube Client");

    let nadrs = Api::<NonAdminDownloadRequest>::all(client.clone());
    if let Err(e) = nadrs.list(&ListParams::default().limit(1)).await {
        error!("NonAdminDownloadRequest CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    let velero_requests: Api<DownloadRequest> =
        Api::namespaced(client.clone(), &config.oadp_namespace);

    Controller::new(nadrs, watcher::Config::default().any_semantic())
        .watches(
            velero_requests,
            watcher::Config::default(),
            |request: DownloadRequest| {
                handlers::engine_to_tenant::<NonAdminDownloadRequest, _>(request)
            },
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, state.to_context(client, config))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1alpha1::NonAdminDownloadRequestSpec;

    #[test]
    fn recognized_target_kinds() {
        for kind in ["BackupLog", "BackupContents", "RestoreLog", "RestoreResults"] {
            assert!(validate_target_kind(kind).is_ok(), "{kind}");
        }
        assert!(matches!(
            validate_target_kind("BackupBucket"),
            Err(Error::InvalidSpec(_))
        ));
    }

    #[test]
    fn target_kind_selects_the_tenant_kind() {
        let mut nadr = NonAdminDownloadRequest::new(
            "logs",
            NonAdminDownloadRequestSpec {
                target: DownloadTarget {
                    kind: "RestoreLog".to_string(),
                    name: "my-restore".to_string(),
                },
            },
        );
        assert!(nadr.targets_restore());
        nadr.spec.target.kind = "BackupLog".to_string();
        assert!(!nadr.targets_restore());
    }
}
