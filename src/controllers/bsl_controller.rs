//! NonAdminBackupStorageLocation controller.
//!
//! Promotes a tenant storage location into the OADP namespace: the credential
//! secret is copied under the NAC UUID name, a Velero BackupStorageLocation
//! is created next to it, and the engine's validation status flows back to
//! the tenant. Deletion tears both down before the finalizer is released.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Secret, SecretKeySelector};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use tracing::*;

use crate::api::v1alpha1::{
    NonAdminBackupStorageLocation, NonAdminCondition, NonAdminPhase,
    VeleroBackupStorageLocationReference, NABSL_FINALIZER,
};
use crate::common::constants::{NAC_ORIGIN_UUID_LABEL, ORIGIN_NAMESPACE_ANNOTATION};
use crate::common::lookup::find_engine_object_by_uuid;
use crate::common::naming::{generate_nac_uuid, non_admin_labels, origin_annotations};
use crate::common::projection::mirror_velero_bsl;
use crate::config::OperatorConfig;
use crate::controllers::{error_action, handlers, run_steps, Context, State, Step};
use crate::util::errors::{Error, Result};
use crate::util::status::{new_condition, set_status_condition, update_phase};
use crate::velero::{BackupStorageLocation, BackupStorageLocationSpec};

const CONTROLLER: &str = "nonadminbackupstoragelocation";

#[instrument(skip(ctx, nabsl), fields(namespace = %nabsl.namespace().unwrap_or_default(), name = %nabsl.name_any()))]
pub async fn reconcile(
    nabsl: Arc<NonAdminBackupStorageLocation>,
    ctx: Arc<Context>,
) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure(CONTROLLER);
    ctx.diagnostics.write().await.last_event = Utc::now();

    let mut nabsl = (*nabsl).clone();
    if nabsl.meta().deletion_timestamp.is_some() {
        run_steps!(
            mark_deleting(&ctx, &mut nabsl),
            delete_engine_bsl(&ctx, &mut nabsl),
        );
    } else {
        run_steps!(
            init_phase(&ctx, &mut nabsl),
            validate_spec(&ctx, &mut nabsl),
            ensure_uuid(&ctx, &mut nabsl),
            ensure_finalizer(&ctx, &mut nabsl),
            sync_engine_bsl(&ctx, &mut nabsl),
        );
    }
    Ok(Action::await_change())
}

fn error_policy(
    _nabsl: Arc<NonAdminBackupStorageLocation>,
    error: &Error,
    ctx: Arc<Context>,
) -> Action {
    error_action(CONTROLLER, error, &ctx)
}

fn tenant_api(
    ctx: &Context,
    nabsl: &NonAdminBackupStorageLocation,
) -> Result<Api<NonAdminBackupStorageLocation>> {
    let namespace = nabsl.namespace().ok_or_else(|| {
        Error::MetadataMissing("NonAdminBackupStorageLocation has no namespace".to_string())
    })?;
    Ok(Api::namespaced(ctx.client.clone(), &namespace))
}

async fn patch_status(ctx: &Context, nabsl: &NonAdminBackupStorageLocation) -> Result<()> {
    let api = tenant_api(ctx, nabsl)?;
    api.patch_status(
        &nabsl.name_any(),
        &PatchParams::default(),
        &Patch::Merge(json!({ "status": nabsl.status })),
    )
    .await
    .map_err(Error::KubeError)?;
    Ok(())
}

fn has_finalizer(nabsl: &NonAdminBackupStorageLocation) -> bool {
    nabsl.finalizers().iter().any(|f| f == NABSL_FINALIZER)
}

async fn init_phase(ctx: &Context, nabsl: &mut NonAdminBackupStorageLocation) -> Result<Step> {
    let status = nabsl.status.get_or_insert_with(Default::default);
    if status.phase.is_none() && update_phase(&mut status.phase, NonAdminPhase::New) {
        patch_status(ctx, nabsl).await?;
    }
    Ok(Step::Continue)
}

async fn validate_spec(ctx: &Context, nabsl: &mut NonAdminBackupStorageLocation) -> Result<Step> {
    match validate_bsl_spec(&nabsl.spec.backup_storage_location_spec) {
        Ok(()) => {
            let status = nabsl.status.get_or_insert_with(Default::default);
            let changed = set_status_condition(
                &mut status.conditions,
                new_condition(
                    NonAdminCondition::Accepted.as_str(),
                    true,
                    "BackupStorageLocationAccepted",
                    "backup storage location accepted",
                ),
            );
            if changed {
                patch_status(ctx, nabsl).await?;
            }
            Ok(Step::Continue)
        }
        Err(error) => {
            let message = error.to_string();
            let status = nabsl.status.get_or_insert_with(Default::default);
            let mut changed = update_phase(&mut status.phase, NonAdminPhase::BackingOff);
            changed |= set_status_condition(
                &mut status.conditions,
                new_condition(
                    NonAdminCondition::Accepted.as_str(),
                    false,
                    "InvalidBackupStorageLocationSpec",
                    &message,
                ),
            );
            if changed {
                patch_status(ctx, nabsl).await?;
            }
            Err(error)
        }
    }
}

fn validate_bsl_spec(spec: &Option<BackupStorageLocationSpec>) -> Result<()> {
    let Some(spec) = spec else {
        return Err(Error::InvalidSpec(
            "spec.backupStorageLocationSpec is required".to_string(),
        ));
    };
    if spec.provider.is_empty() {
        return Err(Error::InvalidSpec(
            "spec.backupStorageLocationSpec.provider is required".to_string(),
        ));
    }
    if spec
        .object_storage
        .as_ref()
        .map(|storage| storage.bucket.as_str())
        .unwrap_or_default()
        .is_empty()
    {
        return Err(Error::InvalidSpec(
            "spec.backupStorageLocationSpec.objectStorage.bucket is required".to_string(),
        ));
    }
    let credential_named = spec
        .credential
        .as_ref()
        .map(|credential| credential.name.as_str())
        .is_some_and(|name| !name.is_empty());
    if !credential_named || spec.credential.as_ref().is_some_and(|c| c.key.is_empty()) {
        return Err(Error::InvalidSpec(
            "spec.backupStorageLocationSpec.credential must name a secret and key in the tenant namespace"
                .to_string(),
        ));
    }
    if spec.default == Some(true) {
        return Err(Error::InvalidSpec(
            "a non-admin backup storage location can not be the cluster default".to_string(),
        ));
    }
    Ok(())
}

async fn ensure_uuid(ctx: &Context, nabsl: &mut NonAdminBackupStorageLocation) -> Result<Step> {
    let api = tenant_api(ctx, nabsl)?;
    *nabsl = api.get(&nabsl.name_any()).await.map_err(Error::KubeError)?;

    if nabsl.nac_uuid().is_none() {
        let uuid = generate_nac_uuid();
        let status = nabsl.status.get_or_insert_with(Default::default);
        status.velero_backup_storage_location = Some(VeleroBackupStorageLocationReference {
            nacuuid: uuid.clone(),
            namespace: ctx.config.oadp_namespace.clone(),
            name: uuid,
            status: None,
        });
        patch_status(ctx, nabsl).await?;
    }
    Ok(Step::Continue)
}

async fn ensure_finalizer(ctx: &Context, nabsl: &mut NonAdminBackupStorageLocation) -> Result<Step> {
    if !has_finalizer(nabsl) {
        let finalizers: Vec<String> = nabsl
            .finalizers()
            .iter()
            .cloned()
            .chain([NABSL_FINALIZER.to_string()])
            .collect();
        let api = tenant_api(ctx, nabsl)?;
        *nabsl = api
            .patch(
                &nabsl.name_any(),
                &PatchParams::default(),
                &Patch::Merge(json!({ "metadata": { "finalizers": finalizers } })),
            )
            .await
            .map_err(Error::KubeError)?;
    }
    Ok(Step::Continue)
}

async fn sync_engine_bsl(ctx: &Context, nabsl: &mut NonAdminBackupStorageLocation) -> Result<Step> {
    let namespace = nabsl.namespace().ok_or_else(|| {
        Error::MetadataMissing("NonAdminBackupStorageLocation has no namespace".to_string())
    })?;
    let uuid = nabsl
        .nac_uuid()
        .ok_or_else(|| Error::MetadataMissing("NAC UUID missing from status".to_string()))?
        .to_string();
    let oadp_namespace = ctx.config.oadp_namespace.clone();

    sync_credential_secret(ctx, nabsl, &namespace, &uuid).await?;

    let found: Option<BackupStorageLocation> =
        find_engine_object_by_uuid(&ctx.client, &oadp_namespace, &uuid).await?;

    let velero_bsl = match found {
        Some(bsl) => {
            let origin = bsl
                .annotations()
                .get(ORIGIN_NAMESPACE_ANNOTATION)
                .map(String::as_str);
            if origin != Some(namespace.as_str()) {
                return Err(Error::ForeignEngineObject(format!(
                    "Velero BackupStorageLocation {} does not point back to namespace {namespace}",
                    bsl.name_any()
                )));
            }
            bsl
        }
        None => {
            info!("Velero BackupStorageLocation with NAC UUID {uuid} not found, creating one");
            let mut spec = nabsl
                .spec
                .backup_storage_location_spec
                .clone()
                .unwrap_or_default();
            // the engine reads the credential copy, not the tenant secret
            spec.credential = Some(SecretKeySelector {
                key: spec
                    .credential
                    .as_ref()
                    .map(|credential| credential.key.clone())
                    .unwrap_or_default(),
                name: uuid.clone(),
                optional: None,
            });
            spec.default = Some(false);

            let mut labels = non_admin_labels();
            labels.insert(NAC_ORIGIN_UUID_LABEL.to_string(), uuid.clone());
            let bsl = BackupStorageLocation {
                metadata: ObjectMeta {
                    name: Some(uuid.clone()),
                    namespace: Some(oadp_namespace.clone()),
                    labels: Some(labels),
                    annotations: Some(origin_annotations(&nabsl.metadata)),
                    ..Default::default()
                },
                spec,
                status: None,
            };
            let api: Api<BackupStorageLocation> =
                Api::namespaced(ctx.client.clone(), &oadp_namespace);
            let created = api
                .create(&PostParams::default(), &bsl)
                .await
                .map_err(Error::KubeError)?;
            info!("Velero BackupStorageLocation successfully created");
            created
        }
    };

    let status = nabsl.status.get_or_insert_with(Default::default);
    let mut changed = mirror_velero_bsl(status, &velero_bsl);
    changed |= update_phase(&mut status.phase, NonAdminPhase::Created);
    changed |= set_status_condition(
        &mut status.conditions,
        new_condition(
            NonAdminCondition::Queued.as_str(),
            true,
            "BackupStorageLocationCreated",
            "Created Velero BackupStorageLocation object",
        ),
    );
    if changed {
        patch_status(ctx, nabsl).await?;
    }
    Ok(Step::Continue)
}

/// Copies the tenant's credential secret into the OADP namespace under the
/// NAC UUID name, refreshing the copy when the tenant rotates the secret.
async fn sync_credential_secret(
    ctx: &Context,
    nabsl: &NonAdminBackupStorageLocation,
    namespace: &str,
    uuid: &str,
) -> Result<()> {
    let credential_name = nabsl
        .spec
        .backup_storage_location_spec
        .as_ref()
        .and_then(|spec| spec.credential.as_ref())
        .map(|credential| credential.name.clone())
        .ok_or_else(|| {
            Error::InvalidSpec("spec.backupStorageLocationSpec.credential must name a secret".to_string())
        })?;

    let tenant_secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    let Some(tenant_secret) = tenant_secrets
        .get_opt(&credential_name)
        .await
        .map_err(Error::KubeError)?
    else {
        return Err(Error::InvalidSpec(format!(
            "credential secret {credential_name} does not exist in namespace {namespace}"
        )));
    };

    let mut labels = non_admin_labels();
    labels.insert(NAC_ORIGIN_UUID_LABEL.to_string(), uuid.to_string());
    let copy = Secret {
        metadata: ObjectMeta {
            name: Some(uuid.to_string()),
            namespace: Some(ctx.config.oadp_namespace.clone()),
            labels: Some(labels),
            annotations: Some(origin_annotations(&nabsl.metadata)),
            ..Default::default()
        },
        data: tenant_secret.data.clone(),
        type_: tenant_secret.type_.clone(),
        ..Default::default()
    };

    let operator_secrets: Api<Secret> =
        Api::namespaced(ctx.client.clone(), &ctx.config.oadp_namespace);
    match operator_secrets
        .get_opt(uuid)
        .await
        .map_err(Error::KubeError)?
    {
        None => {
            operator_secrets
                .create(&PostParams::default(), &copy)
                .await
                .map_err(Error::KubeError)?;
            info!("credential secret copied into the OADP namespace");
        }
        Some(existing) if existing.data != copy.data => {
            operator_secrets
                .patch(
                    uuid,
                    &PatchParams::default(),
                    &Patch::Merge(json!({ "data": copy.data })),
                )
                .await
                .map_err(Error::KubeError)?;
            info!("credential secret copy refreshed");
        }
        Some(_) => {}
    }
    Ok(())
}

// --- deletion --------------------------------------------------------------

async fn mark_deleting(ctx: &Context, nabsl: &mut NonAdminBackupStorageLocation) -> Result<Step> {
    let status = nabsl.status.get_or_insert_with(Default::default);
    let mut changed = update_phase(&mut status.phase, NonAdminPhase::Deleting);
    changed |= set_status_condition(
        &mut status.conditions,
        new_condition(
            NonAdminCondition::Deleting.as_str(),
            true,
            "DeletionPending",
            "backup storage location accepted for deletion",
        ),
    );
    if changed {
        patch_status(ctx, nabsl).await?;
    }
    Ok(Step::Continue)
}

async fn delete_engine_bsl(ctx: &Context, nabsl: &mut NonAdminBackupStorageLocation) -> Result<Step> {
    let Some(uuid) = nabsl.nac_uuid().map(str::to_string) else {
        return remove_finalizer(ctx, nabsl).await;
    };
    let oadp_namespace = ctx.config.oadp_namespace.clone();

    let velero_bsl: Option<BackupStorageLocation> =
        find_engine_object_by_uuid(&ctx.client, &oadp_namespace, &uuid).await?;
    if let Some(bsl) = velero_bsl {
        let api: Api<BackupStorageLocation> = Api::namespaced(ctx.client.clone(), &oadp_namespace);
        api.delete(&bsl.name_any(), &DeleteParams::default())
            .await
            .map_err(Error::KubeError)?;
        info!("Velero BackupStorageLocation deletion initiated");
        return Ok(Step::Continue);
    }

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &oadp_namespace);
    if secrets
        .get_opt(&uuid)
        .await
        .map_err(Error::KubeError)?
        .is_some()
    {
        secrets
            .delete(&uuid, &DeleteParams::default())
            .await
            .map_err(Error::KubeError)?;
        info!("credential secret copy deleted");
    }

    remove_finalizer(ctx, nabsl).await
}

async fn remove_finalizer(ctx: &Context, nabsl: &mut NonAdminBackupStorageLocation) -> Result<Step> {
    if !has_finalizer(nabsl) {
        return Ok(Step::Continue);
    }
    info!("Velero BackupStorageLocation is gone, removing NonAdminBackupStorageLocation finalizer");
    let finalizers: Vec<String> = nabsl
        .finalizers()
        .iter()
        .filter(|f| *f != NABSL_FINALIZER)
        .cloned()
        .collect();
    let api = tenant_api(ctx, nabsl)?;
    api.patch(
        &nabsl.name_any(),
        &PatchParams::default(),
        &Patch::Merge(json!({ "metadata": { "finalizers": finalizers } })),
    )
    .await
    .map_err(Error::KubeError)?;
    Ok(Step::Continue)
}

// --- controller wiring -----------------------------------------------------

/// Initialize the NonAdminBackupStorageLocation controller (given the crd is installed)
pub async fn run(state: State, config: Arc<OperatorConfig>) {
    let client = Client::try_default()
        .await
        .expect("failed to create kube Client");

    let nabsls = Api::<NonAdminBackupStorageLocation>::all(client.clone());
    if let Err(e) = nabsls.list(&ListParams::default().limit(1)).await {
        error!("NonAdminBackupStorageLocation CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    let velero_bsls: Api<BackupStorageLocation> =
        Api::namespaced(client.clone(), &config.oadp_namespace);

    Controller::new(nabsls, watcher::Config::default().any_semantic())
        .watches(
            velero_bsls,
            watcher::Config::default(),
            |bsl: BackupStorageLocation| {
                handlers::engine_to_tenant::<NonAdminBackupStorageLocation, _>(bsl)
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
    use crate::velero::ObjectStorageLocation;

    fn valid_spec() -> BackupStorageLocationSpec {
        BackupStorageLocationSpec {
            provider: "aws".to_string(),
            object_storage: Some(ObjectStorageLocation {
                bucket: "team-a-backups".to_string(),
                prefix: Some("velero".to_string()),
                ca_cert: None,
            }),
            credential: Some(SecretKeySelector {
                key: "cloud".to_string(),
                name: "cloud-credentials".to_string(),
                optional: None,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn valid_spec_is_accepted() {
        assert!(validate_bsl_spec(&Some(valid_spec())).is_ok());
    }

    #[test]
    fn missing_pieces_are_rejected() {
        assert!(validate_bsl_spec(&None).is_err());

        let mut spec = valid_spec();
        spec.provider = String::new();
        assert!(validate_bsl_spec(&Some(spec)).is_err());

        let mut spec = valid_spec();
        spec.object_storage = None;
        assert!(validate_bsl_spec(&Some(spec)).is_err());

        let mut spec = valid_spec();
        spec.credential = None;
        assert!(validate_bsl_spec(&Some(spec)).is_err());
    }

    #[test]
    fn tenant_bsl_can_not_become_the_cluster_default() {
        let mut spec = valid_spec();
        spec.default = Some(true);
        assert!(matches!(
            validate_bsl_spec(&Some(spec)),
            Err(Error::InvalidSpec(_))
        ));
    }
}
