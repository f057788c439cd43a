use std::sync::Arc;

use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams};
use kube::Client;
use serial_test::serial;

use crate::api::v1alpha1::{NonAdminBackup, NonAdminBackupSpec, NonAdminPhase};
use crate::common::constants::NAC_ORIGIN_UUID_LABEL;
use crate::config::OperatorConfig;
use crate::controllers::{backup_controller, State};
use crate::velero::{Backup, BackupSpec};

const TEST_NAMESPACE: &str = "default";
const OADP_NAMESPACE: &str = "openshift-adp";

fn test_config() -> Arc<OperatorConfig> {
    Arc::new(OperatorConfig {
        oadp_namespace: OADP_NAMESPACE.to_string(),
        ..Default::default()
    })
}

#[tokio::test]
#[serial]
#[ignore = "uses k8s current-context"]
async fn integration_reconcile_creates_velero_backup() {
    let client = Client::try_default().await.unwrap();
    let ctx = State::default().to_context(client.clone(), test_config());

    let nab = NonAdminBackup {
        metadata: ObjectMeta {
            name: Some("test-backup".to_string()),
            namespace: Some(TEST_NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: NonAdminBackupSpec {
            backup_spec: Some(BackupSpec {
                ttl: Some("24h".to_string()),
                ..Default::default()
            }),
            delete_backup: false,
        },
        status: None,
    };

    let nabs: Api<NonAdminBackup> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let ssapply = PatchParams::apply("ctrltest").force();
    nabs.patch("test-backup", &ssapply, &Patch::Apply(&nab))
        .await
        .unwrap();

    let applied = nabs.get("test-backup").await.unwrap();
    backup_controller::reconcile(Arc::new(applied), ctx)
        .await
        .unwrap();

    // status carries the binding and the phase
    let reconciled = nabs.get("test-backup").await.unwrap();
    let status = reconciled.status.expect("status should be set");
    assert_eq!(status.phase, Some(NonAdminPhase::Created));
    let uuid = status.velero_backup.expect("binding should be set").nacuuid;
    assert!(!uuid.is_empty());

    // the Velero backup exists under the UUID name, confined to the tenant
    let backups: Api<Backup> = Api::namespaced(client.clone(), OADP_NAMESPACE);
    let velero_backup = backups.get(&uuid).await.unwrap();
    assert_eq!(
        velero_backup.spec.included_namespaces,
        Some(vec![TEST_NAMESPACE.to_string()])
    );
    assert_eq!(velero_backup.spec.ttl.as_deref(), Some("24h"));
    assert_eq!(
        velero_backup
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(NAC_ORIGIN_UUID_LABEL)),
        Some(&uuid)
    );
}

#[tokio::test]
#[serial]
#[ignore = "uses k8s current-context"]
async fn integration_direct_delete_removes_backup_object_only() {
    let client = Client::try_default().await.unwrap();
    let ctx = State::default().to_context(client.clone(), test_config());

    let nabs: Api<NonAdminBackup> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let nab = nabs.get("test-backup").await.unwrap();
    let uuid = nab.nac_uuid().expect("binding should exist").to_string();

    nabs.delete("test-backup", &DeleteParams::default())
        .await
        .unwrap();

    // the finalizer holds the object until the engine backup is observed gone
    let deleting = nabs.get("test-backup").await.unwrap();
    backup_controller::reconcile(Arc::new(deleting), ctx.clone())
        .await
        .unwrap();

    let backups: Api<Backup> = Api::namespaced(client.clone(), OADP_NAMESPACE);
    assert!(backups.get_opt(&uuid).await.unwrap().is_none() || {
        // deletion initiated; a second pass removes the finalizer
        let again = nabs.get("test-backup").await.unwrap();
        backup_controller::reconcile(Arc::new(again), ctx).await.is_ok()
    });
}
