//! Process-wide configuration: the operator namespace and the admin-enforced
//! spec fields, loaded once at startup.

use kube::api::ListParams;
use kube::{Api, Client};
use tracing::info;

use crate::api::v1alpha1::DataProtectionApplication;
use crate::common::constants::OADP_NAMESPACE_ENV;
use crate::util::errors::{Error, Result};
use crate::velero::{BackupSpec, RestoreSpec};

#[derive(Clone, Debug, Default)]
pub struct OperatorConfig {
    /// The privileged namespace all Velero objects live in.
    pub oadp_namespace: String,
    /// Admin-mandated backup fields, layered over tenant defaults.
    pub enforced_backup_spec: BackupSpec,
    /// Admin-mandated restore fields, layered over tenant defaults.
    pub enforced_restore_spec: RestoreSpec,
}

impl OperatorConfig {
    pub fn from_env() -> Result<Self> {
        let oadp_namespace = std::env::var(OADP_NAMESPACE_ENV).unwrap_or_default();
        if oadp_namespace.is_empty() {
            return Err(Error::ConfigError(format!(
                "{OADP_NAMESPACE_ENV} environment variable must name the OADP namespace"
            )));
        }
        Ok(OperatorConfig {
            oadp_namespace,
            ..Default::default()
        })
    }

    /// Reads the admin policy from the DataProtectionApplication in the OADP
    /// namespace. Loaded once; changing the policy requires a restart, which
    /// the operator installer performs when the DPA changes.
    pub async fn load_enforced_specs(&mut self, client: &Client) -> Result<()> {
        let api: Api<DataProtectionApplication> =
            Api::namespaced(client.clone(), &self.oadp_namespace);
        let dpas = api
            .list(&ListParams::default())
            .await
            .map_err(Error::KubeError)?;

        let Some(dpa) = dpas.items.into_iter().next() else {
            info!("no DataProtectionApplication found, running without enforced specs");
            return Ok(());
        };
        if let Some(non_admin) = dpa.spec.non_admin {
            if let Some(enforced) = non_admin.enforce_backup_spec {
                info!("admin-enforced backup spec loaded");
                self.enforced_backup_spec = enforced;
            }
            if let Some(enforced) = non_admin.enforce_restore_spec {
                info!("admin-enforced restore spec loaded");
                self.enforced_restore_spec = enforced;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn from_env_requires_the_namespace() {
        std::env::remove_var(OADP_NAMESPACE_ENV);
        assert!(OperatorConfig::from_env().is_err());

        std::env::set_var(OADP_NAMESPACE_ENV, "openshift-adp");
        let config = OperatorConfig::from_env().unwrap();
        assert_eq!(config.oadp_namespace, "openshift-adp");
        std::env::remove_var(OADP_NAMESPACE_ENV);
    }
}
