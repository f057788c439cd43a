//! Locating engine objects in the OADP namespace by NAC UUID label.

use std::fmt::Debug;

use kube::api::ListParams;
use kube::core::NamespaceResourceScope;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

use super::constants::NAC_ORIGIN_UUID_LABEL;
use crate::util::errors::{Error, Result};

/// Finds the engine object bound to `uuid`. The UUID label is the only
/// source of truth for the binding; object names are never consulted.
///
/// Zero matches is a normal outcome (not yet created, or already deleted).
/// More than one match means the binding invariant is broken on the engine
/// side; the error is surfaced and retried, never repaired automatically.
pub async fn find_engine_object_by_uuid<K>(
    client: &Client,
    namespace: &str,
    uuid: &str,
) -> Result<Option<K>>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let selector = format!("{NAC_ORIGIN_UUID_LABEL}={uuid}");
    let mut items = api
        .list(&ListParams::default().labels(&selector))
        .await
        .map_err(Error::KubeError)?
        .items;

    match items.len() {
        0 => Ok(None),
        1 => Ok(items.pop()),
        count => Err(Error::AmbiguousBinding {
            kind: K::kind(&K::DynamicType::default()).into_owned(),
            namespace: namespace.to_string(),
            uuid: uuid.to_string(),
            count,
        }),
    }
}
