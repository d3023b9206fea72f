use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ServiceAccount;
use kube::Resource;

use crate::{
    Result,
    drift::find_or_create,
    resources::child_meta,
    store::Store,
};

pub fn synthesize<K: Resource<DynamicType = ()>>(
    owner: &K,
    name: &str,
    labels: &BTreeMap<String, String>,
) -> Result<ServiceAccount> {
    Ok(ServiceAccount {
        metadata: child_meta(owner, name, labels)?,
        ..Default::default()
    })
}

/// Service accounts carry nothing the operator corrects; existing ones are left as is.
pub async fn ensure<S: Store>(store: &S, desired: &ServiceAccount) -> Result<ServiceAccount> {
    find_or_create(store, desired).await?.existing()
}
