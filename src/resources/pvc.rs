use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements},
    apimachinery::pkg::api::resource::Quantity,
};
use kube::Resource;

use crate::{Result, drift::find_or_create, resources::child_meta, store::Store};

/// ReadWriteOnce filesystem claim of `size`.
pub fn synthesize<K: Resource<DynamicType = ()>>(
    owner: &K,
    name: &str,
    labels: &BTreeMap<String, String>,
    size: &str,
    class: Option<&String>,
) -> Result<PersistentVolumeClaim> {
    Ok(PersistentVolumeClaim {
        metadata: child_meta(owner, name, labels)?,
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".into()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), Quantity(size.to_string()))])),
                ..Default::default()
            }),
            storage_class_name: class.cloned(),
            volume_mode: Some("Filesystem".into()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Claims are immutable once bound, so only existence is reconciled.
pub async fn ensure<S: Store>(store: &S, desired: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
    find_or_create(store, desired).await?.existing()
}
