//! Desired state for every child resource kind, and the drift rules that
//! keep observed children in line with it.
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

use crate::{Error, Result};

pub mod deployment;
pub mod pvc;
pub mod secret;
pub mod service;
pub mod service_account;

pub const SECRET_ANNOTATION: &str = "sonarqube.sonarsource.parflesh.github.io/database";
pub const SERVER_SECRET_ANNOTATION: &str = "sonarqubeserver.sonarsource.parflesh.github.io/database";

pub const SONARQUBE_LABEL: &str = "sonarsource.parflesh.github.io/SonarQube";
pub const SERVER_LABEL: &str = "sonarsource.parflesh.github.io/SonarQubeServer";

pub const APP_NAME: &str = "app.kubernetes.io/name";
pub const APP_INSTANCE: &str = "app.kubernetes.io/instance";
pub const APP_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const APP_PART_OF: &str = "app.kubernetes.io/part-of";
pub const APP_COMPONENT: &str = "app.kubernetes.io/component";
pub const APP_VERSION: &str = "app.kubernetes.io/version";

pub const MANAGER: &str = "sonarqube-operator";

pub const WEB_PORT: i32 = 9000;
pub const SEARCH_PORT: i32 = 9001;
pub const NODE_PORT: i32 = 9003;
pub const CE_PORT: i32 = 9004;

/// Controller owner reference pointing at `owner`.
pub fn owner_ref<K: Resource<DynamicType = ()>>(owner: &K) -> Result<OwnerReference> {
    owner
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey("uid"))
}

/// Whether `child` carries an owner reference to `owner`.
pub fn is_owner<K: Resource, C: Resource>(owner: &K, child: &C) -> bool {
    let Some(uid) = owner.meta().uid.as_deref() else {
        return false;
    };
    child
        .meta()
        .owner_references
        .iter()
        .flatten()
        .any(|o| o.uid == uid)
}

/// Metadata for a child of `owner` named `name`.
pub fn child_meta<K: Resource<DynamicType = ()>>(
    owner: &K,
    name: &str,
    labels: &BTreeMap<String, String>,
) -> Result<ObjectMeta> {
    Ok(ObjectMeta {
        name: Some(name.to_string()),
        namespace: owner.namespace(),
        labels: Some(labels.clone()),
        owner_references: Some(vec![owner_ref(owner)?]),
        ..Default::default()
    })
}

/// Labels every object managed by the operator carries.
pub fn standard_labels(instance: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_NAME.to_string(), "sonarqube".to_string()),
        (APP_INSTANCE.to_string(), instance.to_string()),
        (APP_MANAGED_BY.to_string(), MANAGER.to_string()),
        (APP_COMPONENT.to_string(), component.to_string()),
    ])
}

/// `image:version`, unless the image already names a tag or no version is set.
pub fn image_reference(image: &str, version: &str) -> String {
    let last = image.rsplit('/').next().unwrap_or(image);
    if version.is_empty() || last.contains(':') || last.contains('@') {
        image.to_string()
    } else {
        format!("{image}:{version}")
    }
}
