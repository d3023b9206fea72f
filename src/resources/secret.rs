use std::collections::BTreeMap;

use k8s_openapi::{ByteString, api::core::v1::Secret};
use kube::{Resource, ResourceExt};
use rand::{Rng, distr::Alphanumeric, rng};
use sha2::{Digest, Sha256};
use tracing::*;

use crate::{
    Error, Result,
    drift::find_or_create,
    membership::Members,
    properties,
    resources::{child_meta, is_owner},
    store::Store,
};

pub const SONAR_PROPERTIES: &str = "sonar.properties";
pub const WRAPPER_CONF: &str = "wrapper.conf";
pub const JDBC_URL: &str = "sonar.jdbc.url";
pub const JWT_SECRET: &str = "sonar.auth.jwtBase64Hs256Secret";

/// Default secret name for `owner`
pub fn default_name(owner: &str) -> String {
    format!("{owner}-config")
}

/// Opaque secret with empty configuration files, owned by `owner`.
pub fn synthesize<K: Resource<DynamicType = ()>>(
    owner: &K,
    name: &str,
    labels: &BTreeMap<String, String>,
) -> Result<Secret> {
    Ok(Secret {
        metadata: child_meta(owner, name, labels)?,
        type_: Some("Opaque".into()),
        data: Some(BTreeMap::from([
            (SONAR_PROPERTIES.to_string(), ByteString(Vec::new())),
            (WRAPPER_CONF.to_string(), ByteString(Vec::new())),
        ])),
        ..Default::default()
    })
}

/// Looked-up configuration secret and whether `owner` owns it.
pub struct Observed {
    pub secret: Secret,
    pub owned: bool,
}

/// Finds or creates the secret, then records `owner` in the membership
/// annotation `annotation` when the secret belongs to someone else.
pub async fn ensure<K, S>(store: &S, owner: &K, desired: &Secret, annotation: &str) -> Result<Observed>
where
    K: Resource<DynamicType = ()>,
    S: Store,
{
    let secret = find_or_create(store, desired).await?.existing()?;
    if is_owner(owner, &secret) {
        return Ok(Observed { secret, owned: true });
    }

    let mut members = Members::from_annotation(&secret, annotation);
    if members.add(&owner.name_any()) {
        let mut shared = secret.clone();
        members.store_on(&mut shared, annotation);
        store.update(&shared).await?;
        return Err(Error::resource_update(format!(
            "added {} to annotations of secret {}",
            owner.name_any(),
            secret.name_any()
        )));
    }
    Ok(Observed { secret, owned: false })
}

/// Drops `member` from the membership annotation of a shared secret.
pub async fn release<S: Store>(store: &S, namespace: &str, name: &str, annotation: &str, member: &str) -> Result<()> {
    let Some(mut secret) = store.get::<Secret>(namespace, name).await? else {
        return Ok(());
    };
    let mut members = Members::from_annotation(&secret, annotation);
    if members.remove(member) {
        members.store_on(&mut secret, annotation);
        store.update(&secret).await?;
    }
    Ok(())
}

/// Checks the properties a clustered deployment cannot run without.
///
/// A missing JWT secret is generated when the secret is owned; an unowned
/// secret is never modified.
pub async fn verify_cluster_properties<S: Store>(store: &S, observed: &Observed) -> Result<()> {
    let secret = &observed.secret;
    let Some(props) = properties::file(secret, SONAR_PROPERTIES) else {
        return Err(Error::spec_invalid(format!(
            "{SONAR_PROPERTIES} doesn't exist in secret {}",
            secret.name_any()
        )));
    };
    if properties::get(&props, JDBC_URL).is_none() {
        return Err(Error::spec_invalid(format!("{JDBC_URL} not set")));
    }
    if properties::get(&props, JWT_SECRET).is_some() {
        return Ok(());
    }
    if !observed.owned {
        return Err(Error::spec_invalid(format!("{JWT_SECRET} not set")));
    }

    let mut updated = secret.clone();
    let mut contents = props;
    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    contents.push_str(&format!("{JWT_SECRET}={}\n", generate_jwt_secret()));
    updated
        .data
        .get_or_insert_with(Default::default)
        .insert(SONAR_PROPERTIES.to_string(), ByteString(contents.into_bytes()));
    info!("Adding {} to secret {}", JWT_SECRET, secret.name_any());
    store.update(&updated).await?;
    Err(Error::resource_update(format!(
        "added {JWT_SECRET} to {SONAR_PROPERTIES} in {}",
        secret.name_any()
    )))
}

/// Random key material for signing SonarQube session tokens, hex encoded.
pub fn generate_jwt_secret() -> String {
    let seed: String = rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    format!("{:x}", Sha256::digest(seed.as_bytes()))
}
