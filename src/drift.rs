//! Find-or-create and one-step drift correction for child resources.
use kube::ResourceExt;
use tracing::*;

use crate::{
    Error, Result,
    store::{Store, StoreObject, object_key},
};

/// Result of looking up a desired child resource.
#[derive(Clone, Debug)]
pub enum Found<K> {
    /// The resource was already there.
    Existing(K),
    /// The resource was missing and has just been created.
    Created(K),
}

impl<K: StoreObject> Found<K> {
    /// The existing resource, or a resource-create error when it was just created.
    pub fn existing(self) -> Result<K> {
        match self {
            Found::Existing(k) => Ok(k),
            Found::Created(k) => Err(Error::resource_create(format!(
                "created {} {}",
                K::kind(&()).to_lowercase(),
                k.name_any()
            ))),
        }
    }
}

/// Fetches `desired` by name and creates it when absent.
pub async fn find_or_create<K, S>(store: &S, desired: &K) -> Result<Found<K>>
where
    K: StoreObject,
    S: Store,
{
    let (namespace, name) = object_key(desired)?;
    match store.get::<K>(&namespace, &name).await? {
        Some(observed) => Ok(Found::Existing(observed)),
        None => {
            info!("Creating {} \"{}\" in {}", K::kind(&()), name, namespace);
            let created = store.create(desired).await?;
            Ok(Found::Created(created))
        }
    }
}

/// Mutable fields of a resource that the operator keeps in line with the
/// desired state, checked group by group in a fixed order.
pub trait Drift: Sized {
    /// Returns a copy of `self` with the first drifted field group taken from
    /// `desired`, and the name of that group. `None` when nothing drifted.
    fn correct(&self, desired: &Self) -> Option<(Self, &'static str)>;
}

/// Applies at most one correction to `observed`.
///
/// Returns the observed object unchanged when nothing drifted, otherwise
/// writes the corrected object and reports a resource-update error.
pub async fn verify_and_correct<K, S>(store: &S, observed: K, desired: &K) -> Result<K>
where
    K: StoreObject + Drift,
    S: Store,
{
    let Some((corrected, group)) = observed.correct(desired) else {
        return Ok(observed);
    };
    let kind = K::kind(&()).to_lowercase();
    let name = observed.name_any();
    info!("Correcting {} of {} {}", group, kind, name);
    store.update(&corrected).await?;
    Err(Error::resource_update(format!("updated {kind} {name} {group}")))
}

/// A named field group and the function copying it from desired into
/// observed, returning whether anything changed.
pub type Check<K> = (&'static str, fn(&mut K, &K) -> bool);

/// Runs `checks` in order and keeps the first one that finds a difference.
pub fn first_drift<K: Clone>(
    observed: &K,
    desired: &K,
    checks: &[Check<K>],
) -> Option<(K, &'static str)> {
    checks.iter().find_map(|(group, check)| {
        let mut candidate = observed.clone();
        check(&mut candidate, desired).then_some((candidate, *group))
    })
}

/// Copies `desired` into `slot` when they differ.
pub fn sync<T: PartialEq + Clone>(slot: &mut T, desired: &T) -> bool {
    if slot == desired {
        return false;
    }
    *slot = desired.clone();
    true
}
