//! The reconciliation pass shared by `SonarQube` and `SonarQubeServer`.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    ResourceExt,
    core::object::{HasSpec, HasStatus},
    runtime::controller::Action,
};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::*;

use crate::{
    Config, Error, ErrorKind, Metrics, Result,
    api_client::ServerApi,
    retry::{self, Decision},
    revision,
    run::Diagnostics,
    status::{ManagedStatus, write_status},
    store::{Store, StoreObject},
};

// Context for our reconcilers
#[derive(Clone)]
pub struct Context<S> {
    /// Object store the reconcilers read and write through
    pub store: S,
    /// Operator configuration
    pub config: Arc<Config>,
    /// Reachability checks against running servers
    pub server_api: Arc<dyn ServerApi>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Arc<Metrics>,
}

/// A custom resource driven by [`reconcile`].
#[async_trait]
pub trait Managed:
    StoreObject + HasSpec<Spec: Serialize + Send + Sync> + HasStatus<Status: ManagedStatus>
{
    /// Name of the configuration secret the spec points at; empty when unset.
    fn secret_name(&self) -> &str;

    /// Child resource stages in their fixed order, stopping at the first error.
    async fn run_stages<S: Store>(&mut self, ctx: &Context<S>) -> Result<()>;
}

/// How a single pass ended, when it did not end in a propagated error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The object is gone.
    NotFound,
    /// The revision hash moved; nothing else ran.
    RevisionChanged,
    /// A stage stopped the pass with a self-healing condition.
    Progressing(ErrorKind),
    /// A stage stopped the pass with a condition that needs outside action.
    Invalid(ErrorKind),
    /// Every stage passed.
    Converged,
}

impl Outcome {
    pub fn requeue(&self) -> bool {
        matches!(self, Outcome::RevisionChanged | Outcome::Progressing(_))
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Outcome::Progressing(k) | Outcome::Invalid(k) => Some(*k),
            _ => None,
        }
    }

    pub fn into_action(self, config: &Config) -> Action {
        if self.requeue() {
            Action::requeue(config.requeue())
        } else {
            Action::await_change()
        }
    }
}

/// One reconciliation pass for the object `namespace/name`.
#[instrument(skip(ctx), fields(kind = %K::kind(&())))]
pub async fn reconcile<K, S>(ctx: &Context<S>, namespace: &str, name: &str) -> Result<Outcome>
where
    K: Managed,
    S: Store,
{
    let kind = K::kind(&()).to_string();
    let _timer = ctx.metrics.reconcile.count_and_measure(&kind);
    ctx.diagnostics.write().await.last_event = Utc::now();

    let Some(mut obj) = ctx.store.get::<K>(namespace, name).await? else {
        debug!("{} \"{}\" is gone", kind, name);
        return Ok(Outcome::NotFound);
    };
    info!("Reconciling {} \"{}\" in {}", kind, name, namespace);

    let mut status = obj.status().cloned().unwrap_or_default();
    status.ensure_defaults();
    write_status(&ctx.store, &mut obj, status).await?;

    if revision_changed(ctx, &mut obj).await? {
        info!("{} \"{}\" changed revision", kind, name);
        ctx.metrics.reconcile.set_outcome(&kind, None);
        return Ok(Outcome::RevisionChanged);
    }

    let result = obj.run_stages(ctx).await;
    let mut status = obj.status().cloned().unwrap_or_default();
    let outcome = match result {
        Ok(()) => {
            retry::converged(&mut status);
            write_status(&ctx.store, &mut obj, status).await?;
            Outcome::Converged
        }
        Err(error) => match retry::apply(&mut status, &error) {
            Decision::Requeue => {
                info!("{} \"{}\" progressing: {}", kind, name, error);
                write_status(&ctx.store, &mut obj, status).await?;
                Outcome::Progressing(error.kind())
            }
            Decision::Invalid => {
                warn!("{} \"{}\" invalid: {}", kind, name, error);
                write_status(&ctx.store, &mut obj, status).await?;
                Outcome::Invalid(error.kind())
            }
            Decision::Propagate => return Err(error),
        },
    };
    ctx.metrics.reconcile.set_outcome(&kind, outcome.kind());
    Ok(outcome)
}

/// Writes back a spec field a stage has just defaulted.
///
/// Always ends the pass: the returned error is a spec-update on success, or
/// the store error.
pub async fn persist_default<K, S>(store: &S, obj: &mut K, field: &str) -> Error
where
    K: StoreObject,
    S: Store,
{
    match store.update(obj).await {
        Ok(updated) => {
            *obj = updated;
            info!("Defaulted {} of {} \"{}\"", field, K::kind(&()), obj.name_any());
            Error::spec_update(format!(
                "updated {} of {} {}",
                field,
                K::kind(&()).to_lowercase(),
                obj.name_any()
            ))
        }
        Err(e) => e,
    }
}

/// Compares the spec and secret digest with the stored one and persists a
/// new digest when they differ.
async fn revision_changed<K, S>(ctx: &Context<S>, obj: &mut K) -> Result<bool>
where
    K: Managed,
    S: Store,
{
    let secret = match obj.secret_name() {
        "" => None,
        secret_name => {
            let namespace = obj.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
            ctx.store.get::<Secret>(&namespace, secret_name).await?
        }
    };
    let hash = revision::compute(obj.spec(), secret.as_ref())?;

    let mut status = obj.status().cloned().unwrap_or_default();
    if status.revision_hash() == Some(hash.as_str()) {
        return Ok(false);
    }
    status.set_revision(hash);
    write_status(&ctx.store, obj, status).await?;
    Ok(true)
}
