//! The set of `SonarQubeServer` members of a cluster.
use std::collections::BTreeMap;

use kube::ResourceExt;
use tracing::*;

use crate::{
    Config, DEPLOYMENT_CONDITIONS, Error, Result, Role, SonarQube, SonarQubeServer,
    SonarQubeServerSpec,
    drift::{Check, Drift, find_or_create, first_drift, sync, verify_and_correct},
    engine::Context,
    resources::{SERVER_SECRET_ANNOTATION, child_meta, is_owner, secret},
    status::{ConditionType, Conditions, write_status},
    store::Store,
};

use super::crd::SEARCH_NODES;

/// Observed members, each list in index order.
pub struct Nodes {
    pub search: Vec<SonarQubeServer>,
    pub application: Vec<SonarQubeServer>,
}

impl Nodes {
    pub fn iter(&self) -> impl Iterator<Item = &SonarQubeServer> {
        self.search.iter().chain(&self.application)
    }
}

/// Desired member `index` of `role`. New members start stopped; the
/// sequencer brings them up.
pub fn synthesize(sq: &SonarQube, role: Role, index: i32, config: &Config) -> Result<SonarQubeServer> {
    let pod = sq.pod_config(role);
    let image = match sq.spec.image.as_str() {
        "" => config.default_image.clone(),
        image => image.to_string(),
    };
    let spec = SonarQubeServerSpec {
        size: Some(0),
        version: sq.spec.version.clone(),
        image,
        secret: sq.spec.secret.clone(),
        role,
        deployment: pod.placement(sq.service_account_name()),
        storage: pod.storage.clone(),
        ..Default::default()
    };
    let name = sq.node_name(role, index);
    let mut server = SonarQubeServer::new(&name, spec);
    server.metadata = child_meta(sq, &name, &sq.node_labels(role))?;
    Ok(server)
}

impl Drift for SonarQubeServer {
    fn correct(&self, desired: &Self) -> Option<(Self, &'static str)> {
        let checks: [Check<SonarQubeServer>; 4] = [
            ("secret", |s, d| sync(&mut s.spec.secret, &d.spec.secret)),
            ("role", |s, d| sync(&mut s.spec.role, &d.spec.role)),
            ("image", |s, d| sync(&mut s.spec.image, &d.spec.image)),
            ("version", |s, d| sync(&mut s.spec.version, &d.spec.version)),
        ];
        first_drift(self, desired, &checks)
    }
}

/// Creates missing members, removes surplus application members, corrects
/// member drift, and waits until every member is healthy.
pub async fn ensure<S: Store>(sq: &mut SonarQube, ctx: &Context<S>) -> Result<Nodes> {
    let mut desired = vec![];
    for index in 0..SEARCH_NODES {
        desired.push(synthesize(sq, Role::Search, index, &ctx.config)?);
    }
    for index in 0..sq.size() {
        desired.push(synthesize(sq, Role::Application, index, &ctx.config)?);
    }

    let mut observed = vec![];
    for node in &desired {
        observed.push(find_or_create(&ctx.store, node).await?.existing()?);
    }
    remove_surplus(sq, ctx, &desired).await?;
    for (node, want) in observed.iter().zip(&desired) {
        verify_and_correct(&ctx.store, node.clone(), want).await?;
    }

    let (search, application): (Vec<_>, Vec<_>) =
        observed.into_iter().partition(|n| n.spec.role == Role::Search);
    let nodes = Nodes { search, application };

    let mut status = sq.status.clone().unwrap_or_default();
    status.pods = fold_deployments(&nodes.application);
    status.search_pods = fold_deployments(&nodes.search);
    write_status(&ctx.store, sq, status).await?;

    for node in nodes.iter() {
        check_health(node)?;
    }
    Ok(nodes)
}

async fn remove_surplus<S: Store>(sq: &SonarQube, ctx: &Context<S>, desired: &[SonarQubeServer]) -> Result<()> {
    let namespace = sq.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
    let mut members: Vec<SonarQubeServer> = ctx
        .store
        .list(&namespace, &sq.application_selector())
        .await?;
    members.sort_by_key(|m| m.name_any());

    let wanted = |m: &SonarQubeServer| desired.iter().any(|d| d.name_any() == m.name_any());
    let Some(surplus) = members.iter().find(|m| is_owner(sq, *m) && !wanted(*m)) else {
        return Ok(());
    };
    info!("Removing {} from cluster {}", surplus.name_any(), sq.name_any());
    ctx.store
        .delete::<SonarQubeServer>(&namespace, &surplus.name_any())
        .await?;
    if !surplus.spec.secret.is_empty() {
        secret::release(
            &ctx.store,
            &namespace,
            &surplus.spec.secret,
            SERVER_SECRET_ANNOTATION,
            &surplus.name_any(),
        )
        .await?;
    }
    Err(Error::resource_update(format!(
        "deleted sonarqubeserver {}",
        surplus.name_any()
    )))
}

/// Merges the deployment condition maps of `nodes`.
pub fn fold_deployments(nodes: &[SonarQubeServer]) -> BTreeMap<String, Vec<String>> {
    let mut folded: BTreeMap<String, Vec<String>> = DEPLOYMENT_CONDITIONS
        .iter()
        .map(|t| (t.to_string(), vec![]))
        .collect();
    for status in nodes.iter().filter_map(|n| n.status.as_ref()) {
        for (condition, names) in &status.deployment {
            folded
                .entry(condition.clone())
                .or_default()
                .extend(names.iter().cloned());
        }
    }
    folded
}

fn check_health(node: &SonarQubeServer) -> Result<()> {
    let name = node.name_any();
    let Some(status) = node.status.as_ref() else {
        return Err(Error::resource_waiting(format!("waiting for sonarqubeserver {name}")));
    };
    if status.conditions.is_true(ConditionType::Invalid) {
        return Err(Error::resource_invalid(format!("sonarqubeserver {name} is invalid")));
    }
    if status.service.as_deref().unwrap_or_default().is_empty() {
        return Err(Error::resource_waiting(format!(
            "waiting for the service of sonarqubeserver {name}"
        )));
    }
    if !status.conditions.is_false(ConditionType::Progressing) {
        return Err(Error::resource_waiting(format!("waiting for sonarqubeserver {name}")));
    }
    Ok(())
}
