//! Peer address propagation and start-up ordering across cluster members.
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tracing::*;

use crate::{
    Error, Result, Role, SonarQube, SonarQubeServer,
    drift::sync,
    engine::Context,
    resources::service,
    store::Store,
};

use super::servers::Nodes;

/// Cluster addresses of the members' services, sorted.
async fn addresses<S: Store>(ctx: &Context<S>, members: &[SonarQubeServer]) -> Result<Vec<String>> {
    let mut addresses = Vec::with_capacity(members.len());
    for member in members {
        let namespace = member.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
        let name = member
            .status
            .as_ref()
            .and_then(|s| s.service.clone())
            .unwrap_or_else(|| member.name_any());
        let svc = ctx.store.get::<Service>(&namespace, &name).await?;
        match svc.as_ref().and_then(service::address) {
            Some(address) => addresses.push(address.to_string()),
            None => {
                return Err(Error::resource_waiting(format!(
                    "waiting for service {name} to get an address"
                )));
            }
        }
    }
    addresses.sort();
    Ok(addresses)
}

/// Writes the peer lists into the first member whose lists differ.
pub async fn assemble<S: Store>(ctx: &Context<S>, nodes: &Nodes) -> Result<()> {
    let search = addresses(ctx, &nodes.search).await?;
    let application = addresses(ctx, &nodes.application).await?;

    for node in nodes.iter() {
        let mut updated = node.clone();
        let mut changed = sync(&mut updated.spec.search_hosts, &search);
        if node.spec.role == Role::Application {
            changed |= sync(&mut updated.spec.hosts, &application);
        }
        if changed {
            info!("Updating peers of {}", node.name_any());
            ctx.store.update(&updated).await?;
            return Err(Error::resource_update(format!(
                "updated hosts of sonarqubeserver {}",
                node.name_any()
            )));
        }
    }
    Ok(())
}

/// Starts members one at a time, every search member before any application member.
pub async fn sequence<S: Store>(sq: &SonarQube, ctx: &Context<S>, nodes: &Nodes) -> Result<()> {
    if sq.spec.shutdown {
        return shutdown(sq, nodes);
    }
    for group in [&nodes.search, &nodes.application] {
        let Some(stopped) = group.iter().find(|n| n.size() != 1) else {
            continue;
        };
        let mut started = stopped.clone();
        started.spec.size = Some(1);
        info!("Starting {}", stopped.name_any());
        ctx.store.update(&started).await?;
        return Err(Error::resource_update(format!(
            "started sonarqubeserver {}",
            stopped.name_any()
        )));
    }
    Ok(())
}

/// Leaves member replicas untouched while shutdown is requested.
fn shutdown(sq: &SonarQube, nodes: &Nodes) -> Result<()> {
    debug!(
        "shutdown requested for {}; {} members left as they are",
        sq.name_any(),
        nodes.iter().count()
    );
    Ok(())
}
