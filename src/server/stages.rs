//! Child resources of a single `SonarQubeServer`, in the order they depend
//! on each other: configuration, identity, network, storage, workload.
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tracing::*;

use crate::{
    Error, Result, Role, SonarQubeServer,
    api_client::Endpoint,
    engine::{Context, persist_default},
    resources::{
        SERVER_SECRET_ANNOTATION, WEB_PORT, deployment, image_reference, pvc, secret, service,
        service_account,
    },
    status::write_status,
    store::Store,
};

pub async fn run<S: Store>(server: &mut SonarQubeServer, ctx: &Context<S>) -> Result<()> {
    ensure_secret(server, ctx).await?;
    ensure_service_account(server, ctx).await?;
    let svc = ensure_service(server, ctx).await?;
    ensure_claims(server, ctx).await?;
    ensure_deployment(server, ctx, &svc).await?;
    check_reachable(server, ctx, &svc).await
}

async fn ensure_secret<S: Store>(server: &mut SonarQubeServer, ctx: &Context<S>) -> Result<()> {
    if server.spec.secret.is_empty() {
        server.spec.secret = secret::default_name(&server.name_any());
        return Err(persist_default(&ctx.store, server, "secret").await);
    }
    let desired = secret::synthesize(&*server, &server.spec.secret, &server.labels())?;
    secret::ensure(&ctx.store, &*server, &desired, SERVER_SECRET_ANNOTATION).await?;
    Ok(())
}

async fn ensure_service_account<S: Store>(server: &SonarQubeServer, ctx: &Context<S>) -> Result<()> {
    let desired = service_account::synthesize(server, &server.service_account_name(), &server.labels())?;
    service_account::ensure(&ctx.store, &desired).await?;
    Ok(())
}

async fn ensure_service<S: Store>(server: &mut SonarQubeServer, ctx: &Context<S>) -> Result<Service> {
    let desired = service::synthesize(
        &*server,
        &server.name_any(),
        &server.labels(),
        &server.selector_labels(),
        deployment::ports(server.spec.role),
    )?;
    let svc = service::ensure(&ctx.store, &desired).await?;

    let mut status = server.status.clone().unwrap_or_default();
    status.service = Some(svc.name_any());
    write_status(&ctx.store, server, status).await?;
    Ok(svc)
}

async fn ensure_claims<S: Store>(server: &mut SonarQubeServer, ctx: &Context<S>) -> Result<()> {
    let storage = &mut server.spec.storage;
    if storage.data_size.is_empty() {
        storage.data_size = ctx.config.default_volume_size.clone();
        return Err(persist_default(&ctx.store, server, "data size").await);
    }
    if storage.extensions_size.is_empty() {
        storage.extensions_size = ctx.config.default_volume_size.clone();
        return Err(persist_default(&ctx.store, server, "extensions size").await);
    }

    let storage = &server.spec.storage;
    let labels = server.labels();
    let claims = [
        (server.data_claim_name(), &storage.data_size, storage.data_class.as_ref()),
        (
            server.extensions_claim_name(),
            &storage.extensions_size,
            storage.extensions_class.as_ref(),
        ),
    ];
    for (name, size, class) in claims {
        let desired = pvc::synthesize(&*server, &name, &labels, size, class)?;
        pvc::ensure(&ctx.store, &desired).await?;
    }
    Ok(())
}

async fn ensure_deployment<S: Store>(
    server: &mut SonarQubeServer,
    ctx: &Context<S>,
    svc: &Service,
) -> Result<()> {
    let size = server.size();
    if !(0..=1).contains(&size) {
        return Err(Error::spec_invalid(format!("size must be 0 or 1, got {size}")));
    }
    if server.spec.image.is_empty() {
        server.spec.image = ctx.config.default_image.clone();
        return Err(persist_default(&ctx.store, server, "image").await);
    }

    let own_address = service::address(svc);
    if server.spec.role.is_clustered() && own_address.is_none() {
        return Err(Error::resource_waiting(format!(
            "waiting for service {} to get an address",
            svc.name_any()
        )));
    }

    let image = image_reference(&server.spec.image, &server.spec.version);
    let desired = deployment::synthesize(&*server, image, own_address)?;
    let observed = deployment::ensure(&ctx.store, &desired).await?;

    let conditions = deployment::status_map(&observed);
    let mut status = server.status.clone().unwrap_or_default();
    status.deployment = conditions.clone();
    write_status(&ctx.store, server, status).await?;

    let has = |t: &str| conditions.get(t).is_some_and(|names| !names.is_empty());
    if has("ReplicaFailure") {
        return Err(Error::resource_invalid(format!(
            "deployment {} has a replica failure",
            observed.name_any()
        )));
    }
    if size > 0 && !has("Available") {
        return Err(Error::resource_waiting(format!(
            "waiting for deployment {} to become available",
            observed.name_any()
        )));
    }
    Ok(())
}

async fn check_reachable<S: Store>(server: &SonarQubeServer, ctx: &Context<S>, svc: &Service) -> Result<()> {
    if !ctx.config.ping_servers || server.size() == 0 || server.spec.role == Role::Search {
        return Ok(());
    }
    let waiting = |why: String| Error::resource_waiting(format!("{} is not reachable: {why}", server.name_any()));
    let address = service::address(svc).ok_or_else(|| waiting("no service address".into()))?;
    let endpoint = Endpoint {
        namespace: server.namespace().ok_or(Error::MissingObjectKey("namespace"))?,
        service: svc.name_any(),
        address: address.to_string(),
        port: WEB_PORT,
    };
    ctx.server_api.ping(&endpoint).await.map_err(|e| {
        debug!("ping of {} failed: {e}", endpoint.base_url());
        waiting(e.to_string())
    })
}
