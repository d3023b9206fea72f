use kube::ResourceExt;

use crate::{
    Result, SonarQube,
    engine::{Context, persist_default},
    resources::{SECRET_ANNOTATION, WEB_PORT, secret, service, service::NamedPort, service_account},
    store::Store,
};

use super::{servers, topology};

const HTTP: NamedPort = NamedPort { name: "http", port: WEB_PORT };

pub async fn run<S: Store>(sq: &mut SonarQube, ctx: &Context<S>) -> Result<()> {
    ensure_secret(sq, ctx).await?;
    ensure_service_account(sq, ctx).await?;
    ensure_service(sq, ctx).await?;
    let nodes = servers::ensure(sq, ctx).await?;
    topology::assemble(ctx, &nodes).await?;
    topology::sequence(sq, ctx, &nodes).await
}

async fn ensure_secret<S: Store>(sq: &mut SonarQube, ctx: &Context<S>) -> Result<()> {
    if sq.spec.secret.is_empty() {
        sq.spec.secret = secret::default_name(&sq.name_any());
        return Err(persist_default(&ctx.store, sq, "secret").await);
    }
    let desired = secret::synthesize(&*sq, &sq.spec.secret, &sq.labels())?;
    let observed = secret::ensure(&ctx.store, &*sq, &desired, SECRET_ANNOTATION).await?;
    secret::verify_cluster_properties(&ctx.store, &observed).await
}

async fn ensure_service_account<S: Store>(sq: &SonarQube, ctx: &Context<S>) -> Result<()> {
    let desired = service_account::synthesize(sq, &sq.service_account_name(), &sq.labels())?;
    service_account::ensure(&ctx.store, &desired).await?;
    Ok(())
}

async fn ensure_service<S: Store>(sq: &SonarQube, ctx: &Context<S>) -> Result<()> {
    let desired = service::synthesize(
        sq,
        &sq.name_any(),
        &sq.labels(),
        &sq.application_selector(),
        &[HTTP],
    )?;
    service::ensure(&ctx.store, &desired).await?;
    Ok(())
}
