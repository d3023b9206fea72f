use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{
        NodeAffinity, PersistentVolumeClaim, PodAffinity, PodAntiAffinity, ResourceRequirements,
        Secret, Service, ServiceAccount,
    },
};
use kube::{
    CustomResource, Resource,
    api::{Api, ListParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        reflector::ObjectRef,
        watcher::Config as WatcherConfig,
    },
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::*;

use crate::{
    Error, Result,
    engine::{self, Context, Managed},
    membership::Members,
    resources::{self, SERVER_LABEL, SERVER_SECRET_ANNOTATION},
    run::State,
    status::{Condition, ManagedStatus, Phase},
    store::{KubeStore, Store},
};

/// Generate the Kubernetes wrapper struct `SonarQubeServer` from our Spec and Status struct
///
/// One SonarQube process: a standalone instance, or a single search or
/// application member of a cluster.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    kind = "SonarQubeServer",
    group = "sonarsource.parflesh.github.io",
    version = "v1alpha1",
    namespaced
)]
#[kube(status = "SonarQubeServerStatus", shortname = "sqs")]
#[serde(rename_all = "camelCase")]
pub struct SonarQubeServerSpec {
    /// 0 stops the server, 1 runs it. Defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    /// Secret holding `sonar.properties` and `wrapper.conf`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret: String,
    #[serde(default)]
    pub role: Role,
    /// Addresses of the application nodes of the cluster
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
    /// Addresses of the search nodes of the cluster
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search_hosts: Vec<String>,
    #[serde(default)]
    pub deployment: Placement,
    #[serde(default)]
    pub storage: Storage,
}

/// What a server does inside a cluster
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// All in one, not clustered
    #[default]
    Aio,
    Application,
    Search,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Aio => "aio",
            Role::Application => "application",
            Role::Search => "search",
        }
    }

    pub fn is_clustered(&self) -> bool {
        !matches!(self, Role::Aio)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pod placement and resources
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_affinity: Option<NodeAffinity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_affinity: Option<PodAffinity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_anti_affinity: Option<PodAntiAffinity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Storage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data_size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_class: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub extensions_size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions_class: Option<String>,
}

/// Deployment condition types tracked in status
pub const DEPLOYMENT_CONDITIONS: [&str; 3] = ["Available", "Progressing", "ReplicaFailure"];

/// The status object of `SonarQubeServer`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SonarQubeServerStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub phase: Option<Phase>,
    #[serde(default)]
    pub reason: Option<String>,
    /// Name of the server's Service, set once it exists
    #[serde(default)]
    pub service: Option<String>,
    /// Deployment condition type to the names of deployments where it is true
    #[serde(default)]
    pub deployment: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub revision: i64,
    #[serde(default)]
    pub revision_hash: Option<String>,
}

impl ManagedStatus for SonarQubeServerStatus {
    fn conditions(&self) -> &Vec<Condition> {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }

    fn revision_hash(&self) -> Option<&str> {
        self.revision_hash.as_deref()
    }

    fn set_revision(&mut self, hash: String) {
        self.revision += 1;
        self.revision_hash = Some(hash);
    }

    fn set_phase(&mut self, phase: Phase, reason: Option<String>) {
        self.phase = Some(phase);
        self.reason = reason;
    }

    fn ensure_defaults(&mut self) {
        self.phase.get_or_insert_default();
        for t in DEPLOYMENT_CONDITIONS {
            self.deployment.entry(t.to_string()).or_default();
        }
    }
}

impl SonarQubeServer {
    /// Replica count, defaulting to running.
    pub fn size(&self) -> i32 {
        self.spec.size.unwrap_or(1)
    }

    /// Labels put on every child, on top of those inherited from the server itself.
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.metadata.labels.clone().unwrap_or_default();
        labels.extend(resources::standard_labels(&self.name_any(), self.spec.role.as_str()));
        labels.insert(SERVER_LABEL.to_string(), self.name_any());
        labels
    }

    /// Selector matching this server's pods only.
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(SERVER_LABEL.to_string(), self.name_any())])
    }

    /// Pod labels: the selector plus the server's own labels.
    pub fn pod_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.labels();
        labels.extend(self.selector_labels());
        labels
    }

    pub fn service_account_name(&self) -> String {
        self.spec
            .deployment
            .service_account
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.name_any())
    }

    pub fn data_claim_name(&self) -> String {
        format!("{}-data", self.name_any())
    }

    pub fn extensions_claim_name(&self) -> String {
        format!("{}-extensions", self.name_any())
    }
}

#[async_trait]
impl Managed for SonarQubeServer {
    fn secret_name(&self) -> &str {
        &self.spec.secret
    }

    async fn run_stages<S: Store>(&mut self, ctx: &Context<S>) -> Result<()> {
        super::stages::run(self, ctx).await
    }
}

#[instrument(skip(ctx, server))]
async fn reconcile(server: Arc<SonarQubeServer>, ctx: Arc<Context<KubeStore>>) -> Result<Action> {
    let ns = server.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
    let outcome = engine::reconcile::<SonarQubeServer, _>(&ctx, &ns, &server.name_any()).await?;
    Ok(outcome.into_action(&ctx.config))
}

fn error_policy(server: Arc<SonarQubeServer>, error: &Error, ctx: Arc<Context<KubeStore>>) -> Action {
    error!("reconcile of {} failed: {:?}", server.name_any(), error);
    ctx.metrics
        .reconcile
        .set_failure(&SonarQubeServer::kind(&()), &server.name_any(), error);
    Action::requeue(ctx.config.error_requeue())
}

/// Servers listed in the membership annotation of a shared secret.
fn servers_sharing(secret: Secret) -> Vec<ObjectRef<SonarQubeServer>> {
    let Some(ns) = secret.namespace() else {
        return vec![];
    };
    Members::from_annotation(&secret, SERVER_SECRET_ANNOTATION)
        .iter()
        .map(|name| ObjectRef::new(name).within(&ns))
        .collect()
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run_server(state: State, client: Client, config: Arc<crate::Config>) {
    let servers = Api::<SonarQubeServer>::all(client.clone());
    if let Err(e) = servers.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }
    let ctx = Arc::new(state.to_context(client.clone(), config));
    Controller::new(servers, WatcherConfig::default().any_semantic())
        .owns(Api::<Deployment>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<Service>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<PersistentVolumeClaim>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<ServiceAccount>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<Secret>::all(client.clone()), WatcherConfig::default())
        .watches(Api::<Secret>::all(client.clone()), WatcherConfig::default(), servers_sharing)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("reconciled {}", obj.name),
                Err(e) => debug!("reconcile stream error: {}", e),
            }
        })
        .await;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_defaults_fill_deployment_map() {
        let mut status = SonarQubeServerStatus::default();
        status.ensure_defaults();
        assert_eq!(status.phase, Some(Phase::Pending));
        assert_eq!(status.deployment.len(), 3);
        assert!(status.deployment["ReplicaFailure"].is_empty());
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_value(Role::Search).unwrap(), "search");
        let spec: SonarQubeServerSpec = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(spec.role, Role::Aio);
    }

    #[test]
    fn pod_labels_keep_inherited_cluster_labels() {
        let server = SonarQubeServer::test()
            .with_role(Role::Application)
            .with_label(resources::SONARQUBE_LABEL, "sq");
        let labels = server.pod_labels();
        assert_eq!(labels[resources::SONARQUBE_LABEL], "sq");
        assert_eq!(labels[resources::APP_COMPONENT], "application");
        assert_eq!(labels[SERVER_LABEL], "test");
    }

    #[test]
    fn shared_secret_maps_to_members() {
        let mut secret = Secret::default();
        secret.metadata.namespace = Some("default".into());
        let mut m = Members::default();
        m.add("a");
        m.add("b");
        m.store_on(&mut secret, SERVER_SECRET_ANNOTATION);
        let refs = servers_sharing(secret);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].name, "a");
        assert_eq!(refs[1].namespace.as_deref(), Some("default"));
    }
}
