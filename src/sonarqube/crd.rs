use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{
    NodeAffinity, PodAffinity, PodAntiAffinity, ResourceRequirements, Secret, Service, ServiceAccount,
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
    Error, Placement, Result, Role, SonarQubeServer, Storage,
    engine::{self, Context, Managed},
    membership::Members,
    resources::{self, APP_COMPONENT, APP_PART_OF, SECRET_ANNOTATION, SONARQUBE_LABEL},
    run::State,
    status::{Condition, ManagedStatus, Phase},
    store::{KubeStore, Store},
};

/// Number of search nodes every cluster runs
pub const SEARCH_NODES: i32 = 3;

/// Generate the Kubernetes wrapper struct `SonarQube` from our Spec and Status struct
///
/// A clustered SonarQube: three search nodes and `size` application nodes,
/// each one a `SonarQubeServer` owned by the cluster.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    kind = "SonarQube",
    group = "sonarsource.parflesh.github.io",
    version = "v1alpha1",
    namespaced
)]
#[kube(status = "SonarQubeStatus", shortname = "sq")]
#[serde(rename_all = "camelCase")]
pub struct SonarQubeSpec {
    /// Number of application nodes. Defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    /// Secret holding `sonar.properties` and `wrapper.conf`, shared by every node
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret: String,
    #[serde(default)]
    pub shutdown: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    /// Placement and storage of application nodes
    #[serde(default)]
    pub node: PodConfig,
    /// Placement and storage of search nodes
    #[serde(default)]
    pub node_search: PodConfig,
}

/// Placement and storage for the nodes of one role
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodConfig {
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
    #[serde(flatten)]
    pub storage: Storage,
}

impl PodConfig {
    pub fn placement(&self, service_account: String) -> Placement {
        Placement {
            node_selector: self.node_selector.clone(),
            node_affinity: self.node_affinity.clone(),
            pod_affinity: self.pod_affinity.clone(),
            pod_anti_affinity: self.pod_anti_affinity.clone(),
            priority_class: self.priority_class.clone(),
            resources: self.resources.clone(),
            service_account: Some(service_account),
        }
    }
}

/// The status object of `SonarQube`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SonarQubeStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub phase: Option<Phase>,
    #[serde(default)]
    pub reason: Option<String>,
    /// Deployment conditions of the application nodes
    #[serde(default)]
    pub pods: BTreeMap<String, Vec<String>>,
    /// Deployment conditions of the search nodes
    #[serde(default)]
    pub search_pods: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub revision: i64,
    #[serde(default)]
    pub revision_hash: Option<String>,
}

impl ManagedStatus for SonarQubeStatus {
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
        for t in crate::DEPLOYMENT_CONDITIONS {
            self.pods.entry(t.to_string()).or_default();
            self.search_pods.entry(t.to_string()).or_default();
        }
    }
}

impl SonarQube {
    /// Number of application nodes.
    pub fn size(&self) -> i32 {
        self.spec.size.unwrap_or(1)
    }

    /// Labels of the cluster's own children.
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.metadata.labels.clone().unwrap_or_default();
        labels.extend(resources::standard_labels(&self.name_any(), "cluster"));
        labels.insert(SONARQUBE_LABEL.to_string(), self.name_any());
        labels
    }

    /// Labels of a member node of `role`.
    pub fn node_labels(&self, role: Role) -> BTreeMap<String, String> {
        let mut labels = self.labels();
        labels.insert(APP_COMPONENT.to_string(), role.as_str().to_string());
        labels.insert(APP_PART_OF.to_string(), self.name_any());
        labels
    }

    /// Selects the application nodes, and through inheritance their pods.
    pub fn application_selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (SONARQUBE_LABEL.to_string(), self.name_any()),
            (APP_COMPONENT.to_string(), Role::Application.as_str().to_string()),
        ])
    }

    pub fn node_name(&self, role: Role, index: i32) -> String {
        format!("{}-{}-{}", self.name_any(), role, index)
    }

    pub fn service_account_name(&self) -> String {
        self.spec
            .service_account
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.name_any())
    }

    pub fn pod_config(&self, role: Role) -> &PodConfig {
        match role {
            Role::Search => &self.spec.node_search,
            _ => &self.spec.node,
        }
    }
}

#[async_trait]
impl Managed for SonarQube {
    fn secret_name(&self) -> &str {
        &self.spec.secret
    }

    async fn run_stages<S: Store>(&mut self, ctx: &Context<S>) -> Result<()> {
        super::stages::run(self, ctx).await
    }
}

#[instrument(skip(ctx, sq))]
async fn reconcile(sq: Arc<SonarQube>, ctx: Arc<Context<KubeStore>>) -> Result<Action> {
    let ns = sq.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
    let outcome = engine::reconcile::<SonarQube, _>(&ctx, &ns, &sq.name_any()).await?;
    Ok(outcome.into_action(&ctx.config))
}

fn error_policy(sq: Arc<SonarQube>, error: &Error, ctx: Arc<Context<KubeStore>>) -> Action {
    error!("reconcile of {} failed: {:?}", sq.name_any(), error);
    ctx.metrics
        .reconcile
        .set_failure(&SonarQube::kind(&()), &sq.name_any(), error);
    Action::requeue(ctx.config.error_requeue())
}

/// Clusters listed in the membership annotation of a shared secret.
fn clusters_sharing(secret: Secret) -> Vec<ObjectRef<SonarQube>> {
    let Some(ns) = secret.namespace() else {
        return vec![];
    };
    Members::from_annotation(&secret, SECRET_ANNOTATION)
        .iter()
        .map(|name| ObjectRef::new(name).within(&ns))
        .collect()
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run_sonarqube(state: State, client: Client, config: Arc<crate::Config>) {
    let clusters = Api::<SonarQube>::all(client.clone());
    if let Err(e) = clusters.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }
    let ctx = Arc::new(state.to_context(client.clone(), config));
    Controller::new(clusters, WatcherConfig::default().any_semantic())
        .owns(Api::<SonarQubeServer>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<Service>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<ServiceAccount>::all(client.clone()), WatcherConfig::default())
        .owns(Api::<Secret>::all(client.clone()), WatcherConfig::default())
        .watches(Api::<Secret>::all(client.clone()), WatcherConfig::default(), clusters_sharing)
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
