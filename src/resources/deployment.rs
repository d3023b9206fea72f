use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy},
        core::v1::{
            Affinity, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
            HTTPGetAction, ObjectFieldSelector, PersistentVolumeClaimVolumeSource, PodSpec,
            PodTemplateSpec, Probe, SecretVolumeSource, TCPSocketAction, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::{
        apis::meta::v1::{LabelSelector, ObjectMeta},
        util::intstr::IntOrString,
    },
};
use kube::ResourceExt;

use crate::{
    DEPLOYMENT_CONDITIONS, Result, Role, SonarQubeServer,
    drift::{Check, Drift, find_or_create, first_drift, sync, verify_and_correct},
    resources::{
        APP_VERSION, CE_PORT, NODE_PORT, SEARCH_PORT, WEB_PORT, child_meta, service::NamedPort,
    },
    store::Store,
};

pub const WEB: NamedPort = NamedPort { name: "web", port: WEB_PORT };
pub const CE: NamedPort = NamedPort { name: "ce", port: CE_PORT };
pub const NODE: NamedPort = NamedPort { name: "node", port: NODE_PORT };
pub const SEARCH: NamedPort = NamedPort { name: "search", port: SEARCH_PORT };

const HOME: &str = "/opt/sonarqube";
const TERMINATION_GRACE_SECONDS: i64 = 3600;
/// Label values are capped at 63 characters; a hash prefix is enough to tell revisions apart.
const REVISION_LABEL_LEN: usize = 16;

/// Value of the version label for the server's current revision hash.
pub fn revision_label(server: &SonarQubeServer) -> Option<String> {
    let hash = server.status.as_ref()?.revision_hash.as_deref()?;
    Some(hash.chars().take(REVISION_LABEL_LEN).collect())
}

/// Ports a server of `role` listens on.
pub fn ports(role: Role) -> &'static [NamedPort] {
    match role {
        Role::Aio => &[WEB],
        Role::Application => &[WEB, CE, NODE],
        Role::Search => &[SEARCH],
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn pod_ip(name: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: Some("v1".into()),
                field_path: "status.podIP".into(),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// `hosts`, with `own` appended when it is known and not already listed.
fn with_own(hosts: &[String], own: Option<&str>) -> String {
    let mut hosts = hosts.to_vec();
    if let Some(own) = own {
        if !hosts.iter().any(|h| h == own) {
            hosts.push(own.to_string());
        }
    }
    hosts.join(",")
}

/// Environment of the SonarQube container. `own_address` is the address of
/// the server's own Service.
pub fn environment(server: &SonarQubeServer, own_address: Option<&str>) -> Vec<EnvVar> {
    let role = server.spec.role;
    let mut vars = vec![
        env("SONAR_WEB_PORT", WEB_PORT.to_string()),
        env("SONAR_PATH_DATA", format!("{HOME}/data")),
        env("SONAR_PATH_LOGS", format!("{HOME}/logs")),
        env("SONAR_PATH_TEMP", format!("{HOME}/temp")),
    ];
    if role.is_clustered() {
        let search_own = (role == Role::Search).then_some(own_address).flatten();
        vars.push(env("SONAR_CLUSTER_ENABLED", "true"));
        vars.push(env("SONAR_CLUSTER_NODE_TYPE", role.as_str()));
        vars.push(env(
            "SONAR_CLUSTER_SEARCH_HOSTS",
            with_own(&server.spec.search_hosts, search_own),
        ));
        if role == Role::Application {
            vars.push(env("SONAR_CLUSTER_HOSTS", with_own(&server.spec.hosts, own_address)));
        }
        vars.push(env("SONAR_CLUSTER_NODE_NAME", server.name_any()));
        vars.push(pod_ip("SONAR_CLUSTER_NODE_HOST"));
    }
    if role == Role::Search {
        vars.push(pod_ip("SONAR_SEARCH_HOST"));
    }
    vars
}

fn probe_timing(initial_delay: i32) -> Probe {
    Probe {
        initial_delay_seconds: Some(initial_delay),
        timeout_seconds: Some(1),
        period_seconds: Some(10),
        success_threshold: Some(1),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

fn tcp(port: i32) -> Option<TCPSocketAction> {
    Some(TCPSocketAction {
        port: IntOrString::Int(port),
        ..Default::default()
    })
}

pub fn liveness_probe(role: Role) -> Probe {
    let port = if role == Role::Search { SEARCH_PORT } else { WEB_PORT };
    Probe {
        tcp_socket: tcp(port),
        ..probe_timing(60)
    }
}

pub fn readiness_probe(role: Role) -> Probe {
    match role {
        Role::Search => Probe {
            tcp_socket: tcp(SEARCH_PORT),
            ..probe_timing(0)
        },
        _ => Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/api/system/status".into()),
                port: IntOrString::Int(WEB_PORT),
                scheme: Some("HTTP".into()),
                ..Default::default()
            }),
            ..probe_timing(0)
        },
    }
}

fn claim(name: &str, claim_name: String) -> Volume {
    Volume {
        name: name.into(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.into(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn mount(name: &str, path: String) -> VolumeMount {
    VolumeMount {
        name: name.into(),
        mount_path: path,
        ..Default::default()
    }
}

/// Single replica-set of the SonarQube container, recreated on every change.
pub fn synthesize(server: &SonarQubeServer, image: String, own_address: Option<&str>) -> Result<Deployment> {
    let name = server.name_any();
    let role = server.spec.role;
    let placement = &server.spec.deployment;

    let container = Container {
        name: "sonarqube".into(),
        image: Some(image),
        image_pull_policy: Some("Always".into()),
        env: Some(environment(server, own_address)),
        ports: Some(
            ports(role)
                .iter()
                .map(|p| ContainerPort {
                    name: Some(p.name.into()),
                    container_port: p.port,
                    protocol: Some("TCP".into()),
                    ..Default::default()
                })
                .collect(),
        ),
        liveness_probe: Some(liveness_probe(role)),
        readiness_probe: Some(readiness_probe(role)),
        resources: placement.resources.clone(),
        volume_mounts: Some(vec![
            mount("data", format!("{HOME}/data")),
            mount("extensions", format!("{HOME}/extensions")),
            mount("logs", format!("{HOME}/logs")),
            mount("temp", format!("{HOME}/temp")),
            mount("conf", format!("{HOME}/conf/")),
        ]),
        ..Default::default()
    };

    let affinity = (placement.node_affinity.is_some()
        || placement.pod_affinity.is_some()
        || placement.pod_anti_affinity.is_some())
    .then(|| Affinity {
        node_affinity: placement.node_affinity.clone(),
        pod_affinity: placement.pod_affinity.clone(),
        pod_anti_affinity: placement.pod_anti_affinity.clone(),
    });

    let mut labels = server.labels();
    if let Some(revision) = revision_label(server) {
        labels.insert(APP_VERSION.to_string(), revision);
    }

    Ok(Deployment {
        metadata: child_meta(server, &name, &labels)?,
        spec: Some(DeploymentSpec {
            replicas: Some(server.size()),
            selector: LabelSelector {
                match_labels: Some(server.selector_labels()),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".into()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(server.pod_labels()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    service_account_name: Some(server.service_account_name()),
                    node_selector: placement.node_selector.clone(),
                    affinity,
                    priority_class_name: placement.priority_class.clone(),
                    termination_grace_period_seconds: Some(TERMINATION_GRACE_SECONDS),
                    volumes: Some(vec![
                        claim("data", server.data_claim_name()),
                        claim("extensions", server.extensions_claim_name()),
                        empty_dir("logs"),
                        empty_dir("temp"),
                        Volume {
                            name: "conf".into(),
                            secret: Some(SecretVolumeSource {
                                secret_name: Some(server.spec.secret.clone()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn container_mut(d: &mut Deployment) -> Option<&mut Container> {
    d.spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .and_then(|p| p.containers.first_mut())
}

fn container(d: &Deployment) -> Option<&Container> {
    d.spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.first())
}

/// Env vars compared as a set of (name, value, source); order does not matter.
fn same_env(a: &[EnvVar], b: &[EnvVar]) -> bool {
    a.len() == b.len() && a.iter().all(|v| b.contains(v)) && b.iter().all(|v| a.contains(v))
}

fn sync_container<T: PartialEq + Clone>(
    s: &mut Deployment,
    d: &Deployment,
    field: fn(&mut Container) -> &mut T,
) -> bool {
    let (Some(want), Some(have)) = (container(d), container_mut(s)) else {
        return false;
    };
    let mut want = want.clone();
    sync(field(have), field(&mut want))
}

impl Drift for Deployment {
    fn correct(&self, desired: &Self) -> Option<(Self, &'static str)> {
        let checks: [Check<Deployment>; 6] = [
            ("replicas", |s, d| {
                let want = d.spec.as_ref().and_then(|x| x.replicas);
                s.spec.as_mut().is_some_and(|spec| sync(&mut spec.replicas, &want))
            }),
            ("env", |s, d| {
                let want = container(d).and_then(|c| c.env.clone()).unwrap_or_default();
                match container_mut(s) {
                    Some(c) if !same_env(c.env.as_deref().unwrap_or_default(), &want) => {
                        c.env = Some(want);
                        true
                    }
                    _ => false,
                }
            }),
            ("readiness probe", |s, d| sync_container(s, d, |c| &mut c.readiness_probe)),
            ("liveness probe", |s, d| sync_container(s, d, |c| &mut c.liveness_probe)),
            ("ports", |s, d| sync_container(s, d, |c| &mut c.ports)),
            ("version label", |s, d| {
                let Some(want) = d.labels().get(APP_VERSION).cloned() else {
                    return false;
                };
                let labels = s.labels_mut();
                if labels.get(APP_VERSION) == Some(&want) {
                    return false;
                }
                labels.insert(APP_VERSION.to_string(), want);
                true
            }),
        ];
        first_drift(self, desired, &checks)
    }
}

/// Finds or creates the deployment and corrects one drifted field group.
pub async fn ensure<S: Store>(store: &S, desired: &Deployment) -> Result<Deployment> {
    let observed = find_or_create(store, desired).await?.existing()?;
    verify_and_correct(store, observed, desired).await
}

/// Deployment condition type to `[name]` for each tracked condition that is true.
pub fn status_map(deployment: &Deployment) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = DEPLOYMENT_CONDITIONS
        .iter()
        .map(|t| (t.to_string(), vec![]))
        .collect();
    let conditions = deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .into_iter()
        .flatten();
    for c in conditions.filter(|c| c.status == "True") {
        if let Some(names) = map.get_mut(&c.type_) {
            names.push(deployment.name_any());
        }
    }
    map
}
