use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{Service, ServicePort, ServiceSpec},
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::Resource;

use crate::{
    Result,
    drift::{Check, Drift, find_or_create, first_drift, sync, verify_and_correct},
    resources::child_meta,
    store::Store,
};

/// A named TCP port, used for both container and service ports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NamedPort {
    pub name: &'static str,
    pub port: i32,
}

impl NamedPort {
    pub fn service_port(&self) -> ServicePort {
        ServicePort {
            name: Some(self.name.into()),
            port: self.port,
            target_port: Some(IntOrString::Int(self.port)),
            protocol: Some("TCP".into()),
            ..Default::default()
        }
    }
}

/// ClusterIP service in front of the pods matching `selector`.
pub fn synthesize<K: Resource<DynamicType = ()>>(
    owner: &K,
    name: &str,
    labels: &BTreeMap<String, String>,
    selector: &BTreeMap<String, String>,
    ports: &[NamedPort],
) -> Result<Service> {
    Ok(Service {
        metadata: child_meta(owner, name, labels)?,
        spec: Some(ServiceSpec {
            selector: Some(selector.clone()),
            ports: Some(ports.iter().map(NamedPort::service_port).collect()),
            type_: Some("ClusterIP".into()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Cluster address assigned to the service, if any.
pub fn address(service: &Service) -> Option<&str> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.cluster_ip.as_deref())
        .filter(|ip| !ip.is_empty() && *ip != "None")
}

fn spec_mut(s: &mut Service) -> &mut ServiceSpec {
    s.spec.get_or_insert_with(Default::default)
}

fn spec_of(s: &Service) -> ServiceSpec {
    s.spec.clone().unwrap_or_default()
}

impl Drift for Service {
    fn correct(&self, desired: &Self) -> Option<(Self, &'static str)> {
        let checks: [Check<Service>; 4] = [
            ("selector", |s, d| sync(&mut spec_mut(s).selector, &spec_of(d).selector)),
            ("ports", |s, d| ports_drifted(spec_mut(s), &spec_of(d).ports)),
            ("type", |s, d| sync(&mut spec_mut(s).type_, &spec_of(d).type_)),
            ("labels", |s, d| sync(&mut s.metadata.labels, &d.metadata.labels)),
        ];
        first_drift(self, desired, &checks)
    }
}

/// Compares ports on the fields the operator sets, so values the API server
/// fills in (node ports, app protocol) do not count as drift.
fn ports_drifted(spec: &mut ServiceSpec, desired: &Option<Vec<ServicePort>>) -> bool {
    let key = |p: &ServicePort| (p.name.clone(), p.port, p.target_port.clone(), p.protocol.clone());
    let observed: Vec<_> = spec.ports.iter().flatten().map(key).collect();
    let wanted: Vec<_> = desired.iter().flatten().map(key).collect();
    if observed == wanted {
        return false;
    }
    spec.ports = desired.clone();
    true
}

/// Finds or creates the service and corrects one drifted field group.
pub async fn ensure<S: Store>(store: &S, desired: &Service) -> Result<Service> {
    let observed = find_or_create(store, desired).await?.existing()?;
    verify_and_correct(store, observed, desired).await
}
