//! Helper methods only available for tests
use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use assert_json_diff::assert_json_include;
use async_trait::async_trait;
use http::{Request, Response, StatusCode};
use k8s_openapi::api::{
    apps::v1::{Deployment, DeploymentCondition, DeploymentStatus},
    core::v1::{Secret, Service, ServiceSpec},
};
use kube::{Client, ResourceExt, client::Body};
use serde_json::{Value, json};

use crate::{
    Config, Context, Error, KubeStore, Outcome, Result, SonarQube, SonarQubeServer,
    api_client::{Endpoint, ServerApi},
    engine,
    resources::service::address,
    store::{Store, StoreObject, object_key},
};

// We wrap tower_test::mock::Handle
type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
pub struct ApiServerVerifier(ApiServerHandle);

/// Scenarios we test for in ApiServerVerifier
pub enum Scenario {
    /// a GET of the named service answered with 404
    ServiceNotFound(String),
    /// a merge patch on the status subresource of the cluster
    SonarQubeStatusPatch(SonarQube),
    /// a replace of the cluster answered with 409
    SonarQubeReplaceConflict(SonarQube),
    /// a server list carrying the given label selector, answered with an empty list
    ServerListBySelector(String),
    /// a GET through the service proxy at the given path, answered with the given body
    Ping(String, String),
}

pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

const GROUP_PATH: &str = "/apis/sonarsource.parflesh.github.io/v1alpha1/namespaces/default";

fn status_response(code: StatusCode, reason: &str) -> Response<Body> {
    let status = json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": reason.to_lowercase(),
        "reason": reason,
        "code": code.as_u16(),
    });
    Response::builder()
        .status(code)
        .body(Body::from(serde_json::to_vec(&status).unwrap()))
        .unwrap()
}

impl ApiServerVerifier {
    /// Tests only get to run specific scenarios that has matching handlers
    ///
    /// You should await the `JoinHandle` (with a timeout) from this function to ensure that the
    /// scenario runs to completion (i.e. all expected calls were responded to).
    pub fn run(self, scenario: Scenario) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            // moving self => one scenario per test
            match scenario {
                Scenario::ServiceNotFound(name) => self.handle_service_not_found(&name).await,
                Scenario::SonarQubeStatusPatch(sq) => self.handle_status_patch(sq).await,
                Scenario::SonarQubeReplaceConflict(sq) => self.handle_replace_conflict(sq).await,
                Scenario::ServerListBySelector(selector) => self.handle_server_list(&selector).await,
                Scenario::Ping(path, body) => self.handle_proxy_get(&path, body).await,
            }
            .expect("scenario completed without errors");
        })
    }

    // chainable scenario handlers

    async fn handle_service_not_found(mut self, name: &str) -> Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(
            request.uri().path(),
            format!("/api/v1/namespaces/default/services/{name}")
        );
        send.send_response(status_response(StatusCode::NOT_FOUND, "NotFound"));
        Ok(self)
    }

    async fn handle_status_patch(mut self, sq: SonarQube) -> Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().path(),
            format!("{GROUP_PATH}/sonarqubes/{}/status", sq.name_any())
        );
        assert_eq!(
            request.headers().get(http::header::CONTENT_TYPE).unwrap(),
            "application/merge-patch+json"
        );
        let req_body = request.into_body().collect_bytes().await.unwrap();
        let patch: Value = serde_json::from_slice(&req_body).expect("valid patch from runtime");
        let expected = json!({
            "metadata": { "resourceVersion": sq.resource_version() },
            "status": serde_json::to_value(sq.status.as_ref()).unwrap(),
        });
        assert_json_include!(actual: patch, expected: expected);

        let response = serde_json::to_vec(&sq).unwrap(); // respond as the apiserver would have
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        Ok(self)
    }

    async fn handle_replace_conflict(mut self, sq: SonarQube) -> Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PUT);
        assert_eq!(
            request.uri().path(),
            format!("{GROUP_PATH}/sonarqubes/{}", sq.name_any())
        );
        send.send_response(status_response(StatusCode::CONFLICT, "Conflict"));
        Ok(self)
    }

    async fn handle_server_list(mut self, selector: &str) -> Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(request.uri().path(), format!("{GROUP_PATH}/sonarqubeservers"));
        let query = request.uri().query().unwrap_or_default();
        let sent = url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == "labelSelector")
            .map(|(_, v)| v.into_owned());
        assert_eq!(sent.as_deref(), Some(selector));

        let list = json!({
            "apiVersion": "sonarsource.parflesh.github.io/v1alpha1",
            "kind": "SonarQubeServerList",
            "metadata": { "resourceVersion": "1" },
            "items": [],
        });
        let response = serde_json::to_vec(&list).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        Ok(self)
    }

    async fn handle_proxy_get(mut self, path: &str, body: String) -> Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(request.uri().path(), path);
        send.send_response(Response::builder().body(Body::from(body.into_bytes())).unwrap());
        Ok(self)
    }
}

/// A kube client wired to a mock apiserver
pub fn mock_client() -> (Client, ApiServerVerifier) {
    let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    (Client::new(mock_service, "default"), ApiServerVerifier(handle))
}

impl KubeStore {
    pub fn test() -> (Self, ApiServerVerifier) {
        let (client, verifier) = mock_client();
        (KubeStore::new(client), verifier)
    }
}

type Key = (String, String, String);

/// [`Store`] over a map of JSON documents, with resource versions and
/// stale-write detection like the API server.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<Key, Value>>,
    version: AtomicU64,
    writes: AtomicUsize,
    /// Kind whose creates fail as if the API server were unreachable
    failing_creates: Mutex<Option<String>>,
}

fn key<K: StoreObject>(namespace: &str, name: &str) -> Key {
    (K::kind(&()).to_string(), namespace.to_string(), name.to_string())
}

fn decode<K: StoreObject>(value: &Value) -> Result<K> {
    serde_json::from_value(value.clone()).map_err(Error::SerializationError)
}

fn encode<K: StoreObject>(obj: &K) -> Result<Value> {
    serde_json::to_value(obj).map_err(Error::SerializationError)
}

fn check_version(stored: &Value, incoming: &Value) -> Result<()> {
    match incoming["metadata"]["resourceVersion"].as_str() {
        Some(rv) if stored["metadata"]["resourceVersion"].as_str() != Some(rv) => {
            Err(Error::Conflict(format!("stale resourceVersion {rv}")))
        }
        _ => Ok(()),
    }
}

impl MemoryStore {
    /// Number of successful create, update, status and delete calls so far
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Makes every later create of `kind` fail with an unclassified error.
    pub fn fail_creates_of(&self, kind: &str) {
        *self.failing_creates.lock().unwrap() = Some(kind.to_string());
    }

    fn stamp(&self, value: &mut Value) {
        let rv = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        value["metadata"]["resourceVersion"] = json!(rv.to_string());
        if value["metadata"]["uid"].is_null() {
            value["metadata"]["uid"] = json!(format!("uid-{rv}"));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

/// RFC 7386 merge of `patch` into `target`: `null` removes a key, objects
/// merge recursively, anything else replaces.
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = json!({});
    }
    let Some(map) = target.as_object_mut() else {
        return;
    };
    for (k, v) in fields {
        if v.is_null() {
            map.remove(k);
        } else {
            merge_patch(map.entry(k.clone()).or_insert(Value::Null), v);
        }
    }
}

fn set_status(value: &mut Value, status: Option<Value>) {
    if let Some(map) = value.as_object_mut() {
        match status {
            Some(status) if !status.is_null() => {
                map.insert("status".into(), status);
            }
            _ => {
                map.remove("status");
            }
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let objects = self.objects.lock().unwrap();
        objects.get(&key::<K>(namespace, name)).map(decode).transpose()
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = object_key(obj)?;
        let mut objects = self.objects.lock().unwrap();
        if self.failing_creates.lock().unwrap().as_deref() == Some(&*K::kind(&())) {
            return Err(Error::ServiceRequestError(format!("create of {name} refused")));
        }
        let k = key::<K>(&namespace, &name);
        if objects.contains_key(&k) {
            return Err(Error::Conflict(format!("{name} already exists")));
        }
        let mut value = encode(obj)?;
        self.stamp(&mut value);
        let created = decode(&value)?;
        objects.insert(k, value);
        Ok(created)
    }

    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = object_key(obj)?;
        let mut objects = self.objects.lock().unwrap();
        let Some(stored) = objects.get_mut(&key::<K>(&namespace, &name)) else {
            return Err(Error::Conflict(format!("{name} does not exist")));
        };
        let mut value = encode(obj)?;
        check_version(stored, &value)?;
        set_status(&mut value, stored.get("status").cloned());
        self.stamp(&mut value);
        *stored = value;
        decode(stored)
    }

    async fn update_status<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = object_key(obj)?;
        let mut objects = self.objects.lock().unwrap();
        let Some(stored) = objects.get_mut(&key::<K>(&namespace, &name)) else {
            return Err(Error::Conflict(format!("{name} does not exist")));
        };
        let value = encode(obj)?;
        check_version(stored, &value)?;
        if let Some(patch) = value.get("status") {
            let mut status = stored.get("status").cloned().unwrap_or(Value::Null);
            merge_patch(&mut status, patch);
            set_status(stored, Some(status));
        }
        self.stamp(stored);
        decode(stored)
    }

    async fn list<K: StoreObject>(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<K>> {
        let kind = K::kind(&()).to_string();
        let objects = self.objects.lock().unwrap();
        objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .filter(|(_, v)| {
                selector
                    .iter()
                    .all(|(l, want)| v["metadata"]["labels"][l].as_str() == Some(want.as_str()))
            })
            .map(|(_, v)| decode(v))
            .collect()
    }

    async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        if objects.remove(&key::<K>(namespace, name)).is_some() {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Health checks that always give the same answer
pub struct FakeServerApi {
    reachable: bool,
}

impl FakeServerApi {
    pub fn reachable() -> Arc<dyn ServerApi> {
        Arc::new(Self { reachable: true })
    }

    pub fn unreachable() -> Arc<dyn ServerApi> {
        Arc::new(Self { reachable: false })
    }
}

#[async_trait]
impl ServerApi for FakeServerApi {
    async fn ping(&self, endpoint: &Endpoint) -> Result<()> {
        if self.reachable {
            Ok(())
        } else {
            Err(Error::ServiceRequestError(format!(
                "connection refused by {}",
                endpoint.base_url()
            )))
        }
    }
}

impl<S: Store> Context<S> {
    // Create a test context over the given store, with default config and locally registered metrics
    pub fn test(store: S) -> Self {
        Self {
            store,
            config: Arc::new(Config::default()),
            server_api: FakeServerApi::reachable(),
            diagnostics: Arc::default(),
            metrics: Arc::default(),
        }
    }
}

pub fn secret_named(name: &str) -> Secret {
    let mut secret = Secret::default();
    secret.metadata.name = Some(name.into());
    secret.metadata.namespace = Some("default".into());
    secret
}

pub fn service_with_address(name: &str, ip: &str) -> Service {
    let mut svc = Service {
        spec: Some(ServiceSpec {
            cluster_ip: Some(ip.into()),
            ..Default::default()
        }),
        ..Default::default()
    };
    svc.metadata.name = Some(name.into());
    svc.metadata.namespace = Some("default".into());
    svc
}

fn true_condition(type_: &str) -> DeploymentCondition {
    DeploymentCondition {
        type_: type_.into(),
        status: "True".into(),
        ..Default::default()
    }
}

/// Plays the part of the platform: services get cluster addresses and
/// deployments become available.
pub async fn settle_platform(store: &MemoryStore) {
    let services: Vec<Service> = store.list("default", &BTreeMap::new()).await.unwrap();
    let mut assigned = services.iter().filter(|s| address(s).is_some()).count();
    for mut svc in services.into_iter().filter(|s| address(s).is_none()) {
        assigned += 1;
        svc.spec.get_or_insert_with(Default::default).cluster_ip =
            Some(format!("10.96.{}.{}", assigned / 250, assigned % 250 + 1));
        store.update(&svc).await.unwrap();
    }

    let deployments: Vec<Deployment> = store.list("default", &BTreeMap::new()).await.unwrap();
    for mut d in deployments {
        let conditions = d.status.as_ref().and_then(|s| s.conditions.as_ref());
        if conditions.is_some_and(|c| c.iter().any(|c| c.type_ == "Available")) {
            continue;
        }
        d.status = Some(DeploymentStatus {
            conditions: Some(vec![true_condition("Available")]),
            ..Default::default()
        });
        store.update_status(&d).await.unwrap();
    }
}

/// Marks the named deployment as failing to create replicas.
pub async fn fail_replicas(store: &MemoryStore, name: &str) {
    let mut d: Deployment = store.get("default", name).await.unwrap().unwrap();
    d.status
        .get_or_insert_with(Default::default)
        .conditions
        .get_or_insert_with(Vec::new)
        .push(true_condition("ReplicaFailure"));
    store.update_status(&d).await.unwrap();
}

pub async fn reconcile_server(ctx: &Context<MemoryStore>, name: &str) -> Outcome {
    engine::reconcile::<SonarQubeServer, _>(ctx, "default", name)
        .await
        .unwrap()
}

/// Reconciles a lone server, settling the platform after each pass, until
/// it stops asking to be requeued.
pub async fn converge_server(ctx: &Context<MemoryStore>, name: &str) -> Outcome {
    let mut outcome = Outcome::NotFound;
    for _ in 0..60 {
        outcome = reconcile_server(ctx, name).await;
        settle_platform(&ctx.store).await;
        if !outcome.requeue() {
            break;
        }
    }
    outcome
}

/// Outcomes of one round over the whole system.
pub struct Round {
    pub cluster: Outcome,
    pub servers: Vec<(String, Outcome)>,
}

impl Round {
    pub fn settled(&self) -> bool {
        self.cluster == Outcome::Converged && self.servers.iter().all(|(_, o)| *o == Outcome::Converged)
    }
}

/// One pass of the cluster, then one of every member, then the platform.
pub async fn round(ctx: &Context<MemoryStore>, cluster: &str) -> Round {
    let outcome = engine::reconcile::<SonarQube, _>(ctx, "default", cluster)
        .await
        .unwrap();
    let members: Vec<SonarQubeServer> = ctx.store.list("default", &BTreeMap::new()).await.unwrap();
    let mut servers = vec![];
    for member in members {
        let name = member.name_any();
        servers.push((name.clone(), reconcile_server(ctx, &name).await));
    }
    settle_platform(&ctx.store).await;
    Round {
        cluster: outcome,
        servers,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::SonarQubeServerStatus;

    #[tokio::test]
    async fn memory_store_rejects_stale_writes_and_keeps_status_apart() {
        let store = MemoryStore::default();
        let created = store.create(&SonarQubeServer::test()).await.unwrap();
        assert!(created.resource_version().is_some());

        let mut with_status = created.clone();
        with_status.status = Some(SonarQubeServerStatus {
            revision: 3,
            ..Default::default()
        });
        let stored = store.update_status(&with_status).await.unwrap();
        assert_eq!(stored.status.as_ref().unwrap().revision, 3);

        let stale = store.update(&created).await.unwrap_err();
        assert!(matches!(stale, Error::Conflict(_)));

        let mut resized = stored.clone();
        resized.spec.size = Some(0);
        resized.status = None;
        let updated = store.update(&resized).await.unwrap();
        assert_eq!(updated.spec.size, Some(0));
        assert_eq!(updated.status.unwrap().revision, 3);
        assert_eq!(store.writes(), 3);
    }
}
