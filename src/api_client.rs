use std::time::Duration;

use async_trait::async_trait;
use http::{Method, Request as KubeRequest};
use kube::Client as KubeClient;
use reqwest::Client as ReqwestClient;
use tracing::*;

use crate::{Error, Result};

/// Where a server's web API can be reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub namespace: String,
    pub service: String,
    /// Cluster address of the service
    pub address: String,
    pub port: i32,
}

impl Endpoint {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }

    /// Path through the API server's service proxy.
    fn proxy_path(&self, path: &str) -> String {
        format!(
            "/api/v1/namespaces/{}/services/{}:{}/proxy{}",
            self.namespace, self.service, self.port, path
        )
    }
}

/// Liveness check against a running server's status API.
#[async_trait]
pub trait ServerApi: Send + Sync {
    /// Succeeds when `GET /api/system/ping` answers `pong`.
    async fn ping(&self, endpoint: &Endpoint) -> Result<()>;
}

const PING_PATH: &str = "/api/system/ping";

/// Reaches servers either directly or through the API server proxy.
#[derive(Clone)]
pub enum Client {
    Kube(KubeClient),
    Reqwest(ReqwestClient),
}

impl Client {
    pub fn new(client: KubeClient) -> Self {
        Self::Kube(client)
    }

    /// Direct HTTP, for when the operator runs inside the cluster network.
    pub fn direct() -> Result<Self> {
        let client = ReqwestClient::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(Error::ReqwestError)?;
        Ok(Self::Reqwest(client))
    }

    /// Direct HTTP when running in a pod, the API server proxy otherwise.
    pub fn for_environment(client: KubeClient) -> Self {
        if std::env::var_os("KUBERNETES_SERVICE_HOST").is_none() {
            return Self::new(client);
        }
        match Self::direct() {
            Ok(direct) => direct,
            Err(e) => {
                warn!("falling back to the API server proxy: {e}");
                Self::new(client)
            }
        }
    }

    async fn get_text(&self, endpoint: &Endpoint, path: &str) -> Result<String> {
        match self {
            Client::Kube(client) => {
                let request = KubeRequest::builder()
                    .method(Method::GET)
                    .uri(endpoint.proxy_path(path))
                    .body(Vec::new())
                    .map_err(Error::HTTPError)?;
                client.request_text(request).await.map_err(Error::KubeError)
            }
            Client::Reqwest(client) => {
                let url = url::Url::parse(&endpoint.base_url())
                    .and_then(|u| u.join(path))
                    .map_err(Error::URLParseError)?;
                client
                    .get(url)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(Error::ReqwestError)?
                    .text()
                    .await
                    .map_err(Error::ReqwestError)
            }
        }
    }
}

#[async_trait]
impl ServerApi for Client {
    async fn ping(&self, endpoint: &Endpoint) -> Result<()> {
        let body = self.get_text(endpoint, PING_PATH).await?;
        debug!("ping {} answered {:?}", endpoint.base_url(), body);
        if body.trim() != "pong" {
            return Err(Error::ServiceRequestError(format!(
                "unexpected ping response {body:?}"
            )));
        }
        Ok(())
    }
}
