use std::sync::Arc;
use tokio::{join, sync::RwLock};

use chrono::{DateTime, Utc};
use kube::Client;
use serde::Serialize;
use tracing::*;

use crate::{Config, Context, KubeStore, Metrics, api_client, run_server, run_sonarqube};

/// State shared between the controllers and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics
    pub metrics: Arc<Metrics>,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> String {
        let mut buffer = String::new();
        let registry = &*self.metrics.registry;
        if let Err(e) = prometheus_client::encoding::text::encode(&mut buffer, registry) {
            warn!("failed to encode metrics: {e}");
        }
        buffer
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    /// Reconciler context backed by the cluster behind `client`
    pub fn to_context(&self, client: Client, config: Arc<Config>) -> Context<KubeStore> {
        Context {
            store: KubeStore::new(client.clone()),
            config,
            server_api: Arc::new(api_client::Client::for_environment(client)),
            diagnostics: self.diagnostics.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
        }
    }
}

/// Runs both controllers until a termination signal arrives.
pub async fn run(state: State, config: Arc<Config>) {
    let client = match Client::try_default().await {
        Ok(client) => client,
        Err(e) => {
            error!("failed to create kube client: {e}");
            return;
        }
    };
    join!(
        run_sonarqube(state.clone(), client.clone(), config.clone()),
        run_server(state, client, config),
    );
}
