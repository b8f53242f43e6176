use crate::crd::zookeepercluster::ZookeeperCluster;
use crate::metrics::Metrics;
use crate::zk::{MetadataStore, ZkMetadataClient};

use chrono::{DateTime, Utc};
use kube::client::Client;
use kube::runtime::events::{Recorder, Reporter};
use kube::Resource;
use prometheus_client::registry::Registry;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

// Context for the reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Arc<Metrics>,
    /// Metadata store inside the managed ensemble
    pub store: Arc<dyn MetadataStore>,
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "zookeepercluster-controller".into(),
        }
    }
}

impl Diagnostics {
    pub fn recorder(&self, client: Client, cluster: &ZookeeperCluster) -> Recorder {
        Recorder::new(client, self.reporter.clone(), cluster.object_ref(&()))
    }
}

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics
    metrics: Arc<Metrics>,
}

impl State {
    /// Wrap a registry already carrying the Kubernetes client metrics.
    pub fn new(registry: Registry) -> Self {
        Self {
            diagnostics: Arc::default(),
            metrics: Arc::new(Metrics::new(registry)),
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        let registry = &*self.metrics.registry;
        prometheus_client::encoding::text::encode(&mut buffer, registry)?;
        Ok(buffer)
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub fn to_context(&self, client: Client) -> Arc<Context> {
        Arc::new(Context {
            client,
            diagnostics: self.diagnostics.clone(),
            metrics: self.metrics.clone(),
            store: Arc::new(ZkMetadataClient),
        })
    }
}
