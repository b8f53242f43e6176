//! Metadata client for the managed ensemble.
//!
//! The operator keeps a small amount of bookkeeping inside the ZooKeeper it
//! manages: the desired ensemble size and the time of the last update. The
//! in-image preStop script reads the size to decide whether a stopping member
//! should `reconfig -remove` itself from the quorum.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use kube::ResourceExt;
use tokio::net::lookup_host;
use tokio::time::timeout;
use tokio_zookeeper::error as zk_error;
use tokio_zookeeper::{Acl, CreateMode, ZooKeeper};
use tracing::{debug, info};

use crate::crd::zookeepercluster::ZookeeperCluster;
use crate::error::{Error, Result};

/// Parent znode holding the operator bookkeeping.
pub const CLUSTER_METADATA_PARENT_ZNODE: &str = "/zookeeper/operator-cluster-metadata";
const SIZE_NODE: &str = "size";
const UPDATE_TIME_NODE: &str = "updatedat";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Operator-owned metadata in the managed ensemble.
///
/// Implemented over the wire by [`ZkMetadataClient`]; tests swap in a
/// recording stub.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Persist the desired ensemble size and an update timestamp.
    async fn update_metadata(&self, cluster: &ZookeeperCluster) -> Result<()>;
    /// Recursively remove the operator metadata tree.
    async fn delete_metadata(&self, cluster: &ZookeeperCluster) -> Result<()>;
}

/// Production [`MetadataStore`] speaking the ZooKeeper wire protocol.
///
/// A session is opened per call and dropped on return; no connection crosses
/// reconcile passes, so pod churn never leaves the controller with a stale
/// socket.
#[derive(Clone, Copy, Default)]
pub struct ZkMetadataClient;

#[async_trait]
impl MetadataStore for ZkMetadataClient {
    async fn update_metadata(&self, cluster: &ZookeeperCluster) -> Result<()> {
        let session = Session::connect(cluster).await?;
        let size = cluster.size();
        info!(cluster = %cluster.name_any(), size, "updating ensemble metadata");
        session
            .set_node_data(&size_node(), size.to_string().into_bytes())
            .await?;
        let now = chrono::Utc::now().timestamp_millis();
        session
            .set_node_data(&update_time_node(), now.to_string().into_bytes())
            .await
    }

    async fn delete_metadata(&self, cluster: &ZookeeperCluster) -> Result<()> {
        let session = Session::connect(cluster).await?;
        info!(cluster = %cluster.name_any(), "wiping ensemble metadata");
        session.delete_node(CLUSTER_METADATA_PARENT_ZNODE).await
    }
}

fn size_node() -> String {
    format!("{CLUSTER_METADATA_PARENT_ZNODE}/{SIZE_NODE}")
}

fn update_time_node() -> String {
    format!("{CLUSTER_METADATA_PARENT_ZNODE}/{UPDATE_TIME_NODE}")
}

fn wire_err<E: std::fmt::Display>(e: E) -> Error {
    Error::ZooKeeperError(e.to_string())
}

struct Session {
    zk: ZooKeeper,
}

impl Session {
    /// Connect to the cluster through its client service, preferring the
    /// plain client port and falling back to the TLS port when the plain
    /// listener is disabled.
    async fn connect(cluster: &ZookeeperCluster) -> Result<Self> {
        let port = if cluster.spec.ports.client > 0 {
            cluster.spec.ports.client
        } else {
            cluster.spec.ports.secure_client
        };
        if port <= 0 {
            return Err(Error::UserInputError(
                "cluster exposes neither a client nor a secure client port".to_string(),
            ));
        }
        let host = cluster.client_service_fqdn();
        let addr: SocketAddr = lookup_host((host.as_str(), port as u16))
            .await
            .map_err(|e| Error::ZooKeeperError(format!("resolving {host}:{port}: {e}")))?
            .next()
            .ok_or_else(|| Error::ZooKeeperError(format!("no address found for {host}")))?;
        let (zk, _watches) = timeout(CONNECT_TIMEOUT, ZooKeeper::connect(&addr))
            .await
            .map_err(|_| Error::ZooKeeperError(format!("connecting to {host}:{port} timed out")))?
            .map_err(wire_err)?;
        Ok(Self { zk })
    }

    /// Overwrite `path` with `data`, creating the node (and any missing
    /// parents) when absent. Existing content is never trusted or parsed;
    /// the desired value always wins.
    async fn set_node_data(&self, path: &str, data: Vec<u8>) -> Result<()> {
        debug!(path, "writing metadata node");
        match self.zk.get_data(path).await.map_err(wire_err)? {
            Some((_, stat)) => {
                match self
                    .zk
                    .set_data(path, Some(stat.version), data.clone())
                    .await
                    .map_err(wire_err)?
                {
                    Ok(_) => Ok(()),
                    // raced with a session expiry cleanup; recreate
                    Err(zk_error::SetData::NoNode) => self.create_node(path, data).await,
                    Err(e) => Err(wire_err(e)),
                }
            }
            None => self.create_node(path, data).await,
        }
    }

    /// Create `path` with world-readable ACLs, materializing intermediate
    /// nodes. `NodeExists` anywhere along the way counts as success.
    async fn create_node(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        let mut node = String::new();
        for (i, segment) in segments.iter().enumerate() {
            node.push('/');
            node.push_str(segment);
            let payload = if i == segments.len() - 1 {
                data.clone()
            } else {
                Vec::new()
            };
            match self
                .zk
                .create(&node, payload, Acl::open_unsafe(), CreateMode::Persistent)
                .await
                .map_err(wire_err)?
            {
                Ok(_) | Err(zk_error::Create::NodeExists) => {}
                Err(e) => return Err(wire_err(e)),
            }
        }
        Ok(())
    }

    /// Version-conditional delete; `NotEmpty` recurses into the children and
    /// retries, a vanished node counts as success.
    fn delete_node<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            debug!(path, "deleting metadata node");
            let stat = match self.zk.exists(path).await.map_err(wire_err)? {
                Some(stat) => stat,
                None => return Ok(()),
            };
            match self
                .zk
                .delete(path, Some(stat.version))
                .await
                .map_err(wire_err)?
            {
                Ok(()) | Err(zk_error::Delete::NoNode) => Ok(()),
                Err(zk_error::Delete::NotEmpty) => {
                    let children = self
                        .zk
                        .get_children(path)
                        .await
                        .map_err(wire_err)?
                        .unwrap_or_default();
                    for child in children {
                        let child_path = format!("{path}/{child}");
                        self.delete_node(&child_path).await?;
                    }
                    self.delete_node(path).await
                }
                Err(e) => Err(wire_err(e)),
            }
        }
        .boxed()
    }
}
