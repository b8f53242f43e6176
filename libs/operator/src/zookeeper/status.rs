//! Mirrors the applied spec into the status subresource once every other
//! sub-reconciler has succeeded, writing the ensemble metadata first.

use crate::controller::Context;
use crate::crd::zookeepercluster::ZookeeperCluster;
use crate::error::Result;

use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use serde_json::json;
use tracing::info;

pub async fn reconcile(
    cluster: &ZookeeperCluster,
    ctx: &Context,
    monitor_changed: bool,
) -> Result<()> {
    // never touch the ensemble or the status of a dying cluster
    if cluster.is_being_deleted() {
        return Ok(());
    }
    let observed = cluster.status_metadata();
    let ensemble_drift = cluster.size() != observed.size
        || cluster.spec.image.tag != observed.zk_version
        || cluster.spec.zk_config_overrides != observed.zk_config;
    if !ensemble_drift && !monitor_changed {
        return Ok(());
    }
    if ensemble_drift {
        ctx.store.update_metadata(cluster).await?;
    }
    let mut desired = observed;
    desired.size = cluster.size();
    desired.zk_version = cluster.spec.image.tag.clone();
    desired.zk_config = cluster.spec.zk_config_overrides.clone();

    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    info!(
        size = desired.size,
        version = %desired.zk_version,
        "Updating the cluster status for \"{name}\""
    );
    let api: Api<ZookeeperCluster> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch_status(
        &name,
        &PatchParams::default(),
        &Patch::Merge(&json!({ "status": { "metadata": desired } })),
    )
    .await?;
    Ok(())
}
