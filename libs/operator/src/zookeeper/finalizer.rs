//! Finalizer handling and the teardown protocol.
//!
//! Teardown is a state machine driven across reconcile passes, encoded
//! entirely in the CR (deletion timestamp, finalizer token, spec.size) so a
//! controller restart resumes exactly where it left off:
//!
//! 1. a live cluster gets the token attached,
//! 2. on deletion with size > 0 the ensemble metadata is wiped and the spec
//!    is scaled to zero — in that order, since after the pods are gone there
//!    is no quorum left to serve the delete,
//! 3. once every pod is gone the token is removed and Kubernetes may
//!    garbage-collect the rest.

use crate::controller::Context;
use crate::crd::zookeepercluster::ZookeeperCluster;
use crate::error::Result;
use crate::zookeeper::reconcile::{publish, MUTATION_REQUEUE};

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::Recorder;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info};

/// Returns `Some(action)` when the pass must stop because the CR itself was
/// mutated; `None` lets the remaining sub-reconcilers run.
pub async fn reconcile(
    cluster: &ZookeeperCluster,
    ctx: &Context,
    recorder: &Recorder,
) -> Result<Option<Action>> {
    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    let token = cluster.finalizer_name();
    let api: Api<ZookeeperCluster> = Api::namespaced(ctx.client.clone(), &namespace);

    if !cluster.is_being_deleted() {
        if cluster.has_finalizer() {
            return Ok(None);
        }
        info!("Attaching finalizer \"{token}\" to cluster \"{name}\"");
        let mut finalizers = cluster.finalizers().to_vec();
        finalizers.push(token.clone());
        api.patch(
            &name,
            &PatchParams::default(),
            &Patch::Merge(&json!({ "metadata": { "finalizers": finalizers } })),
        )
        .await?;
        publish(
            recorder,
            "AttachFinalizer",
            "FinalizerAttached",
            format!("Attached finalizer \"{token}\""),
        )
        .await?;
        return Ok(Some(Action::requeue(MUTATION_REQUEUE)));
    }

    if !cluster.finalizers().contains(&token) {
        // nothing left that blocks deletion
        return Ok(None);
    }

    if cluster.size() > 0 {
        // Wipe the metadata before downscaling: the cluster being deleted is
        // itself the metadata store.
        info!("Cleaning up the ensemble metadata for cluster \"{name}\"");
        ctx.store.delete_metadata(cluster).await?;
        info!("Downscaling cluster \"{name}\" to zero to prepare delete");
        api.patch(
            &name,
            &PatchParams::default(),
            &Patch::Merge(&json!({ "spec": { "size": 0 } })),
        )
        .await?;
        publish(
            recorder,
            "Teardown",
            "MetadataWiped",
            format!("Wiped ensemble metadata and scaled cluster \"{name}\" to zero"),
        )
        .await?;
        return Ok(Some(Action::requeue(MUTATION_REQUEUE)));
    }

    // Drain: let the pass continue so the statefulset reconciler applies the
    // zero replica count; the token holds deletion back meanwhile.
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let running = pods
        .list(&ListParams::default().labels(&cluster.label_selector()))
        .await?;
    if !running.items.is_empty() {
        debug!(
            pods = running.items.len(),
            "waiting for cluster \"{name}\" pods to terminate"
        );
        return Ok(None);
    }

    info!("Finalizing cluster \"{name}\"");
    let finalizers: Vec<String> = cluster
        .finalizers()
        .iter()
        .filter(|f| **f != token)
        .cloned()
        .collect();
    api.patch(
        &name,
        &PatchParams::default(),
        &Patch::Merge(&json!({ "metadata": { "finalizers": finalizers } })),
    )
    .await?;
    publish(
        recorder,
        "Teardown",
        "Finalized",
        format!("Removed finalizer \"{token}\" from cluster \"{name}\""),
    )
    .await?;
    Ok(Some(Action::await_change()))
}
