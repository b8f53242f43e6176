//! The pod disruption budget bounding voluntary evictions to the quorum
//! tolerance of the ensemble.

use crate::controller::Context;
use crate::crd::zookeepercluster::ZookeeperCluster;
use crate::error::Result;
use crate::zookeeper::reconcile::{owned_metadata, publish};

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, PostParams};
use kube::runtime::events::Recorder;
use kube::ResourceExt;
use tracing::info;

/// For a tolerated failure count of `F`, ZooKeeper needs `2F+1` members to
/// keep a healthy quorum, so `F = (N-1)/2` rounded down. Below three members
/// no failure is tolerable.
pub fn max_unavailable(size: i32) -> i32 {
    if size < 3 {
        0
    } else {
        (size - 1) / 2
    }
}

/// Engine step: create the budget or repair steady-state drift. While a
/// resize is in flight the statefulset reconciler owns the budget write, at
/// the position the resize ordering requires.
pub async fn reconcile(
    cluster: &ZookeeperCluster,
    ctx: &Context,
    recorder: &Recorder,
) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_default();
    let statefulsets: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &namespace);
    if let Some(sts) = statefulsets.get_opt(&cluster.statefulset_name()).await? {
        let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
        if replicas != cluster.size() {
            return Ok(());
        }
    }
    apply(cluster, ctx, recorder).await
}

/// Unconditional upsert of the budget toward the current spec size.
pub async fn apply(cluster: &ZookeeperCluster, ctx: &Context, recorder: &Recorder) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_default();
    let api: Api<PodDisruptionBudget> = Api::namespaced(ctx.client.clone(), &namespace);
    let name = cluster.pdb_name();
    let desired = max_unavailable(cluster.size());
    match api.get_opt(&name).await? {
        Some(mut pdb) => {
            let current = pdb
                .spec
                .as_ref()
                .and_then(|s| s.max_unavailable.as_ref())
                .and_then(int_value);
            if current == Some(desired) {
                return Ok(());
            }
            info!(
                cluster = %cluster.name_any(),
                max_unavailable = desired,
                "Updating the zookeeper poddisruptionbudget"
            );
            if let Some(spec) = pdb.spec.as_mut() {
                spec.max_unavailable = Some(IntOrString::Int(desired));
            }
            api.replace(&name, &PostParams::default(), &pdb).await?;
            publish(
                recorder,
                "UpdatePodDisruptionBudget",
                "Updated",
                format!("Updated disruption budget \"{name}\" to maxUnavailable {desired}"),
            )
            .await?;
        }
        None => {
            let pdb = build_pod_disruption_budget(cluster)?;
            info!(
                cluster = %cluster.name_any(),
                max_unavailable = desired,
                "Creating the zookeeper poddisruptionbudget"
            );
            api.create(&PostParams::default(), &pdb).await?;
            publish(
                recorder,
                "CreatePodDisruptionBudget",
                "Created",
                format!("Created disruption budget \"{name}\" with maxUnavailable {desired}"),
            )
            .await?;
        }
    }
    Ok(())
}

pub fn build_pod_disruption_budget(cluster: &ZookeeperCluster) -> Result<PodDisruptionBudget> {
    Ok(PodDisruptionBudget {
        metadata: owned_metadata(cluster, cluster.pdb_name())?,
        spec: Some(PodDisruptionBudgetSpec {
            max_unavailable: Some(IntOrString::Int(max_unavailable(cluster.size()))),
            selector: Some(LabelSelector {
                match_labels: Some(cluster.selector_labels()),
                ..LabelSelector::default()
            }),
            ..PodDisruptionBudgetSpec::default()
        }),
        status: None,
    })
}

fn int_value(v: &IntOrString) -> Option<i32> {
    match v {
        IntOrString::Int(i) => Some(*i),
        IntOrString::String(_) => None,
    }
}
