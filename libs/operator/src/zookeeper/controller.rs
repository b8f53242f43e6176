use crate::controller::{Context, State};
use crate::crd::zookeepercluster::ZookeeperCluster;
use crate::error::Error;
use crate::zookeeper::reconcile::reconcile_cluster;

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{Api, ListParams, ResourceExt};
use kube::client::Client;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher;
use tokio::time::Duration;
use tracing::{error, info, warn};

fn error_policy(cluster: Arc<ZookeeperCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(
        cluster = %cluster.name_any(),
        %error,
        "reconcile failed"
    );
    ctx.metrics.reconcile.set_failure(&cluster, error);
    Action::requeue(Duration::from_secs(5 * 60))
}

/// Initialize the zookeepercluster controller (given the crd is installed)
/// and run it until shutdown. Changes to any owned child re-enqueue the
/// owning cluster.
pub async fn run(state: State, client: Client) {
    let clusters = Api::<ZookeeperCluster>::all(client.clone());
    if let Err(e) = clusters.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    info!(msg = "starting zookeepercluster controller");
    Controller::new(clusters, watcher::Config::default().any_semantic())
        // debounce to filter out reconcile calls in quick succession
        .with_config(controller::Config::default().debounce(Duration::from_millis(500)))
        .owns(
            Api::<StatefulSet>::all(client.clone()),
            watcher::Config::default(),
        )
        .owns(
            Api::<ConfigMap>::all(client.clone()),
            watcher::Config::default(),
        )
        .owns(
            Api::<Service>::all(client.clone()),
            watcher::Config::default(),
        )
        .owns(
            Api::<PodDisruptionBudget>::all(client.clone()),
            watcher::Config::default(),
        )
        .shutdown_on_signal()
        .run(reconcile_cluster, error_policy, state.to_context(client))
        .filter_map(|x| async move { x.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
}
