//! The reconciliation engine: one level-triggered pass converging a
//! `ZookeeperCluster` toward its spec.

use crate::controller::Context;
use crate::crd::zookeepercluster::ZookeeperCluster;
use crate::error::{Error, Result};
use crate::telemetry;
use crate::zookeeper::{configmap, finalizer, pdb, service, servicemonitor, statefulset, status};

use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::{Resource, ResourceExt};
use serde_json::json;
use tokio::time::Duration;
use tracing::{field, info, instrument, Span};

/// Requeue interval while a deletion is pending; pod drain is observed
/// across passes.
const TEARDOWN_REQUEUE: Duration = Duration::from_secs(10);
/// Steady-state resync interval.
const STEADY_REQUEUE: Duration = Duration::from_secs(5 * 60);
/// Requeue after an in-place CR mutation; the watch usually wins the race.
pub(crate) const MUTATION_REQUEUE: Duration = Duration::from_secs(5);

/// Runs the sub-reconcilers for one cluster in a fixed order. Every
/// sub-reconciler is idempotent; the first error aborts the pass and the
/// queue retries with backoff.
#[instrument(skip(ctx, cluster), fields(trace_id))]
pub async fn reconcile_cluster(
    cluster: Arc<ZookeeperCluster>,
    ctx: Arc<Context>,
) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));

    let _timer = ctx.metrics.reconcile.count_and_measure(&trace_id);
    ctx.diagnostics.write().await.last_event = Utc::now();

    let namespace: String = cluster.namespace().ok_or_else(|| {
        Error::UserInputError(
            "Expected ZookeeperCluster resource to be namespaced. Can't reconcile a cluster \
             without a namespace."
                .to_string(),
        )
    })?;
    let name = cluster.name_any();

    info!("Reconciling ZookeeperCluster \"{name}\" in {namespace}");

    let mut cluster = (*cluster).clone();
    if cluster.set_defaults() {
        persist_defaults(&ctx, &cluster, &namespace).await?;
    }
    if let Some(size) = cluster.spec.size {
        if size < 0 {
            return Err(Error::UserInputError(format!(
                "spec.size must not be negative, got {size}"
            )));
        }
    }

    let recorder = ctx
        .diagnostics
        .read()
        .await
        .recorder(ctx.client.clone(), &cluster);

    // A sub-reconciler that mutated the CR in place ends the pass; the
    // resulting watch event starts a fresh one with the updated spec.
    if let Some(action) = finalizer::reconcile(&cluster, &ctx, &recorder).await? {
        return Ok(action);
    }
    pdb::reconcile(&cluster, &ctx, &recorder).await?;
    configmap::reconcile(&cluster, &ctx, &recorder).await?;
    service::reconcile(&cluster, &ctx, &recorder).await?;
    statefulset::reconcile(&cluster, &ctx, &recorder).await?;
    let monitor_changed = servicemonitor::reconcile(&mut cluster, &ctx, &recorder).await?;
    status::reconcile(&cluster, &ctx, monitor_changed).await?;

    if cluster.is_being_deleted() {
        Ok(Action::requeue(TEARDOWN_REQUEUE))
    } else {
        Ok(Action::requeue(STEADY_REQUEUE))
    }
}

/// Write defaulted spec and status fields back so the stored object carries
/// every concrete value. The pass continues with the defaulted copy.
async fn persist_defaults(
    ctx: &Context,
    cluster: &ZookeeperCluster,
    namespace: &str,
) -> Result<()> {
    let api: Api<ZookeeperCluster> = Api::namespaced(ctx.client.clone(), namespace);
    let name = cluster.name_any();
    info!("Persisting defaulted fields for cluster \"{name}\"");
    api.patch(
        &name,
        &PatchParams::default(),
        &Patch::Merge(&json!({ "spec": cluster.spec })),
    )
    .await?;
    if let Some(status) = &cluster.status {
        api.patch_status(
            &name,
            &PatchParams::default(),
            &Patch::Merge(&json!({ "status": status })),
        )
        .await?;
    }
    Ok(())
}

/// Attach an owner reference so Kubernetes garbage-collects the child once
/// the cluster is gone.
pub(crate) fn owned_metadata(cluster: &ZookeeperCluster, name: String) -> Result<ObjectMeta> {
    let owner_ref = cluster.controller_owner_ref(&()).ok_or_else(|| {
        Error::UserInputError("ZookeeperCluster resource has no uid yet".to_string())
    })?;
    Ok(ObjectMeta {
        name: Some(name),
        namespace: cluster.namespace(),
        labels: Some(cluster.generate_labels()),
        owner_references: Some(vec![owner_ref]),
        ..ObjectMeta::default()
    })
}

pub(crate) async fn publish(
    recorder: &Recorder,
    action: &str,
    reason: &str,
    note: String,
) -> Result<()> {
    recorder
        .publish(Event {
            type_: EventType::Normal,
            reason: reason.to_string(),
            note: Some(note),
            action: action.to_string(),
            secondary: None,
        })
        .await?;
    Ok(())
}
