//! Prometheus ServiceMonitor for the ensemble metrics port, created only
//! when the metrics section is present on the spec.

use crate::controller::Context;
use crate::crd::servicemonitor::{Endpoint, NamespaceSelector, ServiceMonitor, ServiceMonitorSpec};
use crate::crd::zookeepercluster::{MonitoringConfig, ZookeeperCluster, METRICS_PORT_NAME};
use crate::error::Result;
use crate::zookeeper::reconcile::{owned_metadata, publish};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, PostParams};
use kube::runtime::events::Recorder;
use kube::ResourceExt;
use tracing::info;

const DEFAULT_SCRAPE_INTERVAL: &str = "30s";

/// Upserts the monitor and records the observed resource version on the
/// in-memory status copy. Returns whether that recording changed, so the
/// status reconciler knows to persist it.
pub async fn reconcile(
    cluster: &mut ZookeeperCluster,
    ctx: &Context,
    recorder: &Recorder,
) -> Result<bool> {
    let Some(config) = cluster.spec.metrics.clone() else {
        return Ok(false);
    };
    let namespace = cluster.namespace().unwrap_or_default();
    let api: Api<ServiceMonitor> = Api::namespaced(ctx.client.clone(), &namespace);
    let name = cluster.service_monitor_name();
    let observed = match api.get_opt(&name).await? {
        Some(live) => live.resource_version(),
        None => {
            let monitor = build_service_monitor(cluster, &config)?;
            info!("Creating the zookeeper servicemonitor \"{name}\" in {namespace}");
            let created = api.create(&PostParams::default(), &monitor).await?;
            publish(
                recorder,
                "CreateServiceMonitor",
                "Created",
                format!("Created servicemonitor \"{name}\""),
            )
            .await?;
            created.resource_version()
        }
    };
    if cluster.status_metadata().service_monitor_version == observed {
        return Ok(false);
    }
    cluster
        .status
        .get_or_insert_with(Default::default)
        .metadata
        .service_monitor_version = observed;
    Ok(true)
}

pub fn build_service_monitor(
    cluster: &ZookeeperCluster,
    config: &MonitoringConfig,
) -> Result<ServiceMonitor> {
    let mut metadata = owned_metadata(cluster, cluster.service_monitor_name())?;
    if let Some(extra) = &config.labels {
        let labels = metadata.labels.get_or_insert_with(Default::default);
        for (k, v) in extra {
            labels.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    Ok(ServiceMonitor {
        metadata,
        spec: ServiceMonitorSpec {
            selector: LabelSelector {
                match_labels: Some(cluster.selector_labels()),
                ..LabelSelector::default()
            },
            namespace_selector: Some(NamespaceSelector {
                match_names: vec![cluster.namespace().unwrap_or_default()],
            }),
            endpoints: vec![Endpoint {
                port: Some(METRICS_PORT_NAME.to_string()),
                interval: Some(
                    config
                        .scrape_interval
                        .clone()
                        .unwrap_or_else(|| DEFAULT_SCRAPE_INTERVAL.to_string()),
                ),
                path: None,
            }],
        },
    })
}
