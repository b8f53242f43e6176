//! The headless service giving each member a stable quorum address, and the
//! client-facing service in front of the whole ensemble.

use crate::controller::Context;
use crate::crd::zookeepercluster::{
    ZookeeperCluster, ADMIN_PORT_NAME, CLIENT_PORT_NAME, LEADER_PORT_NAME, METRICS_PORT_NAME,
    QUORUM_PORT_NAME, SECURE_CLIENT_PORT_NAME,
};
use crate::error::Result;
use crate::zookeeper::reconcile::{owned_metadata, publish};

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use kube::api::{Api, PostParams};
use kube::runtime::events::Recorder;
use kube::ResourceExt;
use tracing::info;

/// Headless before client, so pod DNS is resolvable by the time external
/// clients can discover the ensemble.
pub async fn reconcile(
    cluster: &ZookeeperCluster,
    ctx: &Context,
    recorder: &Recorder,
) -> Result<()> {
    reconcile_service(cluster, ctx, recorder, cluster.headless_service_name(), true).await?;
    reconcile_service(cluster, ctx, recorder, cluster.client_service_name(), false).await
}

async fn reconcile_service(
    cluster: &ZookeeperCluster,
    ctx: &Context,
    recorder: &Recorder,
    name: String,
    headless: bool,
) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_default();
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);
    match api.get_opt(&name).await? {
        Some(mut svc) => {
            let desired = service_ports(cluster);
            if ports_match(&svc, &desired) {
                return Ok(());
            }
            info!("Updating the zookeeper service \"{name}\" port set in {namespace}");
            if let Some(spec) = svc.spec.as_mut() {
                spec.ports = Some(desired);
            }
            api.replace(&name, &PostParams::default(), &svc).await?;
            publish(
                recorder,
                "UpdateService",
                "Updated",
                format!("Updated service \"{name}\""),
            )
            .await?;
        }
        None => {
            let svc = build_service(cluster, name.clone(), headless)?;
            info!("Creating the zookeeper service \"{name}\" in {namespace}");
            api.create(&PostParams::default(), &svc).await?;
            publish(
                recorder,
                "CreateService",
                "Created",
                format!("Created service \"{name}\""),
            )
            .await?;
        }
    }
    Ok(())
}

fn ports_match(svc: &Service, desired: &[ServicePort]) -> bool {
    match svc.spec.as_ref().and_then(|s| s.ports.as_ref()) {
        Some(live) => {
            live.len() == desired.len()
                && desired
                    .iter()
                    .all(|d| live.iter().any(|l| l.name == d.name && l.port == d.port))
        }
        None => false,
    }
}

pub fn build_service(
    cluster: &ZookeeperCluster,
    name: String,
    headless: bool,
) -> Result<Service> {
    let mut metadata = owned_metadata(cluster, name)?;
    metadata.annotations = cluster.generate_annotations();
    Ok(Service {
        metadata,
        spec: Some(ServiceSpec {
            cluster_ip: headless.then(|| "None".to_string()),
            selector: Some(cluster.selector_labels()),
            ports: Some(service_ports(cluster)),
            ..ServiceSpec::default()
        }),
        status: None,
    })
}

pub fn service_ports(cluster: &ZookeeperCluster) -> Vec<ServicePort> {
    let ports = &cluster.spec.ports;
    let mut service_ports = vec![
        named_port(ADMIN_PORT_NAME, ports.admin),
        named_port(CLIENT_PORT_NAME, ports.client),
        named_port(LEADER_PORT_NAME, ports.leader),
        named_port(QUORUM_PORT_NAME, ports.quorum),
        named_port(METRICS_PORT_NAME, ports.metrics),
    ];
    if cluster.is_ssl_client_supported() {
        service_ports.push(named_port(SECURE_CLIENT_PORT_NAME, ports.secure_client));
    }
    service_ports
}

fn named_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        ..ServicePort::default()
    }
}
