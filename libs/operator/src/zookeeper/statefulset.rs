//! The ordered StatefulSet running the ensemble members, including the
//! resize protocol and garbage collection of idle member volumes.

use crate::controller::Context;
use crate::crd::zookeepercluster::{
    Probes, VolumeReclaimPolicy, ZookeeperCluster, ADMIN_PORT_NAME, CLIENT_PORT_NAME,
    LABEL_APP_VERSION, LEADER_PORT_NAME, METRICS_PORT_NAME, QUORUM_PORT_NAME,
    SECURE_CLIENT_PORT_NAME,
};
use crate::error::Result;
use crate::zookeeper::pdb;
use crate::zookeeper::reconcile::{owned_metadata, publish};

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, ExecAction, Lifecycle,
    LifecycleHandler, ObjectFieldSelector, PersistentVolumeClaim, PodSpec, PodTemplateSpec,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::events::Recorder;
use kube::ResourceExt;
use tracing::info;

const CONFIG_VOLUME: &str = "config";
const PVC_DATA_VOLUME: &str = "data";
const PVC_DATA_LOG_VOLUME: &str = "data-log";
const CONTAINER_NAME: &str = "zookeeper";

enum Drift {
    ScaleUp { from: i32, to: i32 },
    ScaleDown { from: i32, to: i32 },
    PodSpec,
}

pub async fn reconcile(
    cluster: &ZookeeperCluster,
    ctx: &Context,
    recorder: &Recorder,
) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_default();
    let api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &namespace);
    let name = cluster.statefulset_name();
    match api.get_opt(&name).await? {
        Some(sts) => match detect_drift(cluster, &sts) {
            Some(Drift::ScaleUp { from, to }) => {
                // widen the budget first so the new quorum tolerance is
                // admitted before members join
                pdb::apply(cluster, ctx, recorder).await?;
                replace(cluster, &api, &sts).await?;
                publish(
                    recorder,
                    "ScaleCluster",
                    "ScaledUp",
                    format!("Scaled cluster \"{name}\" from {from} to {to} members"),
                )
                .await?;
            }
            Some(Drift::ScaleDown { from, to }) => {
                // departing members must see the reduced size before they
                // stop, so their preStop hook can reconfig them out; during
                // teardown the metadata is already wiped
                if !cluster.is_being_deleted() {
                    ctx.store.update_metadata(cluster).await?;
                }
                replace(cluster, &api, &sts).await?;
                publish(
                    recorder,
                    "ScaleCluster",
                    "ScaledDown",
                    format!("Scaled cluster \"{name}\" from {from} to {to} members"),
                )
                .await?;
                gc_idle_pvcs(cluster, ctx, recorder).await?;
                pdb::apply(cluster, ctx, recorder).await?;
            }
            Some(Drift::PodSpec) => {
                replace(cluster, &api, &sts).await?;
                publish(
                    recorder,
                    "UpdateStatefulSet",
                    "Updated",
                    format!("Updated statefulset \"{name}\""),
                )
                .await?;
            }
            None => {}
        },
        None => {
            let sts = build_stateful_set(cluster)?;
            info!("Creating the zookeeper statefulset \"{name}\" in {namespace}");
            api.create(&PostParams::default(), &sts).await?;
            publish(
                recorder,
                "CreateStatefulSet",
                "Created",
                format!("Created statefulset \"{name}\" with {} members", cluster.size()),
            )
            .await?;
        }
    }
    Ok(())
}

fn detect_drift(cluster: &ZookeeperCluster, sts: &StatefulSet) -> Option<Drift> {
    let current = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    let desired = cluster.size();
    if desired > current {
        return Some(Drift::ScaleUp {
            from: current,
            to: desired,
        });
    }
    if desired < current {
        return Some(Drift::ScaleDown {
            from: current,
            to: desired,
        });
    }
    let observed = cluster.status_metadata();
    let desired_image = cluster.spec.image.to_string();
    let live = live_container(sts);
    let image_drift = live.map_or(true, |c| c.image.as_deref() != Some(desired_image.as_str()));
    let port_drift = live.map_or(true, |c| {
        !container_ports_match(c, &container_ports(cluster))
    });
    if cluster.spec.image.tag != observed.zk_version
        || cluster.spec.zk_config_overrides != observed.zk_config
        || image_drift
        || port_drift
    {
        return Some(Drift::PodSpec);
    }
    None
}

fn live_container(sts: &StatefulSet) -> Option<&Container> {
    sts.spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.iter().find(|c| c.name == CONTAINER_NAME))
}

fn container_ports_match(container: &Container, desired: &[ContainerPort]) -> bool {
    match container.ports.as_ref() {
        Some(live) => {
            live.len() == desired.len()
                && desired.iter().all(|d| {
                    live.iter()
                        .any(|l| l.name == d.name && l.container_port == d.container_port)
                })
        }
        None => false,
    }
}

/// Replace the live object with a freshly built one, keeping the live
/// resourceVersion so a racing writer surfaces as a retryable conflict.
async fn replace(
    cluster: &ZookeeperCluster,
    api: &Api<StatefulSet>,
    live: &StatefulSet,
) -> Result<()> {
    let name = cluster.statefulset_name();
    let mut desired = build_stateful_set(cluster)?;
    desired.metadata.resource_version = live.resource_version();
    info!(
        replicas = cluster.size(),
        version = %cluster.spec.image.tag,
        "Updating the zookeeper statefulset \"{name}\""
    );
    api.replace(&name, &PostParams::default(), &desired).await?;
    Ok(())
}

/// After a scale-down, claims whose ordinal falls outside the replica range
/// are idle. They are removed only under the Delete reclaim policy.
async fn gc_idle_pvcs(
    cluster: &ZookeeperCluster,
    ctx: &Context,
    recorder: &Recorder,
) -> Result<()> {
    if cluster.spec.persistence.reclaim_policy != VolumeReclaimPolicy::Delete {
        return Ok(());
    }
    let namespace = cluster.namespace().unwrap_or_default();
    let api: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), &namespace);
    let claims = api
        .list(&ListParams::default().labels(&cluster.label_selector()))
        .await?;
    for claim in claims {
        let claim_name = claim.name_any();
        if let Some(ordinal) = trailing_ordinal(&claim_name) {
            if ordinal >= cluster.size() {
                info!("Deleting the idle pvc \"{claim_name}\" in {namespace}");
                api.delete(&claim_name, &DeleteParams::default()).await?;
                publish(
                    recorder,
                    "DeletePersistentVolumeClaim",
                    "Deleted",
                    format!("Deleted idle claim \"{claim_name}\""),
                )
                .await?;
            }
        }
    }
    Ok(())
}

/// Ordinal of a statefulset-owned object name, i.e. the integer after the
/// last dash. Tolerates arbitrary prefixes.
fn trailing_ordinal(name: &str) -> Option<i32> {
    name.rsplit_once('-')
        .and_then(|(_, ordinal)| ordinal.parse().ok())
}

pub fn build_stateful_set(cluster: &ZookeeperCluster) -> Result<StatefulSet> {
    let tag = cluster.spec.image.tag.clone();
    let mut labels = cluster.generate_labels();
    labels.insert(LABEL_APP_VERSION.to_string(), tag.clone());
    labels.insert("version".to_string(), tag);
    let mut metadata = owned_metadata(cluster, cluster.statefulset_name())?;
    metadata.labels = Some(labels);
    metadata.annotations = cluster.generate_annotations();
    Ok(StatefulSet {
        metadata,
        spec: Some(StatefulSetSpec {
            service_name: cluster.headless_service_name(),
            replicas: Some(cluster.size()),
            selector: LabelSelector {
                match_labels: Some(cluster.selector_labels()),
                ..LabelSelector::default()
            },
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..StatefulSetUpdateStrategy::default()
            }),
            pod_management_policy: Some("OrderedReady".to_string()),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(cluster.pod_labels()),
                    annotations: cluster.spec.pod_config.annotations.clone(),
                    ..ObjectMeta::default()
                }),
                spec: Some(build_pod_spec(cluster)),
            },
            volume_claim_templates: Some(build_volume_claims(cluster)),
            ..StatefulSetSpec::default()
        }),
        status: None,
    })
}

fn build_pod_spec(cluster: &ZookeeperCluster) -> PodSpec {
    let probes = cluster.spec.probe_config.clone().unwrap_or_else(|| {
        let mut probes = Probes::default();
        probes.set_defaults();
        probes
    });
    let data_dir = cluster.spec.directories.data.trim_end_matches('/').to_string();
    let mut mounts = vec![
        VolumeMount {
            name: CONFIG_VOLUME.to_string(),
            mount_path: "/config".to_string(),
            ..VolumeMount::default()
        },
        VolumeMount {
            name: PVC_DATA_VOLUME.to_string(),
            mount_path: data_dir,
            ..VolumeMount::default()
        },
    ];
    if let Some(log_dir) = &cluster.spec.directories.log {
        mounts.push(VolumeMount {
            name: PVC_DATA_LOG_VOLUME.to_string(),
            mount_path: log_dir.clone(),
            ..VolumeMount::default()
        });
    }
    let container = Container {
        name: CONTAINER_NAME.to_string(),
        command: Some(vec!["/scripts/start.sh".to_string()]),
        image: Some(cluster.spec.image.to_string()),
        image_pull_policy: Some(cluster.spec.image.pull_policy.clone()),
        ports: Some(container_ports(cluster)),
        volume_mounts: Some(mounts),
        startup_probe: probes
            .startup
            .map(|p| p.to_exec_probe("/scripts/probeStartup.sh")),
        readiness_probe: probes
            .readiness
            .map(|p| p.to_exec_probe("/scripts/probeReadiness.sh")),
        liveness_probe: probes
            .liveness
            .map(|p| p.to_exec_probe("/scripts/probeLiveness.sh")),
        lifecycle: Some(Lifecycle {
            pre_stop: Some(LifecycleHandler {
                exec: Some(ExecAction {
                    command: Some(vec!["/scripts/stop.sh".to_string()]),
                }),
                ..LifecycleHandler::default()
            }),
            ..Lifecycle::default()
        }),
        env: Some(decorated_env(cluster)),
        resources: cluster.spec.pod_config.resources.clone(),
        ..Container::default()
    };
    PodSpec {
        containers: vec![container],
        volumes: Some(vec![Volume {
            name: CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: cluster.config_map_name(),
                ..ConfigMapVolumeSource::default()
            }),
            ..Volume::default()
        }]),
        termination_grace_period_seconds: cluster.spec.pod_config.termination_grace_period_seconds,
        ..PodSpec::default()
    }
}

pub fn container_ports(cluster: &ZookeeperCluster) -> Vec<ContainerPort> {
    let ports = &cluster.spec.ports;
    let mut container_ports = vec![
        named_port(ADMIN_PORT_NAME, ports.admin),
        named_port(CLIENT_PORT_NAME, ports.client),
        named_port(QUORUM_PORT_NAME, ports.quorum),
        named_port(LEADER_PORT_NAME, ports.leader),
        named_port(METRICS_PORT_NAME, ports.metrics),
    ];
    if cluster.is_ssl_client_supported() {
        container_ports.push(named_port(SECURE_CLIENT_PORT_NAME, ports.secure_client));
    }
    container_ports
}

fn named_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        ..ContainerPort::default()
    }
}

/// User env decorated with the downward-API entries the entrypoint scripts
/// rely on.
fn decorated_env(cluster: &ZookeeperCluster) -> Vec<EnvVar> {
    let mut env = vec![
        field_ref_env("POD_NAME", "metadata.name"),
        field_ref_env("POD_NAMESPACE", "metadata.namespace"),
    ];
    if let Some(user_env) = &cluster.spec.pod_config.env {
        env.extend(user_env.iter().cloned());
    }
    env
}

fn field_ref_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..ObjectFieldSelector::default()
            }),
            ..EnvVarSource::default()
        }),
        ..EnvVar::default()
    }
}

fn build_volume_claims(cluster: &ZookeeperCluster) -> Vec<PersistentVolumeClaim> {
    let persistence = &cluster.spec.persistence;
    let claim = |volume_name: &str| PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(volume_name.to_string()),
            labels: Some(cluster.generate_labels()),
            annotations: persistence.annotations.clone(),
            ..ObjectMeta::default()
        },
        spec: persistence.volume_claim_spec.clone(),
        status: None,
    };
    let mut claims = vec![claim(PVC_DATA_VOLUME)];
    if cluster.spec.directories.log.is_some() {
        claims.push(claim(PVC_DATA_LOG_VOLUME));
    }
    claims
}
