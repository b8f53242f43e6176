//! The `ZookeeperCluster` custom resource: desired/observed state, defaulting
//! rules and the deterministic names derived from a cluster.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{
    EnvVar, ExecAction, PersistentVolumeClaimSpec, Probe, ResourceRequirements,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const OPERATOR_NAME: &str = "zookeeper-operator";

/// Every finalizer token this operator attaches starts with this prefix.
pub const FINALIZER_PREFIX: &str = "zookeepercluster.example.com-finalizer";

pub const LABEL_APP_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_APP_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_APP_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_APP_VERSION: &str = "app.kubernetes.io/version";

pub const ADMIN_PORT_NAME: &str = "http-admin";
pub const CLIENT_PORT_NAME: &str = "tcp-client";
pub const LEADER_PORT_NAME: &str = "tcp-leader";
pub const QUORUM_PORT_NAME: &str = "tcp-quorum";
pub const METRICS_PORT_NAME: &str = "http-metrics";
pub const SECURE_CLIENT_PORT_NAME: &str = "tls-secure-client";

const DEFAULT_IMAGE_REPOSITORY: &str = "zookeeper";
const DEFAULT_IMAGE_TAG: &str = "3.8.4";
const DEFAULT_PULL_POLICY: &str = "IfNotPresent";

const DEFAULT_ADMIN_PORT: i32 = 8080;
const DEFAULT_CLIENT_PORT: i32 = 2181;
const DEFAULT_METRICS_PORT: i32 = 7000;
// -1 keeps the TLS client listener off until the user picks a port
const DEFAULT_SECURE_CLIENT_PORT: i32 = -1;
const DEFAULT_QUORUM_PORT: i32 = 2888;
const DEFAULT_LEADER_PORT: i32 = 3888;

const DEFAULT_CLUSTER_SIZE: i32 = 3;
const DEFAULT_DATA_DIR: &str = "/data";
const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";
const DEFAULT_TERMINATION_GRACE_PERIOD: i64 = 120;
const DEFAULT_DATA_STORAGE_SIZE: &str = "8Gi";

/// ZookeeperClusterSpec defines the desired state of a ZooKeeper ensemble.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "zookeeper.example.com",
    version = "v1alpha1",
    kind = "ZookeeperCluster",
    plural = "zookeeperclusters",
    shortname = "zk",
    namespaced,
    status = "ZookeeperClusterStatus",
    printcolumn = r#"{"name":"Size","type":"integer","jsonPath":".spec.size"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.image.tag"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ZookeeperClusterSpec {
    /// Ensemble member count. Zero is legal and drains the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 0))]
    pub size: Option<i32>,

    #[serde(default)]
    pub image: ContainerImage,

    #[serde(default)]
    pub ports: Ports,

    #[serde(default)]
    pub directories: Directories,

    #[serde(default)]
    pub persistence: Persistence,

    /// YAML key/value text merged into the generated zoo.cfg. Keys that
    /// would change port or path semantics are ignored.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub zk_config_overrides: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_config: Option<Probes>,

    #[serde(default)]
    pub pod_config: PodConfig,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_domain: String,

    /// Presence turns on the Prometheus ServiceMonitor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MonitoringConfig>,

    /// Labels attached to every managed child object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    /// Annotations attached to the statefulset and services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerImage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pull_policy: String,
}

impl ContainerImage {
    fn set_defaults(&mut self) -> bool {
        let mut changed = false;
        if self.repository.is_empty() {
            self.repository = DEFAULT_IMAGE_REPOSITORY.to_string();
            changed = true;
        }
        if self.tag.is_empty() {
            self.tag = DEFAULT_IMAGE_TAG.to_string();
            changed = true;
        }
        if self.pull_policy.is_empty() {
            self.pull_policy = DEFAULT_PULL_POLICY.to_string();
            changed = true;
        }
        changed
    }
}

impl fmt::Display for ContainerImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Ports {
    #[serde(default)]
    pub admin: i32,
    #[serde(default)]
    pub client: i32,
    #[serde(default)]
    pub metrics: i32,
    #[serde(default)]
    pub secure_client: i32,
    #[serde(default)]
    pub quorum: i32,
    #[serde(default)]
    pub leader: i32,
}

impl Ports {
    fn set_defaults(&mut self) -> bool {
        let mut changed = false;
        if self.admin == 0 {
            self.admin = DEFAULT_ADMIN_PORT;
            changed = true;
        }
        if self.client == 0 {
            self.client = DEFAULT_CLIENT_PORT;
            changed = true;
        }
        if self.metrics == 0 {
            self.metrics = DEFAULT_METRICS_PORT;
            changed = true;
        }
        if self.secure_client == 0 {
            self.secure_client = DEFAULT_SECURE_CLIENT_PORT;
            changed = true;
        }
        if self.quorum == 0 {
            self.quorum = DEFAULT_QUORUM_PORT;
            changed = true;
        }
        if self.leader == 0 {
            self.leader = DEFAULT_LEADER_PORT;
            changed = true;
        }
        changed
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Directories {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

/// Decides the fate of the member PVCs once they fall outside the replica
/// range or the whole cluster is deleted.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum VolumeReclaimPolicy {
    Delete,
    #[default]
    Retain,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Persistence {
    #[serde(default)]
    pub reclaim_policy: VolumeReclaimPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_claim_spec: Option<PersistentVolumeClaimSpec>,
    /// Annotations attached to each generated claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Persistence {
    fn set_defaults(&mut self) -> bool {
        let mut changed = false;
        let claim = self.volume_claim_spec.get_or_insert_with(|| {
            changed = true;
            PersistentVolumeClaimSpec::default()
        });
        if claim.access_modes.as_ref().map_or(true, Vec::is_empty) {
            claim.access_modes = Some(vec!["ReadWriteOnce".to_string()]);
            changed = true;
        }
        let resources = claim.resources.get_or_insert_with(VolumeResourceRequirements::default);
        let requests = resources.requests.get_or_insert_with(BTreeMap::new);
        if !requests.contains_key("storage") {
            requests.insert(
                "storage".to_string(),
                Quantity(DEFAULT_DATA_STORAGE_SIZE.to_string()),
            );
            changed = true;
        }
        changed
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Probes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup: Option<ProbeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness: Option<ProbeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness: Option<ProbeSpec>,
}

impl Probes {
    pub fn set_defaults(&mut self) -> bool {
        let mut changed = false;
        if self.startup.is_none() {
            self.startup = Some(ProbeSpec {
                period_seconds: 5,
                failure_threshold: 30,
                ..ProbeSpec::default()
            });
            changed = true;
        }
        if self.readiness.is_none() {
            self.readiness = Some(ProbeSpec {
                initial_delay_seconds: 20,
                period_seconds: 10,
                ..ProbeSpec::default()
            });
            changed = true;
        }
        if self.liveness.is_none() {
            self.liveness = Some(ProbeSpec {
                initial_delay_seconds: 20,
                period_seconds: 10,
                ..ProbeSpec::default()
            });
            changed = true;
        }
        changed
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSpec {
    #[serde(default)]
    pub initial_delay_seconds: i32,
    #[serde(default)]
    pub period_seconds: i32,
    #[serde(default)]
    pub timeout_seconds: i32,
    #[serde(default)]
    pub failure_threshold: i32,
}

impl ProbeSpec {
    /// Renders the probe around an exec handler running `script`.
    pub fn to_exec_probe(&self, script: &str) -> Probe {
        fn positive(v: i32) -> Option<i32> {
            (v > 0).then_some(v)
        }
        Probe {
            exec: Some(ExecAction {
                command: Some(vec![script.to_string()]),
            }),
            initial_delay_seconds: positive(self.initial_delay_seconds),
            period_seconds: positive(self.period_seconds),
            timeout_seconds: positive(self.timeout_seconds),
            failure_threshold: positive(self.failure_threshold),
            ..Probe::default()
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringConfig {
    /// Scrape interval for the ServiceMonitor endpoint, e.g. "30s".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scrape_interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

/// ZookeeperClusterStatus defines the observed state of a cluster.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZookeeperClusterStatus {
    #[serde(default)]
    pub metadata: Metadata,
}

/// The last successfully applied spec values; lags spec only while a
/// reconcile is in flight.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default)]
    pub size: i32,
    // always serialized: a cleared value must overwrite the old one when
    // the status subresource is merge-patched
    #[serde(default)]
    pub zk_version: String,
    #[serde(default)]
    pub zk_config: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_monitor_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<BTreeMap<String, String>>,
}

impl ZookeeperClusterSpec {
    /// Fill in every unset field. Returns whether anything changed; running
    /// it twice never changes anything the second time.
    pub fn set_defaults(&mut self) -> bool {
        let mut changed = false;
        if self.size.is_none() {
            self.size = Some(DEFAULT_CLUSTER_SIZE);
            changed = true;
        }
        changed |= self.image.set_defaults();
        changed |= self.ports.set_defaults();
        if self.directories.data.is_empty() {
            self.directories.data = DEFAULT_DATA_DIR.to_string();
            changed = true;
        }
        changed |= self.persistence.set_defaults();
        match self.probe_config.as_mut() {
            Some(probes) => changed |= probes.set_defaults(),
            None => {
                let mut probes = Probes::default();
                probes.set_defaults();
                self.probe_config = Some(probes);
                changed = true;
            }
        }
        if self.pod_config.termination_grace_period_seconds.is_none() {
            self.pod_config.termination_grace_period_seconds =
                Some(DEFAULT_TERMINATION_GRACE_PERIOD);
            changed = true;
        }
        if self.cluster_domain.is_empty() {
            self.cluster_domain = DEFAULT_CLUSTER_DOMAIN.to_string();
            changed = true;
        }
        changed
    }
}

impl ZookeeperCluster {
    pub fn size(&self) -> i32 {
        self.spec.size.unwrap_or(DEFAULT_CLUSTER_SIZE)
    }

    pub fn config_map_name(&self) -> String {
        self.name_any()
    }

    pub fn statefulset_name(&self) -> String {
        self.name_any()
    }

    pub fn client_service_name(&self) -> String {
        self.name_any()
    }

    pub fn headless_service_name(&self) -> String {
        format!("{}-headless", self.client_service_name())
    }

    pub fn pdb_name(&self) -> String {
        self.name_any()
    }

    pub fn service_monitor_name(&self) -> String {
        self.name_any()
    }

    pub fn client_service_fqdn(&self) -> String {
        format!(
            "{}.{}.svc.{}",
            self.client_service_name(),
            self.namespace().unwrap_or_default(),
            self.spec.cluster_domain,
        )
    }

    pub fn headless_service_fqdn(&self) -> String {
        format!(
            "{}.{}.svc.{}",
            self.headless_service_name(),
            self.namespace().unwrap_or_default(),
            self.spec.cluster_domain,
        )
    }

    pub fn is_ssl_client_supported(&self) -> bool {
        self.spec.ports.secure_client > 0
    }

    pub fn finalizer_name(&self) -> String {
        format!("{FINALIZER_PREFIX}-{}", self.name_any())
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers()
            .iter()
            .any(|f| f.starts_with(FINALIZER_PREFIX))
    }

    pub fn is_being_deleted(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    /// Labels stamped on every managed child object. User labels never win
    /// over the operator-owned keys.
    pub fn generate_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.spec.labels.clone().unwrap_or_default();
        labels.insert("app".to_string(), "zookeeper".to_string());
        labels.insert(LABEL_APP_NAME.to_string(), "zookeeper".to_string());
        labels.insert(LABEL_APP_INSTANCE.to_string(), self.name_any());
        labels.insert(LABEL_APP_MANAGED_BY.to_string(), OPERATOR_NAME.to_string());
        labels
    }

    /// The selector shared by both services, the budget and the pod lookup.
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(LABEL_APP_INSTANCE.to_string(), self.name_any())])
    }

    pub fn label_selector(&self) -> String {
        format!("{LABEL_APP_INSTANCE}={}", self.name_any())
    }

    pub fn pod_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.generate_labels();
        if let Some(extra) = &self.spec.pod_config.labels {
            for (k, v) in extra {
                labels.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        labels
    }

    pub fn generate_annotations(&self) -> Option<BTreeMap<String, String>> {
        self.spec.annotations.clone()
    }

    /// Observed metadata, defaulted when the status subresource is not
    /// populated yet.
    pub fn status_metadata(&self) -> Metadata {
        self.status.clone().unwrap_or_default().metadata
    }

    /// Apply spec and status defaulting; true when either changed.
    pub fn set_defaults(&mut self) -> bool {
        let spec_changed = self.spec.set_defaults();
        let status_changed = match self.status.as_mut() {
            None => {
                self.status = Some(ZookeeperClusterStatus {
                    metadata: Metadata {
                        data: Some(BTreeMap::new()),
                        ..Metadata::default()
                    },
                });
                true
            }
            Some(status) => {
                if status.metadata.data.is_none() {
                    status.metadata.data = Some(BTreeMap::new());
                    true
                } else {
                    false
                }
            }
        };
        spec_changed || status_changed
    }
}
