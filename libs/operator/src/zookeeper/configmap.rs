//! Generated ZooKeeper configuration: `zoo.cfg`, the boot environment
//! sourced by the container entrypoint, and the logback config.

use crate::controller::Context;
use crate::crd::zookeepercluster::ZookeeperCluster;
use crate::error::Result;
use crate::zk::CLUSTER_METADATA_PARENT_ZNODE;
use crate::zookeeper::reconcile::{owned_metadata, publish};

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, PostParams};
use kube::runtime::events::Recorder;
use kube::ResourceExt;
use tracing::{info, warn};

/// Keys the user must not override: changing them would desynchronize the
/// rendered config from the ports and paths the operator wires everywhere
/// else.
const PROTECTED_KEYS: [&str; 8] = [
    "clientPort",
    "secureClientPort",
    "dataDir",
    "dataLogDir",
    "dynamicConfigFile",
    "metricsProvider.httpPort",
    "admin.enableServer",
    "admin.serverPort",
];

pub async fn reconcile(
    cluster: &ZookeeperCluster,
    ctx: &Context,
    recorder: &Recorder,
) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_default();
    let api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &namespace);
    let name = cluster.config_map_name();
    match api.get_opt(&name).await? {
        Some(mut cm) => {
            // the rendered data is deterministic, so comparing it catches
            // override changes as well as port and directory flips
            let desired = build_data(cluster);
            if cm.data.as_ref() == Some(&desired) {
                return Ok(());
            }
            info!("Updating the zookeeper configmap \"{name}\" in {namespace}");
            cm.metadata.labels = Some(cluster.generate_labels());
            cm.data = Some(desired);
            api.replace(&name, &PostParams::default(), &cm).await?;
            publish(
                recorder,
                "UpdateConfigMap",
                "Updated",
                format!("Updated configmap \"{name}\""),
            )
            .await?;
        }
        None => {
            let cm = build_config_map(cluster)?;
            info!("Creating the zookeeper configmap \"{name}\" in {namespace}");
            api.create(&PostParams::default(), &cm).await?;
            publish(
                recorder,
                "CreateConfigMap",
                "Created",
                format!("Created configmap \"{name}\""),
            )
            .await?;
        }
    }
    Ok(())
}

pub fn build_config_map(cluster: &ZookeeperCluster) -> Result<ConfigMap> {
    Ok(ConfigMap {
        metadata: owned_metadata(cluster, cluster.config_map_name())?,
        data: Some(build_data(cluster)),
        ..ConfigMap::default()
    })
}

fn build_data(cluster: &ZookeeperCluster) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("zoo.cfg".to_string(), render_zk_config(cluster)),
        ("bootEnv.sh".to_string(), render_boot_env(cluster)),
        ("logback.xml".to_string(), LOGBACK_XML.to_string()),
    ])
}

/// Key=value config built from the baseline, with user overrides filling
/// everything except the protected keys. Empty values are dropped.
fn render_zk_config(cluster: &ZookeeperCluster) -> String {
    let ports = &cluster.spec.ports;
    let data_dir = cluster.spec.directories.data.trim_end_matches('/');
    let client_port = if ports.client > 0 {
        ports.client.to_string()
    } else {
        String::new()
    };
    let secure_client_port = if cluster.is_ssl_client_supported() {
        ports.secure_client.to_string()
    } else {
        String::new()
    };
    let mut entries: BTreeMap<String, String> = BTreeMap::from([
        ("initLimit".to_string(), "10".to_string()),
        ("syncLimit".to_string(), "5".to_string()),
        ("tickTime".to_string(), "2000".to_string()),
        ("skipACL".to_string(), "yes".to_string()),
        ("reconfigEnabled".to_string(), "true".to_string()),
        ("standaloneEnabled".to_string(), "false".to_string()),
        ("clientPort".to_string(), client_port),
        ("secureClientPort".to_string(), secure_client_port),
        ("dataDir".to_string(), data_dir.to_string()),
        (
            "dataLogDir".to_string(),
            cluster.spec.directories.log.clone().unwrap_or_default(),
        ),
        (
            "dynamicConfigFile".to_string(),
            format!("{data_dir}/conf/zoo.cfg.dynamic"),
        ),
        (
            "4lw.commands.whitelist".to_string(),
            "conf, cons, crst, conf, dirs, envi, mntr, ruok, srvr, srst, stat".to_string(),
        ),
        (
            "metricsProvider.exportJvmInfo".to_string(),
            "true".to_string(),
        ),
        (
            "metricsProvider.httpPort".to_string(),
            ports.metrics.to_string(),
        ),
        (
            "metricsProvider.className".to_string(),
            "org.apache.zookeeper.metrics.prometheus.PrometheusMetricsProvider".to_string(),
        ),
        (
            "admin.enableServer".to_string(),
            (ports.admin > 0).to_string(),
        ),
        ("admin.serverPort".to_string(), ports.admin.to_string()),
    ]);
    for (key, value) in parse_overrides(&cluster.spec.zk_config_overrides) {
        if PROTECTED_KEYS.contains(&key.as_str()) {
            warn!(key, "the key cannot be set through zkConfigOverrides, skipping");
            continue;
        }
        entries.insert(key, value);
    }
    entries
        .into_iter()
        .filter(|(k, v)| !k.is_empty() && !v.is_empty())
        .map(|(k, v)| format!("{k}={v}\n"))
        .collect()
}

/// The override text is an opaque YAML map of scalars; anything else is
/// logged and ignored rather than failing the reconcile.
fn parse_overrides(overrides: &str) -> BTreeMap<String, String> {
    if overrides.is_empty() {
        return BTreeMap::new();
    }
    let parsed: BTreeMap<String, serde_yaml::Value> = match serde_yaml::from_str(overrides) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "invalid zkConfigOverrides data, ignoring");
            return BTreeMap::new();
        }
    };
    parsed
        .into_iter()
        .filter_map(|(k, v)| scalar_to_string(&v).map(|v| (k, v)))
        .collect()
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Variables sourced by /scripts/start.sh before the server boots.
fn render_boot_env(cluster: &ZookeeperCluster) -> String {
    let ports = &cluster.spec.ports;
    format!(
        "#!/usr/bin/env bash\n\n\
         CLUSTER_NAME={}\n\
         CLUSTER_METADATA_PARENT_ZNODE={}\n\
         DATA_DIR={}\n\
         CLIENT_PORT={}\n\
         SECURE_CLIENT_PORT={}\n\
         QUORUM_PORT={}\n\
         LEADER_PORT={}\n",
        cluster.name_any(),
        CLUSTER_METADATA_PARENT_ZNODE,
        cluster.spec.directories.data,
        ports.client,
        ports.secure_client,
        ports.quorum,
        ports.leader,
    )
}

// see https://github.com/apache/zookeeper/blob/master/conf/logback.xml
const LOGBACK_XML: &str = r#"
<configuration>
  <property name="zookeeper.console.threshold" value="INFO" />
  <appender name="CONSOLE" class="ch.qos.logback.core.ConsoleAppender">
    <encoder>
      <pattern>%d{ISO8601} [myid:%X{myid}] - %-5p [%t:%C{1}@%L] - %m%n</pattern>
    </encoder>
    <filter class="ch.qos.logback.classic.filter.ThresholdFilter">
      <level>${zookeeper.console.threshold}</level>
    </filter>
  </appender>
  <root level="INFO">
    <appender-ref ref="CONSOLE" />
  </root>
</configuration>
"#;
