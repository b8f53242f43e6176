#[cfg(all(test, feature = "e2e-tests"))]
mod test {
    use std::time::Duration;

    use k8s_openapi::api::apps::v1::StatefulSet;
    use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Service};
    use k8s_openapi::api::policy::v1::PodDisruptionBudget;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
    use kube::client::Client;
    use kube::runtime::wait::{await_condition, conditions, Condition};
    use kube::ResourceExt;
    use serde_json::json;
    use tokio::time::timeout;
    use zookeeper_operator::crd::zookeepercluster::{
        VolumeReclaimPolicy, ZookeeperCluster, ZookeeperClusterSpec,
    };

    const NS: &str = "default";

    fn has_status_size(size: i32) -> impl Condition<ZookeeperCluster> {
        move |obj: Option<&ZookeeperCluster>| {
            obj.and_then(|c| c.status.as_ref())
                .map(|s| s.metadata.size == size)
                .unwrap_or(false)
        }
    }

    fn has_replicas(replicas: i32) -> impl Condition<StatefulSet> {
        move |obj: Option<&StatefulSet>| {
            obj.and_then(|sts| sts.spec.as_ref())
                .and_then(|s| s.replicas)
                .map(|r| r == replicas)
                .unwrap_or(false)
        }
    }

    fn has_max_unavailable(value: i32) -> impl Condition<PodDisruptionBudget> {
        move |obj: Option<&PodDisruptionBudget>| {
            obj.and_then(|pdb| pdb.spec.as_ref())
                .and_then(|s| s.max_unavailable.as_ref())
                .map(|m| matches!(m, IntOrString::Int(i) if *i == value))
                .unwrap_or(false)
        }
    }

    async fn wait_for<R, C>(api: Api<R>, name: &str, condition: C)
    where
        R: kube::Resource
            + Clone
            + std::fmt::Debug
            + for<'de> k8s_openapi::serde::Deserialize<'de>
            + 'static
            + Send,
        C: Condition<R>,
    {
        timeout(
            Duration::from_secs(300),
            await_condition(api, name, condition),
        )
        .await
        .unwrap()
        .unwrap();
    }

    async fn pvc_count(client: &Client, name: &str) -> usize {
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), NS);
        claims
            .list(&ListParams::default().labels(&format!("app.kubernetes.io/instance={name}")))
            .await
            .unwrap()
            .items
            .len()
    }

    async fn setup(name: &str, spec: ZookeeperClusterSpec) -> (Client, Api<ZookeeperCluster>) {
        let client = Client::try_default().await.unwrap();
        let clusters: Api<ZookeeperCluster> = Api::namespaced(client.clone(), NS);
        clusters
            .create(&PostParams::default(), &ZookeeperCluster::new(name, spec))
            .await
            .unwrap();
        wait_for(clusters.clone(), name, has_status_size(3)).await;
        (client, clusters)
    }

    async fn patch_size(clusters: &Api<ZookeeperCluster>, name: &str, size: i32) {
        clusters
            .patch(
                name,
                &PatchParams::apply("e2e-tests"),
                &Patch::Merge(&json!({ "spec": { "size": size } })),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn fresh_create_converges_with_defaults() {
        let name = "e2e-create";
        let (client, clusters) = setup(name, ZookeeperClusterSpec::default()).await;

        let statefulsets: Api<StatefulSet> = Api::namespaced(client.clone(), NS);
        wait_for(statefulsets.clone(), name, has_replicas(3)).await;

        let configmaps: Api<ConfigMap> = Api::namespaced(client.clone(), NS);
        let cm = configmaps.get(name).await.unwrap();
        let data = cm.data.unwrap();
        assert!(data.contains_key("zoo.cfg"));
        assert!(data.contains_key("bootEnv.sh"));
        assert!(data.contains_key("logback.xml"));

        let services: Api<Service> = Api::namespaced(client.clone(), NS);
        services.get(name).await.unwrap();
        let headless = services.get(&format!("{name}-headless")).await.unwrap();
        assert_eq!(
            headless.spec.unwrap().cluster_ip.as_deref(),
            Some("None")
        );

        let budgets: Api<PodDisruptionBudget> = Api::namespaced(client.clone(), NS);
        wait_for(budgets.clone(), name, has_max_unavailable(1)).await;

        let cluster = clusters.get(name).await.unwrap();
        let status = cluster.status.unwrap().metadata;
        assert_eq!(status.size, 3);
        assert_eq!(status.zk_version, "3.8.4");
        assert_eq!(pvc_count(&client, name).await, 3);
    }

    #[tokio::test]
    async fn scale_up_widens_the_budget_and_grows_the_set() {
        let name = "e2e-scale-up";
        let (client, clusters) = setup(name, ZookeeperClusterSpec::default()).await;

        patch_size(&clusters, name, 5).await;

        let budgets: Api<PodDisruptionBudget> = Api::namespaced(client.clone(), NS);
        wait_for(budgets.clone(), name, has_max_unavailable(2)).await;
        let statefulsets: Api<StatefulSet> = Api::namespaced(client.clone(), NS);
        wait_for(statefulsets.clone(), name, has_replicas(5)).await;
        wait_for(clusters.clone(), name, has_status_size(5)).await;
        assert_eq!(pvc_count(&client, name).await, 5);
    }

    #[tokio::test]
    async fn scale_down_with_delete_policy_reaps_idle_claims() {
        let name = "e2e-scale-down-delete";
        let spec = ZookeeperClusterSpec {
            size: Some(5),
            ..ZookeeperClusterSpec::default()
        };
        let client = Client::try_default().await.unwrap();
        let clusters: Api<ZookeeperCluster> = Api::namespaced(client.clone(), NS);
        let mut cluster = ZookeeperCluster::new(name, spec);
        cluster.spec.persistence.reclaim_policy = VolumeReclaimPolicy::Delete;
        clusters
            .create(&PostParams::default(), &cluster)
            .await
            .unwrap();
        wait_for(clusters.clone(), name, has_status_size(5)).await;

        patch_size(&clusters, name, 3).await;
        wait_for(clusters.clone(), name, has_status_size(3)).await;

        let statefulsets: Api<StatefulSet> = Api::namespaced(client.clone(), NS);
        wait_for(statefulsets.clone(), name, has_replicas(3)).await;
        let budgets: Api<PodDisruptionBudget> = Api::namespaced(client.clone(), NS);
        wait_for(budgets.clone(), name, has_max_unavailable(1)).await;
        assert_eq!(pvc_count(&client, name).await, 3);
    }

    #[tokio::test]
    async fn scale_down_with_retain_policy_keeps_claims() {
        let name = "e2e-scale-down-retain";
        let spec = ZookeeperClusterSpec {
            size: Some(5),
            ..ZookeeperClusterSpec::default()
        };
        let (client, clusters) = {
            let client = Client::try_default().await.unwrap();
            let clusters: Api<ZookeeperCluster> = Api::namespaced(client.clone(), NS);
            clusters
                .create(&PostParams::default(), &ZookeeperCluster::new(name, spec))
                .await
                .unwrap();
            wait_for(clusters.clone(), name, has_status_size(5)).await;
            (client, clusters)
        };

        patch_size(&clusters, name, 3).await;
        wait_for(clusters.clone(), name, has_status_size(3)).await;

        // retained claims outlive the members that used them
        assert_eq!(pvc_count(&client, name).await, 5);
    }

    #[tokio::test]
    async fn enabling_the_secure_client_port_propagates_everywhere() {
        let name = "e2e-secure-client";
        let (client, clusters) = setup(name, ZookeeperClusterSpec::default()).await;

        clusters
            .patch(
                name,
                &PatchParams::apply("e2e-tests"),
                &Patch::Merge(&json!({ "spec": { "ports": { "secureClient": 2182 } } })),
            )
            .await
            .unwrap();

        let services: Api<Service> = Api::namespaced(client.clone(), NS);
        let has_secure_port = |obj: Option<&Service>| {
            obj.and_then(|svc| svc.spec.as_ref())
                .and_then(|s| s.ports.as_ref())
                .map(|ports| {
                    ports
                        .iter()
                        .any(|p| p.name.as_deref() == Some("tls-secure-client") && p.port == 2182)
                })
                .unwrap_or(false)
        };
        wait_for(services.clone(), name, has_secure_port).await;
        wait_for(
            services.clone(),
            &format!("{name}-headless"),
            has_secure_port,
        )
        .await;

        let configmaps: Api<ConfigMap> = Api::namespaced(client.clone(), NS);
        let cm = configmaps.get(name).await.unwrap();
        assert!(cm.data.unwrap()["zoo.cfg"].contains("secureClientPort=2182"));
    }

    #[tokio::test]
    async fn deletion_tears_down_in_order_and_releases_the_finalizer() {
        let name = "e2e-delete";
        let client = Client::try_default().await.unwrap();
        let clusters: Api<ZookeeperCluster> = Api::namespaced(client.clone(), NS);
        let mut cluster = ZookeeperCluster::new(name, ZookeeperClusterSpec::default());
        cluster.spec.persistence.reclaim_policy = VolumeReclaimPolicy::Delete;
        clusters
            .create(&PostParams::default(), &cluster)
            .await
            .unwrap();
        wait_for(clusters.clone(), name, has_status_size(3)).await;

        let live = clusters.get(name).await.unwrap();
        assert!(
            !live.finalizers().is_empty(),
            "finalizer attached before deletion"
        );

        let uid = live.uid().unwrap();
        clusters.delete(name, &Default::default()).await.unwrap();
        wait_for(clusters.clone(), name, conditions::is_deleted(&uid)).await;

        let statefulsets: Api<StatefulSet> = Api::namespaced(client.clone(), NS);
        let sts = statefulsets.get_opt(name).await.unwrap();
        assert!(
            sts.is_none() || sts.unwrap().spec.unwrap().replicas == Some(0),
            "statefulset drained or garbage-collected"
        );
    }
}
