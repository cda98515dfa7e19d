use super::{ClusterManager, Step};
use crate::cluster::{ClusterProvider, Node};
use crate::error::ClusterError;
use crate::services::templates::{
    APISERVER_MANIFEST, MASTER_KUBECONFIGS, apiserver_ready_command, kube_proxy_rewrite_command,
    load_balancer_command, point_kubeconfig_at, set_apiserver_count,
};
use crate::utils::networking::format_address;
use anyhow::Result;
use tracing::info;

impl ClusterManager {
    /// Put every master and worker behind a local API load balancer.
    pub async fn setup_ha(&self) -> Result<()> {
        let cluster = self.get_cluster();
        let first = cluster.master_node()?;
        let masters = cluster.master_nodes();

        // etcd-only members never talk to the API server
        let lb_nodes: Vec<Node> = cluster
            .nodes
            .iter()
            .filter(|n| n.is_master || n.is_worker())
            .cloned()
            .collect();
        self.deploy_load_balancer(&lb_nodes).await?;

        let count = masters.len();
        let lb_port = self.config().kubernetes.load_balancer_port;
        let endpoint = format_address("127.0.0.1", lb_port);
        let ready_timeout = self.config().timeouts.apiserver_ready();

        info!(masters = count, "rewiring masters to the load balancer");
        self.run_on_nodes(masters, |_| {
            let endpoint = endpoint.clone();
            Ok(vec![
                Step::rewrite("configure apiserver count", &[APISERVER_MANIFEST], move |manifest| {
                    set_apiserver_count(manifest, count)
                }),
                Step::rewrite("rewrite kubeconfig", &MASTER_KUBECONFIGS, move |conf| {
                    Ok(point_kubeconfig_at(conf, &endpoint))
                }),
                Step::run("restart services", "systemctl restart docker kubelet"),
                Step::wait_for("wait for apiserver", apiserver_ready_command(), ready_timeout),
            ])
        })
        .await?;

        self.run_on_nodes(vec![first], |_| {
            Ok(vec![Step::run(
                "rewrite kube-proxy config",
                kube_proxy_rewrite_command(lb_port),
            )])
        })
        .await
    }

    /// (Re)start the load balancer container on `nodes` for the current masters
    pub async fn deploy_load_balancer(&self, nodes: &[Node]) -> Result<()> {
        let masters = self.get_master_nodes();
        if masters.is_empty() {
            return Err(ClusterError::NoMasterFound.into());
        }
        let command = load_balancer_command(&self.config().kubernetes, &masters);

        info!(nodes = nodes.len(), masters = masters.len(), "deploying load balancer");
        self.run_on_nodes(nodes.to_vec(), |_| {
            Ok(vec![Step::run("deploy load balancer", command.clone())])
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use crate::cluster::ClusterProvider;
    use crate::testing::{Harness, cluster, harness};

    const MANIFEST: &str = "spec:\n  containers:\n  - command:\n    - kube-apiserver\n    - --advertise-address=10.0.1.11\n";
    const KUBECONFIG: &str = "clusters:\n- cluster:\n    server: https://10.0.1.11:6443\n";

    fn ha_harness() -> Harness {
        let mut c = cluster(3, 1, 1);
        c.ha_enabled = true;
        let h = harness(c);
        for master in ["master-1", "master-2", "master-3"] {
            h.fake.put_file(master, "/etc/kubernetes/manifests/kube-apiserver.yaml", MANIFEST.as_bytes());
            for conf in ["admin", "kubelet", "controller-manager", "scheduler"] {
                h.fake.put_file(master, &format!("/etc/kubernetes/{}.conf", conf), KUBECONFIG.as_bytes());
            }
        }
        h
    }

    #[tokio::test]
    async fn test_setup_ha_rewires_every_master() {
        let h = ha_harness();

        h.manager.setup_ha().await.unwrap();

        for master in ["master-1", "master-2", "master-3"] {
            let manifest = h
                .fake
                .file(master, "/etc/kubernetes/manifests/kube-apiserver.yaml")
                .unwrap();
            assert!(manifest.contains("- --apiserver-count=3"));
            let scheduler = h.fake.file(master, "/etc/kubernetes/scheduler.conf").unwrap();
            assert!(scheduler.contains("server: https://127.0.0.1:16443"));
            let mut expected = vec![
                "deploy load balancer",
                "completed",
                "configure apiserver count",
                "rewrite kubeconfig",
                "restart services",
                "wait for apiserver",
                "completed",
            ];
            if master == "master-1" {
                expected.extend(["rewrite kube-proxy config", "completed"]);
            }
            assert_eq!(h.events.events_for(master), expected);
        }
    }

    #[tokio::test]
    async fn test_load_balancer_skips_etcd_only_nodes() {
        let h = ha_harness();

        h.manager.setup_ha().await.unwrap();

        assert!(h.fake.commands("etcd-1").is_empty());
        let worker = h.fake.commands("worker-1");
        assert_eq!(worker.len(), 1);
        assert!(worker[0].ends_with("xetys/k8s-master-lb 10.0.1.11 10.0.1.12 10.0.1.13"));
    }

    #[tokio::test]
    async fn test_unready_apiserver_fails_setup() {
        let h = ha_harness();
        h.fake.fail_on("master-2", "get node", "connection refused");

        let err = h.manager.setup_ha().await.unwrap_err();

        assert_eq!(err.to_string(), "master-2: wait for apiserver");
        assert!(!h
            .fake
            .commands("master-1")
            .iter()
            .any(|c| c.contains("configmap kube-proxy")));
    }

    #[tokio::test]
    async fn test_unpatchable_manifest_fails_setup() {
        let h = ha_harness();
        h.fake.put_file(
            "master-2",
            "/etc/kubernetes/manifests/kube-apiserver.yaml",
            b"spec:\n  containers:\n  - image: registry.k8s.io/kube-apiserver\n",
        );

        let err = h.manager.setup_ha().await.unwrap_err();

        assert_eq!(err.to_string(), "master-2: configure apiserver count");
        assert!(h
            .fake
            .commands("master-2")
            .iter()
            .all(|c| !c.contains("systemctl restart")));
    }

    #[tokio::test]
    async fn test_deploy_load_balancer_is_idempotent() {
        let h = ha_harness();
        let workers = h.manager.get_worker_nodes();

        h.manager.deploy_load_balancer(&workers).await.unwrap();
        h.manager.deploy_load_balancer(&workers).await.unwrap();

        let commands = h.fake.commands("worker-1");
        assert_eq!(commands.len(), 2);
        assert!(commands.iter().all(|c| c.starts_with("docker rm -f master-lb")));
    }
}
