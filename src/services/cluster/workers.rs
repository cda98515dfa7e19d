use super::{ClusterManager, Step};
use crate::cluster::{ClusterProvider, Node};
use crate::services::templates::{
    BOOTSTRAP_KUBELET_CONF, KUBELET_CONF, join_command, join_token_command, point_kubeconfig_at,
    rewrite_kubeconfig_if_present_command,
};
use crate::utils::networking::format_address;
use crate::utils::retry::retry_with_backoff;
use anyhow::{Context, Result};
use tracing::info;

impl ClusterManager {
    /// Join `nodes` as workers. Masters and etcd members in `nodes` are skipped.
    ///
    /// With HA enabled, each worker's kubelet is repointed at its local load
    /// balancer once kubeadm has written the kubelet kubeconfig.
    pub async fn install_workers(&self, nodes: &[Node]) -> Result<()> {
        let cluster = self.get_cluster();
        let master = cluster.master_node()?;

        let workers: Vec<Node> = nodes.iter().filter(|n| n.is_worker()).cloned().collect();
        if workers.is_empty() {
            return Ok(());
        }

        let comm = self.communicator();
        let token_command = join_token_command();
        let (master_ref, token_ref) = (&master, token_command.as_str());
        let join = retry_with_backoff(
            &self.config().retry.join_token,
            "retrieve join token",
            move || comm.run_cmd(master_ref, token_ref),
        )
        .await
        .with_context(|| format!("{}: retrieve join token", master.name))?;
        let join = join.trim().to_string();
        if join.is_empty() {
            anyhow::bail!("{}: kubeadm printed an empty join command", master.name);
        }

        let ha = cluster.ha_enabled;
        let endpoint = format_address("127.0.0.1", self.config().kubernetes.load_balancer_port);
        let kubelet_timeout = self.config().timeouts.kubelet_config();

        info!(count = workers.len(), ha, "joining workers");
        self.run_on_nodes(workers, |_| {
            let mut steps = vec![
                Step::run("reset node", "kubeadm reset -f"),
                Step::run("join cluster", join_command(&join)),
            ];
            if ha {
                let endpoint = endpoint.clone();
                steps.push(Step::wait_for(
                    "wait for kubelet config",
                    format!("test -f {}", KUBELET_CONF),
                    kubelet_timeout,
                ));
                steps.push(Step::run(
                    "rewrite bootstrap kubelet config",
                    rewrite_kubeconfig_if_present_command(BOOTSTRAP_KUBELET_CONF, &endpoint),
                ));
                steps.push(Step::rewrite("rewrite kubelet config", &[KUBELET_CONF], move |conf| {
                    Ok(point_kubeconfig_at(conf, &endpoint))
                }));
                steps.push(Step::run("restart kubelet", "systemctl restart kubelet"));
            }
            Ok(steps)
        })
        .await
    }
}
