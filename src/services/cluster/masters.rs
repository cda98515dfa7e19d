use super::{ClusterManager, Step};
use crate::cluster::{ClusterProvider, KeepCerts};
use crate::services::templates::{
    MASTER_CONFIG_PATH, SHARED_PKI_FILES, configure_kubectl_command, install_pod_network_command,
    kubeadm_init_command, kubeadm_reset_command, remove_master_taint_command,
    render_master_config,
};
use anyhow::Result;
use tracing::info;

impl ClusterManager {
    /// Bootstrap the control plane.
    ///
    /// The first master runs its whole sequence alone. Additional masters only
    /// start once it finished, because they copy its certificates.
    pub async fn install_masters(&self, keep_certs: KeepCerts) -> Result<()> {
        let cluster = self.get_cluster();
        let first = cluster.master_node()?;
        let masters = cluster.master_nodes();
        let etcd_nodes = cluster.etcd_nodes();
        let k8s = &self.config().kubernetes;

        let mut steps = vec![
            Step::run("reset kubeadm", kubeadm_reset_command(keep_certs)),
            Step::upload(
                "configure master",
                MASTER_CONFIG_PATH,
                render_master_config(&first, &masters, &etcd_nodes, k8s),
                false,
            ),
            Step::run("kubeadm init", kubeadm_init_command()),
            Step::run("configure kubectl", configure_kubectl_command()),
            Step::run("install pod network", install_pod_network_command(k8s)),
        ];
        steps.extend(
            self.get_additional_master_install_commands()
                .into_iter()
                .map(Step::from),
        );
        if cluster.nodes.len() == 1 {
            steps.push(Step::run("remove master taint", remove_master_taint_command()));
        }

        info!(node = %first.name, %keep_certs, "initializing first master");
        self.run_on_nodes(vec![first.clone()], |_| Ok(steps.clone()))
            .await?;

        let others: Vec<_> = masters
            .iter()
            .filter(|m| m.name != first.name)
            .cloned()
            .collect();
        if others.is_empty() {
            return Ok(());
        }

        info!(count = others.len(), "joining additional masters");
        self.run_on_nodes(others, |node| {
            Ok(vec![
                Step::run("reset kubeadm", kubeadm_reset_command(keep_certs)),
                Step::copy_from("copy certificates", &first, &SHARED_PKI_FILES),
                Step::upload(
                    "configure master",
                    MASTER_CONFIG_PATH,
                    render_master_config(node, &masters, &etcd_nodes, k8s),
                    false,
                ),
                Step::run("kubeadm init", kubeadm_init_command()),
                Step::run("configure kubectl", configure_kubectl_command()),
            ])
        })
        .await
    }
}
