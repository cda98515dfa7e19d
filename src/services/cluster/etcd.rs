use super::{ClusterManager, Step};
use crate::cluster::{Node, validate_quorum};
use crate::services::templates::{
    ETCD_UNIT_PATH, install_etcd_command, remove_etcd_data_command, render_etcd_unit,
    start_etcd_command,
};
use anyhow::Result;
use tracing::info;

impl ClusterManager {
    /// Install and start etcd on `nodes`, which form the whole quorum.
    ///
    /// Without `keep_data` each member's data directory is wiped before start.
    pub async fn install_etcd_nodes(&self, nodes: &[Node], keep_data: bool) -> Result<()> {
        validate_quorum(nodes)?;
        let k8s = &self.config().kubernetes;

        info!(members = nodes.len(), keep_data, "installing etcd");
        self.run_on_nodes(nodes.to_vec(), |node| {
            let mut steps = vec![
                Step::run("install etcd", install_etcd_command(k8s)),
                Step::upload("configure etcd", ETCD_UNIT_PATH, render_etcd_unit(node, nodes), false),
            ];
            if !keep_data {
                steps.push(Step::run("remove etcd data", remove_etcd_data_command()));
            }
            steps.push(Step::run("start etcd", start_etcd_command()));
            Ok(steps)
        })
        .await
    }
}
