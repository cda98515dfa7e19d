use super::{ClusterManager, Step};
use crate::cluster::Node;
use crate::services::templates::{
    PROVISION_SCRIPT_PATH, render_provision_script, run_provision_script_command,
};
use anyhow::Result;
use tracing::info;

impl ClusterManager {
    /// Install the container runtime and Kubernetes tooling on `nodes`.
    ///
    /// The install script is retried under the provision policy, which covers
    /// package manager lock contention on freshly booted machines.
    pub async fn provision_nodes(&self, nodes: &[Node]) -> Result<()> {
        let script = render_provision_script(&self.config().kubernetes);
        let policy = self.config().retry.provision.clone();

        info!(count = nodes.len(), "provisioning nodes");
        self.run_on_nodes(nodes.to_vec(), |_| {
            Ok(vec![
                Step::upload("write provision script", PROVISION_SCRIPT_PATH, script.as_bytes(), true),
                Step::retry("install packages", run_provision_script_command(), policy.clone()),
                Step::note("packages installed"),
            ])
        })
        .await
    }
}
