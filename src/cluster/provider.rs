//! Node-set accessor capability
//!
//! Cloud-specific code (creating machines, provider secrets) lives outside
//! this crate. It reaches the orchestration core only through this trait.

use super::{Cluster, Node, NodeCommand};
use crate::error::ClusterError;

pub trait ClusterProvider: Send + Sync {
    fn get_cluster(&self) -> Cluster;

    /// Provider-specific steps run on the first master after the pod network
    /// is installed, e.g. a cloud-controller-manager secret
    fn get_additional_master_install_commands(&self) -> Vec<NodeCommand> {
        Vec::new()
    }

    fn get_all_nodes(&self) -> Vec<Node> {
        self.get_cluster().nodes
    }

    fn get_master_nodes(&self) -> Vec<Node> {
        self.get_cluster().master_nodes()
    }

    fn get_etcd_nodes(&self) -> Vec<Node> {
        self.get_cluster().etcd_nodes()
    }

    fn get_worker_nodes(&self) -> Vec<Node> {
        self.get_cluster().worker_nodes()
    }

    fn get_master_node(&self) -> Result<Node, ClusterError> {
        self.get_cluster().master_node()
    }
}

/// Provider for machines that already exist, e.g. hand-provisioned VMs
#[derive(Debug, Clone)]
pub struct StaticClusterProvider {
    cluster: Cluster,
    master_commands: Vec<NodeCommand>,
}

impl StaticClusterProvider {
    pub fn new(cluster: Cluster) -> Self {
        Self {
            cluster,
            master_commands: Vec::new(),
        }
    }

    pub fn with_master_commands(mut self, commands: Vec<NodeCommand>) -> Self {
        self.master_commands = commands;
        self
    }
}

impl ClusterProvider for StaticClusterProvider {
    fn get_cluster(&self) -> Cluster {
        self.cluster.clone()
    }

    fn get_additional_master_install_commands(&self) -> Vec<NodeCommand> {
        self.master_commands.clone()
    }
}
