//! Bootstrap and expansion phases over a [`ClusterManager`]

use super::{Phase, PhaseChain};
use crate::cluster::{Cluster, ClusterProvider, KeepCerts, Node};
use crate::services::cluster::ClusterManager;
use anyhow::Result;
use async_trait::async_trait;

pub const PROVISION: &str = "provision";
pub const NETWORK: &str = "network";
pub const ETCD: &str = "etcd";
pub const MASTERS: &str = "masters";
pub const HA: &str = "ha";
pub const WORKERS: &str = "workers";

#[derive(Debug, Clone, Copy, Default)]
pub struct BootstrapOptions {
    pub keep_certs: KeepCerts,
    pub keep_etcd_data: bool,
    /// Run phases even when the cluster records them as completed
    pub force: bool,
}

enum Work {
    /// `None` targets every node of the cluster at run time
    Provision(Option<Vec<Node>>),
    Network,
    Etcd { keep_data: bool },
    Masters(KeepCerts),
    Ha,
    Workers(Option<Vec<Node>>),
}

struct ClusterPhase {
    name: &'static str,
    manager: ClusterManager,
    force: bool,
    work: Work,
}

impl ClusterPhase {
    fn new(name: &'static str, manager: &ClusterManager, force: bool, work: Work) -> Box<dyn Phase> {
        Box::new(Self {
            name,
            manager: manager.clone(),
            force,
            work,
        })
    }

    fn targets(&self, given: &Option<Vec<Node>>) -> Vec<Node> {
        given.clone().unwrap_or_else(|| self.manager.get_all_nodes())
    }

    /// Whether the cluster has anything for this phase to act on
    fn applies(&self, cluster: &Cluster) -> bool {
        match &self.work {
            Work::Provision(nodes) => !self.targets(nodes).is_empty(),
            Work::Network => !cluster.nodes.is_empty(),
            Work::Etcd { .. } => !cluster.etcd_nodes().is_empty(),
            Work::Masters(_) => !cluster.master_nodes().is_empty(),
            Work::Ha => cluster.ha_enabled,
            Work::Workers(nodes) => self.targets(nodes).iter().any(Node::is_worker),
        }
    }
}

#[async_trait]
impl Phase for ClusterPhase {
    fn name(&self) -> &str {
        self.name
    }

    fn should_run(&self) -> bool {
        let cluster = self.manager.get_cluster();
        self.applies(&cluster) && (self.force || !cluster.is_phase_completed(self.name))
    }

    async fn run(&self) -> Result<()> {
        match &self.work {
            Work::Provision(nodes) => self.manager.provision_nodes(&self.targets(nodes)).await,
            Work::Network => self.manager.setup_encrypted_network().await,
            Work::Etcd { keep_data } => {
                let members = self.manager.get_etcd_nodes();
                self.manager.install_etcd_nodes(&members, *keep_data).await
            }
            Work::Masters(keep_certs) => self.manager.install_masters(*keep_certs).await,
            Work::Ha => self.manager.setup_ha().await,
            Work::Workers(nodes) => self.manager.install_workers(&self.targets(nodes)).await,
        }
    }
}

/// Full bootstrap: provision, network, etcd, masters, ha, workers.
///
/// After each phase that ran, the phase is recorded as completed and the
/// cluster handed to `persist`, so an interrupted bootstrap resumes where it
/// stopped.
pub fn bootstrap_chain(
    manager: &ClusterManager,
    options: BootstrapOptions,
    mut persist: impl FnMut(&Cluster) -> Result<()> + Send + 'static,
) -> PhaseChain {
    let force = options.force;
    let phases = vec![
        ClusterPhase::new(PROVISION, manager, force, Work::Provision(None)),
        ClusterPhase::new(NETWORK, manager, force, Work::Network),
        ClusterPhase::new(
            ETCD,
            manager,
            force,
            Work::Etcd {
                keep_data: options.keep_etcd_data,
            },
        ),
        ClusterPhase::new(MASTERS, manager, force, Work::Masters(options.keep_certs)),
        ClusterPhase::new(HA, manager, force, Work::Ha),
        ClusterPhase::new(WORKERS, manager, force, Work::Workers(None)),
    ];

    let manager = manager.clone();
    PhaseChain::new(phases).after_run(move |phase| {
        manager.mark_phase_completed(phase);
        persist(&manager.get_cluster())
    })
}

/// Add `new_nodes` to the cluster and join them as workers.
///
/// Only the new nodes are provisioned and joined. The mesh is reconfigured on
/// every node so existing members learn the new peers.
pub fn expansion_chain(
    manager: &ClusterManager,
    new_nodes: Vec<Node>,
    mut persist: impl FnMut(&Cluster) -> Result<()> + Send + 'static,
) -> Result<PhaseChain> {
    manager.add_nodes(&new_nodes)?;

    let phases = vec![
        ClusterPhase::new(PROVISION, manager, true, Work::Provision(Some(new_nodes.clone()))),
        ClusterPhase::new(NETWORK, manager, true, Work::Network),
        ClusterPhase::new(WORKERS, manager, true, Work::Workers(Some(new_nodes))),
    ];

    let manager = manager.clone();
    Ok(PhaseChain::new(phases).after_run(move |_| persist(&manager.get_cluster())))
}
