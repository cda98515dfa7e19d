// Kubestrap Library
// Bootstraps kubeadm clusters over SSH: WireGuard mesh, external etcd,
// multi-master control plane and worker join

pub mod cluster;
pub mod config;
pub mod error;
pub mod logging;
pub mod phases;
pub mod progress;
pub mod services;
pub mod utils;

#[cfg(test)]
mod testing;

// Re-export commonly used items
pub use cluster::{Cluster, ClusterProvider, KeepCerts, Node, NodeCommand, StaticClusterProvider, WgKeyPair};
pub use config::KubestrapConfig;
pub use error::ClusterError;
pub use phases::cluster::{BootstrapOptions, bootstrap_chain, expansion_chain};
pub use phases::{Phase, PhaseChain, PhaseState};
pub use progress::{EventService, ProgressCoordinator};
pub use services::{ClusterManager, EtcdManager};
pub use utils::ssh::{NodeCommunicator, SshCommunicator};
