//! Cluster and node data model

pub mod provider;

pub use provider::{ClusterProvider, StaticClusterProvider};

use crate::error::ClusterError;
use crate::utils::networking::mesh_address;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// WireGuard key pair. Generated once per node and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WgKeyPair {
    pub private: String,
    pub public: String,
}

/// One machine of the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default)]
    pub server_type: String,
    #[serde(default)]
    pub is_master: bool,
    #[serde(default)]
    pub is_etcd: bool,
    pub ip_address: String,
    /// Address on the WireGuard mesh, empty until assigned
    #[serde(default)]
    pub private_ip_address: String,
    pub ssh_key_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wireguard_key_pair: Option<WgKeyPair>,
}

impl Node {
    pub fn is_worker(&self) -> bool {
        !self.is_master && !self.is_etcd
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub ha_enabled: bool,
    #[serde(default)]
    pub isolated_etcd: bool,
    #[serde(default)]
    pub self_hosted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_init_file: Option<PathBuf>,
    pub node_cidr: String,
    /// Phases that already ran against this cluster
    #[serde(default)]
    pub completed_phases: Vec<String>,
}

impl Cluster {
    pub fn master_nodes(&self) -> Vec<Node> {
        self.nodes.iter().filter(|n| n.is_master).cloned().collect()
    }

    pub fn etcd_nodes(&self) -> Vec<Node> {
        self.nodes.iter().filter(|n| n.is_etcd).cloned().collect()
    }

    pub fn worker_nodes(&self) -> Vec<Node> {
        self.nodes.iter().filter(|n| n.is_worker()).cloned().collect()
    }

    /// The master used for single-master operations: the first one in node order
    pub fn master_node(&self) -> Result<Node, ClusterError> {
        self.nodes
            .iter()
            .find(|n| n.is_master)
            .cloned()
            .ok_or(ClusterError::NoMasterFound)
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// etcd members must exist and be odd in number before quorum operations
    pub fn validate_etcd_quorum(&self) -> Result<(), ClusterError> {
        validate_quorum(&self.etcd_nodes())
    }

    /// Give every node without a mesh address one derived from `node_cidr`.
    ///
    /// A node prefers the address of its list position; when another node
    /// already holds it, the next free address is taken instead.
    pub fn assign_mesh_addresses(&mut self) -> Result<()> {
        let mut used: HashSet<String> = self
            .nodes
            .iter()
            .filter(|n| !n.private_ip_address.is_empty())
            .map(|n| n.private_ip_address.clone())
            .collect();

        for index in 0..self.nodes.len() {
            if !self.nodes[index].private_ip_address.is_empty() {
                continue;
            }
            let mut slot = index;
            let address = loop {
                let candidate = mesh_address(&self.node_cidr, slot)?;
                if !used.contains(&candidate) {
                    break candidate;
                }
                slot += 1;
            };
            used.insert(address.clone());
            self.nodes[index].private_ip_address = address;
        }
        Ok(())
    }

    pub fn is_phase_completed(&self, phase: &str) -> bool {
        self.completed_phases.iter().any(|p| p == phase)
    }

    pub fn mark_phase_completed(&mut self, phase: &str) {
        if !self.is_phase_completed(phase) {
            self.completed_phases.push(phase.to_string());
        }
    }
}

pub(crate) fn validate_quorum(members: &[Node]) -> Result<(), ClusterError> {
    match members.len() {
        0 => Err(ClusterError::NoEtcdNodes),
        n if n % 2 == 0 => Err(ClusterError::EvenQuorum(n)),
        _ => Ok(()),
    }
}

/// A labelled remote command. The label is what progress displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCommand {
    pub event_name: String,
    pub command: String,
}

impl NodeCommand {
    pub fn new(event_name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            command: command.into(),
        }
    }
}

/// Which PKI material survives a control-plane re-init
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeepCerts {
    /// Wipe the PKI directory
    #[default]
    None,
    /// Keep only the cluster CA
    Ca,
    /// Keep the whole PKI directory
    All,
}

impl FromStr for KeepCerts {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "ca" => Ok(Self::Ca),
            "all" => Ok(Self::All),
            other => anyhow::bail!("Unknown keep-certs policy '{}' (expected none, ca or all)", other),
        }
    }
}

impl fmt::Display for KeepCerts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Ca => "ca",
            Self::All => "all",
        };
        f.write_str(s)
    }
}
