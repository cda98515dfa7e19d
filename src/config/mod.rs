//! Orchestrator configuration
//!
//! One explicit struct handed to every constructor. Nothing here is global.

pub mod config_manager;

pub use config_manager::{
    expand_home, get_config_dir, get_config_file_path, load_config, load_config_from, save_config,
    save_config_to,
};

use crate::error::ClusterError;
use crate::utils::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubestrapConfig {
    pub ssh: SshConfig,
    pub retry: RetryConfig,
    pub timeouts: TimeoutConfig,
    pub kubernetes: KubernetesConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub user: String,
    pub port: u16,
    pub connect_timeout_secs: u64,
    /// OpenSSH client binary, looked up on PATH unless absolute
    pub program: PathBuf,
    /// SSH keys by name, as referenced from `Node::ssh_key_name`
    pub keys: BTreeMap<String, SshKeyConfig>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            port: 22,
            connect_timeout_secs: 10,
            program: PathBuf::from("ssh"),
            keys: BTreeMap::new(),
        }
    }
}

impl SshConfig {
    pub fn key(&self, name: &str) -> Result<&SshKeyConfig, ClusterError> {
        self.keys
            .get(name)
            .ok_or_else(|| ClusterError::UnknownSshKey(name.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshKeyConfig {
    pub private_key_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_path: Option<PathBuf>,
}

/// Retry policy per call site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub dial: RetryPolicy,
    pub join_token: RetryPolicy,
    pub provision: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            dial: RetryPolicy::fixed(11, Duration::from_secs(1)),
            join_token: RetryPolicy::fixed(5, Duration::from_secs(3)),
            provision: RetryPolicy::fixed(3, Duration::from_secs(10)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub kubelet_config_secs: u64,
    pub apiserver_ready_secs: u64,
    pub poll_interval_ms: u64,
    /// How long a failed fan-out waits for sibling tasks before aborting them
    pub straggler_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            kubelet_config_secs: 120,
            apiserver_ready_secs: 300,
            poll_interval_ms: 2000,
            straggler_grace_secs: 10,
        }
    }
}

impl TimeoutConfig {
    pub fn kubelet_config(&self) -> Duration {
        Duration::from_secs(self.kubelet_config_secs)
    }

    pub fn apiserver_ready(&self) -> Duration {
        Duration::from_secs(self.apiserver_ready_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn straggler_grace(&self) -> Duration {
        Duration::from_secs(self.straggler_grace_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    /// Minor release channel for the pkgs.k8s.io apt repository
    pub version: String,
    pub pod_subnet: String,
    pub pod_network_manifest: String,
    pub etcd_version: String,
    pub etcd_download_url: String,
    pub load_balancer_image: String,
    pub load_balancer_port: u16,
    pub wireguard_port: u16,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            version: "v1.29".to_string(),
            pod_subnet: "10.244.0.0/16".to_string(),
            pod_network_manifest:
                "https://github.com/flannel-io/flannel/releases/latest/download/kube-flannel.yml"
                    .to_string(),
            etcd_version: "v3.5.12".to_string(),
            etcd_download_url: "https://github.com/etcd-io/etcd/releases/download".to_string(),
            load_balancer_image: "xetys/k8s-master-lb".to_string(),
            load_balancer_port: 16443,
            wireguard_port: 51820,
        }
    }
}
