//! etcd snapshot backup and restore
//!
//! Handles snapshot creation on the first etcd member and a cluster-wide
//! restore from one of its snapshots.

use crate::cluster::{ClusterProvider, Node, validate_quorum};
use crate::config::KubestrapConfig;
use crate::error::ClusterError;
use crate::services::templates::{
    ETCD_BIN_DIR, ETCD_DATA_DIR, initial_cluster, peer_url, start_etcd_command,
};
use crate::utils::fanout::{fan_out, until_cancelled};
use crate::utils::ssh::{NodeCommunicator, shell_escape};
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

pub const SNAPSHOT_DIR: &str = "/root/etcd-snapshots";
const SNAPSHOT_NAME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

fn etcdctl() -> String {
    format!("ETCDCTL_API=3 {}/etcdctl", ETCD_BIN_DIR)
}

fn etcdctl_local() -> String {
    format!("{} --endpoints=http://127.0.0.1:2379", etcdctl())
}

pub fn snapshot_path(name: &str) -> String {
    format!("{}/{}.db", SNAPSHOT_DIR, name)
}

fn snapshot_save_command(name: &str) -> String {
    format!(
        "mkdir -p {} && {} snapshot save {}",
        SNAPSHOT_DIR,
        etcdctl_local(),
        shell_escape(&snapshot_path(name))
    )
}

fn snapshot_status_command(name: &str) -> String {
    format!("{} snapshot status {}", etcdctl(), shell_escape(&snapshot_path(name)))
}

fn snapshot_restore_command(name: &str, node: &Node, cluster: &str) -> String {
    format!(
        "{} snapshot restore {} --name {} --initial-cluster {} --initial-advertise-peer-urls {} --data-dir {}",
        etcdctl(),
        shell_escape(&snapshot_path(name)),
        shell_escape(&node.name),
        shell_escape(cluster),
        peer_url(node),
        ETCD_DATA_DIR
    )
}

fn validate_name(name: &str) -> Result<()> {
    if name.contains('/') || name.starts_with('.') {
        anyhow::bail!("Invalid snapshot name '{}'", name);
    }
    Ok(())
}

/// Snapshot operations against the cluster's etcd members
pub struct EtcdManager {
    provider: Arc<dyn ClusterProvider>,
    communicator: Arc<dyn NodeCommunicator>,
    config: KubestrapConfig,
}

impl EtcdManager {
    pub fn new(
        provider: Arc<dyn ClusterProvider>,
        communicator: Arc<dyn NodeCommunicator>,
        config: KubestrapConfig,
    ) -> Self {
        Self {
            provider,
            communicator,
            config,
        }
    }

    /// The first etcd member; snapshots are taken and kept there
    fn anchor(&self) -> Result<Node, ClusterError> {
        self.provider
            .get_etcd_nodes()
            .into_iter()
            .next()
            .ok_or(ClusterError::NoEtcdNodes)
    }

    /// Save a snapshot on the anchor member and return its name.
    ///
    /// An empty `name` is replaced by the current UTC timestamp.
    pub async fn create_snapshot(&self, name: &str) -> Result<String> {
        let anchor = self.anchor()?;
        let name = if name.is_empty() {
            Utc::now().format(SNAPSHOT_NAME_FORMAT).to_string()
        } else {
            name.to_string()
        };
        validate_name(&name)?;

        info!(node = %anchor.name, snapshot = %name, "creating etcd snapshot");
        self.communicator
            .run_cmd(&anchor, &snapshot_save_command(&name))
            .await
            .with_context(|| format!("{}: create snapshot {}", anchor.name, name))?;
        Ok(name)
    }

    /// Names of the snapshots stored on the anchor member, sorted
    pub async fn list_snapshots(&self) -> Result<Vec<String>> {
        let anchor = self.anchor()?;
        let output = self
            .communicator
            .run_cmd(&anchor, &format!("mkdir -p {0} && ls -1 {0}", SNAPSHOT_DIR))
            .await
            .with_context(|| format!("{}: list snapshots", anchor.name))?;

        let mut names: Vec<String> = output
            .lines()
            .filter_map(|line| line.trim().strip_suffix(".db"))
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }

    /// Restore every etcd member from snapshot `name`.
    ///
    /// Nothing is stopped until every member holds a readable copy of the
    /// snapshot. A failure after members were stopped is not rolled back and
    /// leaves the quorum partially restored.
    pub async fn restore_snapshot(&self, name: &str, skip_distribution: bool) -> Result<()> {
        validate_name(name)?;
        let members = self.provider.get_etcd_nodes();
        validate_quorum(&members)?;
        let anchor = members[0].clone();
        let path = snapshot_path(name);

        if let Err(e) = self
            .communicator
            .run_cmd(&anchor, &format!("test -f {}", shell_escape(&path)))
            .await
        {
            return match e.downcast_ref::<ClusterError>() {
                Some(ClusterError::CommandFailed { .. }) => Err(ClusterError::SnapshotNotFound {
                    name: name.to_string(),
                    node: anchor.name.clone(),
                }
                .into()),
                _ => Err(e.context(format!("{}: check snapshot", anchor.name))),
            };
        }

        let grace = self.config.timeouts.straggler_grace();

        if skip_distribution {
            info!(snapshot = %name, "skipping snapshot distribution");
        } else {
            let targets: Vec<Node> = members[1..].to_vec();
            info!(snapshot = %name, targets = targets.len(), "distributing snapshot");
            let comm = self.communicator.clone();
            let (source, path) = (anchor.clone(), path.clone());
            fan_out(targets, grace, move |target, token| {
                let (comm, source, path) = (comm.clone(), source.clone(), path.clone());
                async move {
                    until_cancelled(&token, comm.copy_file_over_node(&source, &target, &path))
                        .await
                        .with_context(|| format!("{}: distribute snapshot", target.name))
                }
            })
            .await?;
        }

        // Every member must be able to read the snapshot before anything is stopped
        let status = snapshot_status_command(name);
        self.on_members(&members, "verify snapshot", move |_| status.clone())
            .await?;

        warn!(snapshot = %name, members = members.len(), "stopping etcd for restore");
        self.on_members(&members, "stop etcd", |_| "systemctl stop etcd".to_string())
            .await
            .inspect_err(|e| error!(error = %e, "etcd restore aborted while stopping members"))?;

        let cluster = initial_cluster(&members);
        let name = name.to_string();
        self.on_members(&members, "restore snapshot", move |node| {
            format!(
                "rm -rf {} && {} && {}",
                ETCD_DATA_DIR,
                snapshot_restore_command(&name, node, &cluster),
                start_etcd_command()
            )
        })
        .await
        .inspect_err(|e| error!(error = %e, "etcd restore left the quorum partially restored"))?;

        info!(members = members.len(), "etcd restored from snapshot");
        Ok(())
    }

    /// Run one command per member concurrently, first error wins
    async fn on_members<F>(&self, members: &[Node], label: &'static str, command: F) -> Result<()>
    where
        F: Fn(&Node) -> String,
    {
        let jobs: Vec<(Node, String)> = members.iter().map(|n| (n.clone(), command(n))).collect();
        let comm = self.communicator.clone();
        fan_out(
            jobs,
            self.config.timeouts.straggler_grace(),
            move |(node, command), token| {
                let comm = comm.clone();
                async move {
                    until_cancelled(&token, comm.run_cmd(&node, &command))
                        .await
                        .map(drop)
                        .inspect_err(|e| error!(node = %node.name, step = label, error = %e, "etcd step failed"))
                        .with_context(|| format!("{}: {}", node.name, label))
                }
            },
        )
        .await
    }
}
