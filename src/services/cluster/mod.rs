//! Cluster orchestration service
//!
//! Every public operation builds a per-node list of [`Step`]s and runs the
//! lists concurrently with first-error-wins semantics. Operations are split by
//! concern:
//! - `provision`: container runtime and Kubernetes packages
//! - `network`: WireGuard mesh keys and configuration
//! - `etcd`: external etcd members
//! - `masters`: control-plane bootstrap
//! - `workers`: worker join
//! - `ha`: load balancer and multi-master rewiring

mod etcd;
mod ha;
mod masters;
mod network;
mod provision;
mod workers;

use crate::cluster::{Cluster, ClusterProvider, Node, NodeCommand};
use crate::config::KubestrapConfig;
use crate::error::ClusterError;
use crate::progress::EventService;
use crate::utils::fanout::{fan_out, until_cancelled};
use crate::utils::retry::{RetryPolicy, poll_until, retry_with_backoff};
use crate::utils::ssh::{NodeCommunicator, Transform};
use anyhow::Result;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// One unit of remote work; its label is the progress event and error context
#[derive(Clone)]
pub(crate) enum Step {
    /// Progress marker only
    Note(String),
    Run {
        label: String,
        command: String,
    },
    Retry {
        label: String,
        command: String,
        policy: RetryPolicy,
    },
    Upload {
        label: String,
        path: String,
        content: Vec<u8>,
        executable: bool,
    },
    CopyFrom {
        label: String,
        source: Node,
        paths: Vec<String>,
    },
    /// Rewrite files in place on the node itself
    Rewrite {
        label: String,
        paths: Vec<String>,
        transform: Arc<Transform>,
    },
    /// Poll `command` until it exits zero
    WaitFor {
        label: String,
        command: String,
        timeout: Duration,
    },
}

impl Step {
    pub fn note(label: &str) -> Self {
        Self::Note(label.to_string())
    }

    pub fn run(label: &str, command: impl Into<String>) -> Self {
        Self::Run {
            label: label.to_string(),
            command: command.into(),
        }
    }

    pub fn retry(label: &str, command: impl Into<String>, policy: RetryPolicy) -> Self {
        Self::Retry {
            label: label.to_string(),
            command: command.into(),
            policy,
        }
    }

    pub fn upload(label: &str, path: &str, content: impl Into<Vec<u8>>, executable: bool) -> Self {
        Self::Upload {
            label: label.to_string(),
            path: path.to_string(),
            content: content.into(),
            executable,
        }
    }

    pub fn copy_from(label: &str, source: &Node, paths: &[&str]) -> Self {
        Self::CopyFrom {
            label: label.to_string(),
            source: source.clone(),
            paths: paths.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn rewrite(
        label: &str,
        paths: &[&str],
        transform: impl Fn(&str) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        Self::Rewrite {
            label: label.to_string(),
            paths: paths.iter().map(|p| p.to_string()).collect(),
            transform: Arc::new(transform),
        }
    }

    pub fn wait_for(label: &str, command: impl Into<String>, timeout: Duration) -> Self {
        Self::WaitFor {
            label: label.to_string(),
            command: command.into(),
            timeout,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Note(label)
            | Self::Run { label, .. }
            | Self::Retry { label, .. }
            | Self::Upload { label, .. }
            | Self::CopyFrom { label, .. }
            | Self::Rewrite { label, .. }
            | Self::WaitFor { label, .. } => label,
        }
    }
}

impl From<NodeCommand> for Step {
    fn from(command: NodeCommand) -> Self {
        Self::Run {
            label: command.event_name,
            command: command.command,
        }
    }
}

struct Inner {
    cluster: RwLock<Cluster>,
    provider: Arc<dyn ClusterProvider>,
    communicator: Arc<dyn NodeCommunicator>,
    events: Arc<dyn EventService>,
    config: KubestrapConfig,
}

/// Owns the authoritative cluster for a run. Cheap to clone.
#[derive(Clone)]
pub struct ClusterManager {
    inner: Arc<Inner>,
}

impl ClusterManager {
    pub fn new(
        provider: Arc<dyn ClusterProvider>,
        communicator: Arc<dyn NodeCommunicator>,
        events: Arc<dyn EventService>,
        config: KubestrapConfig,
    ) -> Self {
        let cluster = provider.get_cluster();
        Self {
            inner: Arc::new(Inner {
                cluster: RwLock::new(cluster),
                provider,
                communicator,
                events,
                config,
            }),
        }
    }

    pub fn config(&self) -> &KubestrapConfig {
        &self.inner.config
    }

    pub fn communicator(&self) -> &Arc<dyn NodeCommunicator> {
        &self.inner.communicator
    }

    pub fn events(&self) -> &Arc<dyn EventService> {
        &self.inner.events
    }

    fn read(&self) -> RwLockReadGuard<'_, Cluster> {
        self.inner.cluster.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Cluster> {
        self.inner.cluster.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Append nodes to the cluster. Names must stay unique.
    pub fn add_nodes(&self, nodes: &[Node]) -> Result<()> {
        let mut cluster = self.write();
        for node in nodes {
            if cluster.node(&node.name).is_some() {
                anyhow::bail!("Node '{}' already exists in cluster '{}'", node.name, cluster.name);
            }
        }
        cluster.nodes.extend(nodes.iter().cloned());
        info!(count = nodes.len(), "added nodes to cluster");
        Ok(())
    }

    pub fn mark_phase_completed(&self, phase: &str) {
        self.write().mark_phase_completed(phase);
    }

    /// Replace the stored copy of each given node, matched by name
    fn store_nodes(&self, nodes: &[Node]) {
        let mut cluster = self.write();
        for updated in nodes {
            if let Some(existing) = cluster.nodes.iter_mut().find(|n| n.name == updated.name) {
                *existing = updated.clone();
            }
        }
    }

    /// Build each node's steps, then run every list concurrently
    async fn run_on_nodes<F>(&self, nodes: Vec<Node>, plan: F) -> Result<()>
    where
        F: Fn(&Node) -> Result<Vec<Step>>,
    {
        let jobs = nodes
            .into_iter()
            .map(|node| {
                let steps = plan(&node)?;
                Ok((node, steps))
            })
            .collect::<Result<Vec<_>>>()?;

        let manager = self.clone();
        fan_out(
            jobs,
            self.config().timeouts.straggler_grace(),
            move |(node, steps), token| {
                let manager = manager.clone();
                async move { manager.run_steps(&node, &steps, &token).await }
            },
        )
        .await
    }

    /// Run `steps` in order on `node`, stopping at the first failure or on cancellation
    pub(crate) async fn run_steps(
        &self,
        node: &Node,
        steps: &[Step],
        token: &CancellationToken,
    ) -> Result<()> {
        let events = self.events();
        events.start_progress(&node.name, steps.len() as u64);

        for step in steps {
            let label = step.label();
            let result = if token.is_cancelled() {
                Err(ClusterError::Cancelled.into())
            } else {
                events.add_event(&node.name, label);
                debug!(node = %node.name, step = label, "running step");
                until_cancelled(token, self.execute(node, step)).await
            };

            if let Err(e) = result {
                events.fail_progress(&node.name);
                if !matches!(e.downcast_ref::<ClusterError>(), Some(ClusterError::Cancelled)) {
                    error!(node = %node.name, step = label, error = %e, "step failed");
                }
                return Err(e.context(format!("{}: {}", node.name, label)));
            }
        }

        events.complete_progress(&node.name);
        Ok(())
    }

    async fn execute(&self, node: &Node, step: &Step) -> Result<()> {
        let comm = self.communicator();
        match step {
            Step::Note(_) => Ok(()),
            Step::Run { command, .. } => comm.run_cmd(node, command).await.map(drop),
            Step::Retry {
                label,
                command,
                policy,
            } => {
                let operation = format!("{}: {}", node.name, label);
                retry_with_backoff(policy, &operation, move || comm.run_cmd(node, command))
                    .await
                    .map(drop)
            }
            Step::Upload {
                path,
                content,
                executable,
                ..
            } => comm.write_file(node, path, content, *executable).await,
            Step::CopyFrom { source, paths, .. } => {
                for path in paths {
                    comm.copy_file_over_node(source, node, path).await?;
                }
                Ok(())
            }
            Step::Rewrite {
                paths, transform, ..
            } => {
                for path in paths {
                    comm.transform_file_over_node(node, node, path, &**transform)
                        .await?;
                }
                Ok(())
            }
            Step::WaitFor {
                label,
                command,
                timeout,
            } => {
                poll_until(
                    &node.name,
                    label,
                    *timeout,
                    self.config().timeouts.poll_interval(),
                    move || async move { comm.run_cmd(node, command).await.map(|_| true) },
                )
                .await
            }
        }
    }
}

impl ClusterProvider for ClusterManager {
    fn get_cluster(&self) -> Cluster {
        self.read().clone()
    }

    fn get_additional_master_install_commands(&self) -> Vec<NodeCommand> {
        self.inner.provider.get_additional_master_install_commands()
    }
}
