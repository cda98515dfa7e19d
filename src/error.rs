//! Typed failure kinds for cluster orchestration
//!
//! Operations return `anyhow::Result`; the variants below are the failures a
//! caller may want to match on. Recover them with
//! `err.downcast_ref::<ClusterError>()`.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClusterError {
    /// The cluster has no node flagged as master
    #[error("no master found")]
    NoMasterFound,

    /// Quorum operations were requested on a cluster without etcd members
    #[error("no etcd nodes available")]
    NoEtcdNodes,

    /// etcd quorum must have an odd member count
    #[error("etcd quorum needs an odd number of members, found {0}")]
    EvenQuorum(usize),

    #[error("snapshot '{name}' not found on {node}")]
    SnapshotNotFound { name: String, node: String },

    /// Remote command exited non-zero
    #[error("command '{command}' on {node} exited with status {status}: {stderr}")]
    CommandFailed {
        node: String,
        command: String,
        status: i32,
        stderr: String,
    },

    /// SSH dial kept failing after the configured number of attempts
    #[error("could not reach {node} after {attempts} attempts: {stderr}")]
    Unreachable {
        node: String,
        attempts: u32,
        stderr: String,
    },

    #[error("timed out after {elapsed:?} waiting for {what} on {node}")]
    Timeout {
        node: String,
        what: String,
        elapsed: Duration,
    },

    #[error("invalid mesh address '{0}'")]
    InvalidMeshAddress(String),

    #[error("malformed key pair output: {0}")]
    MalformedKeyPairs(String),

    #[error("ssh key '{0}' is not configured")]
    UnknownSshKey(String),

    #[error("incorrect passphrase for {}", .0.display())]
    IncorrectPassphrase(PathBuf),

    /// A sibling task failed and this one stopped early
    #[error("operation cancelled")]
    Cancelled,
}

impl ClusterError {
    pub fn command_failed(
        node: impl Into<String>,
        command: impl Into<String>,
        status: i32,
        stderr: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            node: node.into(),
            command: command.into(),
            status,
            stderr: stderr.into(),
        }
    }

    pub fn timeout(node: impl Into<String>, what: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            node: node.into(),
            what: what.into(),
            elapsed,
        }
    }

    /// Precondition failures are returned immediately and never retried
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::NoMasterFound
                | Self::NoEtcdNodes
                | Self::EvenQuorum(_)
                | Self::SnapshotNotFound { .. }
        )
    }
}

/// Find a [`ClusterError`] anywhere in an anyhow error chain
pub fn find_cluster_error(err: &anyhow::Error) -> Option<&ClusterError> {
    err.chain().find_map(|cause| cause.downcast_ref::<ClusterError>())
}
