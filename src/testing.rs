//! In-memory collaborators for orchestration tests

use crate::cluster::{Cluster, Node, StaticClusterProvider};
use crate::config::{KubestrapConfig, SshKeyConfig};
use crate::error::ClusterError;
use crate::progress::EventService;
use crate::services::cluster::ClusterManager;
use crate::utils::retry::RetryPolicy;
use crate::utils::ssh::NodeCommunicator;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

enum Reply {
    Output(String),
    Fail(String),
    /// Fail this many more times, then fall through to later rules
    FailTimes(u32, String),
    Hang,
}

struct Rule {
    node: Option<String>,
    pattern: String,
    reply: Reply,
}

#[derive(Default)]
struct FakeState {
    files: HashMap<(String, String), Vec<u8>>,
    rules: Vec<Rule>,
    log: Vec<(String, String)>,
    captured: Vec<String>,
}

/// Scripted [`NodeCommunicator`] with a per-node in-memory filesystem.
///
/// Commands succeed with empty output unless a rule matches. Rules match when
/// the command contains their pattern and are checked in insertion order.
#[derive(Default)]
pub(crate) struct FakeCommunicator {
    state: Mutex<FakeState>,
}

impl FakeCommunicator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn rule(&self, node: Option<&str>, pattern: &str, reply: Reply) {
        self.state().rules.push(Rule {
            node: node.map(str::to_string),
            pattern: pattern.to_string(),
            reply,
        });
    }

    pub fn respond(&self, pattern: &str, output: &str) {
        self.rule(None, pattern, Reply::Output(output.to_string()));
    }

    pub fn fail_on(&self, node: &str, pattern: &str, stderr: &str) {
        self.rule(Some(node), pattern, Reply::Fail(stderr.to_string()));
    }

    pub fn fail_times(&self, node: &str, pattern: &str, times: u32, stderr: &str) {
        self.rule(Some(node), pattern, Reply::FailTimes(times, stderr.to_string()));
    }

    pub fn hang_on(&self, node: &str, pattern: &str) {
        self.rule(Some(node), pattern, Reply::Hang);
    }

    pub fn put_file(&self, node: &str, path: &str, content: &[u8]) {
        self.state()
            .files
            .insert((node.to_string(), path.to_string()), content.to_vec());
    }

    pub fn file(&self, node: &str, path: &str) -> Option<String> {
        self.state()
            .files
            .get(&(node.to_string(), path.to_string()))
            .map(|c| String::from_utf8_lossy(c).into_owned())
    }

    /// Commands and file writes in the order they happened, across all nodes
    pub fn log(&self) -> Vec<(String, String)> {
        self.state().log.clone()
    }

    pub fn commands(&self, node: &str) -> Vec<String> {
        self.state()
            .log
            .iter()
            .filter(|(n, _)| n == node)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn captured(&self) -> Vec<String> {
        self.state().captured.clone()
    }

    /// None means the command completes with that result; Some(None) hangs
    fn reply_for(&self, node: &str, command: &str) -> Option<Result<String, String>> {
        let mut state = self.state();
        state.log.push((node.to_string(), command.to_string()));

        for rule in state.rules.iter_mut() {
            if rule.node.as_deref().is_some_and(|n| n != node) || !command.contains(&rule.pattern) {
                continue;
            }
            match &mut rule.reply {
                Reply::Output(out) => return Some(Ok(out.clone())),
                Reply::Fail(stderr) => return Some(Err(stderr.clone())),
                Reply::FailTimes(remaining, stderr) if *remaining > 0 => {
                    *remaining -= 1;
                    return Some(Err(stderr.clone()));
                }
                Reply::FailTimes(..) => continue,
                Reply::Hang => return None,
            }
        }
        Some(Ok(String::new()))
    }
}

#[async_trait]
impl NodeCommunicator for FakeCommunicator {
    async fn run_cmd(&self, node: &Node, command: &str) -> Result<String> {
        match self.reply_for(&node.name, command) {
            Some(Ok(out)) => Ok(out),
            Some(Err(stderr)) => {
                Err(ClusterError::command_failed(&node.name, command, 1, stderr).into())
            }
            None => std::future::pending().await,
        }
    }

    async fn read_file(&self, node: &Node, path: &str) -> Result<Vec<u8>> {
        let command = format!("cat {}", path);
        if let Some(Err(stderr)) = self.reply_for(&node.name, &command) {
            return Err(ClusterError::command_failed(&node.name, command, 1, stderr).into());
        }
        self.state()
            .files
            .get(&(node.name.clone(), path.to_string()))
            .cloned()
            .ok_or_else(|| {
                ClusterError::command_failed(
                    &node.name,
                    command,
                    1,
                    format!("cat: {}: No such file or directory", path),
                )
                .into()
            })
    }

    async fn write_file(
        &self,
        node: &Node,
        path: &str,
        content: &[u8],
        _executable: bool,
    ) -> Result<()> {
        let command = format!("write {}", path);
        match self.reply_for(&node.name, &command) {
            Some(Err(stderr)) => {
                Err(ClusterError::command_failed(&node.name, command, 1, stderr).into())
            }
            None => std::future::pending().await,
            Some(Ok(_)) => {
                self.put_file(&node.name, path, content);
                Ok(())
            }
        }
    }

    async fn capture_passphrase(&self, key_name: &str) -> Result<()> {
        self.state().captured.push(key_name.to_string());
        Ok(())
    }
}

/// [`EventService`] that remembers everything it was told
#[derive(Default)]
pub(crate) struct RecordingEvents {
    started: Mutex<Vec<(String, u64)>>,
    events: Mutex<Vec<(String, String)>>,
}

impl RecordingEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events_for(&self, name: &str) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn started(&self) -> Vec<(String, u64)> {
        self.started.lock().unwrap().clone()
    }
}

impl EventService for RecordingEvents {
    fn start_progress(&self, name: &str, total_steps: u64) {
        self.started
            .lock()
            .unwrap()
            .push((name.to_string(), total_steps));
    }

    fn add_event(&self, name: &str, event: &str) {
        self.events
            .lock()
            .unwrap()
            .push((name.to_string(), event.to_string()));
    }
}

/// Configuration with millisecond retries and timeouts
pub(crate) fn fast_config() -> KubestrapConfig {
    let mut config = KubestrapConfig::default();
    let quick = |attempts| RetryPolicy::fixed(attempts, Duration::from_millis(1));
    config.retry.dial = quick(3);
    config.retry.join_token = quick(3);
    config.retry.provision = quick(3);
    config.timeouts.poll_interval_ms = 1;
    config.timeouts.kubelet_config_secs = 1;
    config.timeouts.apiserver_ready_secs = 1;
    config.timeouts.straggler_grace_secs = 1;
    config.ssh.keys.insert(
        "default".to_string(),
        SshKeyConfig {
            private_key_path: PathBuf::from("/keys/id_ed25519"),
            public_key_path: None,
        },
    );
    config
}

pub(crate) fn node(name: &str, index: u8, is_master: bool, is_etcd: bool) -> Node {
    Node {
        name: name.to_string(),
        server_type: "cx21".to_string(),
        is_master,
        is_etcd,
        ip_address: format!("203.0.113.{}", index),
        private_ip_address: format!("10.0.1.{}", 10 + index),
        ssh_key_name: "default".to_string(),
        wireguard_key_pair: None,
    }
}

/// Cluster named `test` with masters, dedicated etcd members, then workers
pub(crate) fn cluster(masters: usize, etcd: usize, workers: usize) -> Cluster {
    let mut nodes = Vec::new();
    let mut index = 1u8;
    for i in 1..=masters {
        nodes.push(node(&format!("master-{}", i), index, true, false));
        index += 1;
    }
    for i in 1..=etcd {
        nodes.push(node(&format!("etcd-{}", i), index, false, true));
        index += 1;
    }
    for i in 1..=workers {
        nodes.push(node(&format!("worker-{}", i), index, false, false));
        index += 1;
    }
    Cluster {
        name: "test".to_string(),
        nodes,
        node_cidr: "10.0.1.0/24".to_string(),
        ..Default::default()
    }
}

pub(crate) struct Harness {
    pub manager: ClusterManager,
    pub fake: Arc<FakeCommunicator>,
    pub events: Arc<RecordingEvents>,
}

pub(crate) fn harness(cluster: Cluster) -> Harness {
    harness_with_provider(StaticClusterProvider::new(cluster))
}

pub(crate) fn harness_with_provider(provider: StaticClusterProvider) -> Harness {
    let fake = FakeCommunicator::new();
    let events = RecordingEvents::new();
    let manager = ClusterManager::new(
        Arc::new(provider),
        fake.clone(),
        events.clone(),
        fast_config(),
    );
    Harness {
        manager,
        fake,
        events,
    }
}
