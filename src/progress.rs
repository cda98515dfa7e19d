//! Per-node progress reporting
//!
//! Each registered node owns an unbounded channel and a single consumer task
//! that drives its progress bar, so events for one node are applied in order
//! and never interleave with another node's.

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Terminal event: forces the counter to its total and ends the node's consumer
pub const COMPLETED: &str = "completed";

/// Terminal event for a node whose step sequence failed
pub const FAILED: &str = "failed";

/// Sink for per-node progress events.
///
/// Calls never block on rendering.
pub trait EventService: Send + Sync {
    fn start_progress(&self, name: &str, total_steps: u64);

    fn add_event(&self, name: &str, event: &str);

    fn complete_progress(&self, name: &str) {
        self.add_event(name, COMPLETED);
    }

    fn fail_progress(&self, name: &str) {
        self.add_event(name, FAILED);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub status: String,
    pub position: u64,
    pub total: u64,
    pub finished: bool,
}

/// Apply one event, returning true when it was terminal
fn apply_event(state: &mut ProgressSnapshot, event: &str) -> bool {
    match event {
        COMPLETED => {
            state.position = state.total;
            state.status = COMPLETED.to_string();
            state.finished = true;
            true
        }
        FAILED => {
            state.status = FAILED.to_string();
            state.finished = true;
            true
        }
        _ => {
            state.position = (state.position + 1).min(state.total);
            state.status = event.to_string();
            false
        }
    }
}

struct NodeProgress {
    sender: mpsc::UnboundedSender<String>,
    state: Arc<Mutex<ProgressSnapshot>>,
    handle: Option<JoinHandle<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix:>16.bold} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// Renders one progress bar per node.
///
/// `start_progress` spawns the node's consumer and must be called from
/// within a tokio runtime.
pub struct ProgressCoordinator {
    multi: MultiProgress,
    nodes: Mutex<HashMap<String, NodeProgress>>,
    /// Consumers of re-registered nodes that may still be draining
    retired: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Default for ProgressCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressCoordinator {
    pub fn new() -> Self {
        Self::with_multi(MultiProgress::new())
    }

    /// Coordinator that tracks state without drawing anything
    pub fn hidden() -> Self {
        Self::with_multi(MultiProgress::with_draw_target(ProgressDrawTarget::hidden()))
    }

    fn with_multi(multi: MultiProgress) -> Self {
        Self {
            multi,
            nodes: Mutex::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
        }
    }

    pub fn progress(&self, name: &str) -> Option<ProgressSnapshot> {
        lock(&self.nodes)
            .get(name)
            .map(|node| lock(&node.state).clone())
    }

    /// Wait for every consumer to exit, including those of replaced registrations
    pub async fn wait(&self) {
        let mut handles: Vec<(String, JoinHandle<()>)> = std::mem::take(&mut *lock(&self.retired));
        handles.extend(
            lock(&self.nodes)
                .iter_mut()
                .filter_map(|(name, node)| node.handle.take().map(|h| (name.clone(), h))),
        );

        for (name, handle) in handles {
            if let Err(e) = handle.await {
                warn!(node = %name, error = %e, "progress consumer ended abnormally");
            }
        }
    }
}

async fn consume(
    mut events: mpsc::UnboundedReceiver<String>,
    bar: ProgressBar,
    state: Arc<Mutex<ProgressSnapshot>>,
) {
    while let Some(event) = events.recv().await {
        let (terminal, snapshot) = {
            let mut state = lock(&state);
            let terminal = apply_event(&mut state, &event);
            (terminal, state.clone())
        };

        bar.set_position(snapshot.position);
        if terminal {
            if snapshot.status == COMPLETED {
                bar.finish_with_message(snapshot.status);
            } else {
                bar.abandon_with_message(snapshot.status);
            }
            break;
        }
        bar.set_message(snapshot.status);
    }
}

impl EventService for ProgressCoordinator {
    fn start_progress(&self, name: &str, total_steps: u64) {
        let bar = self.multi.add(ProgressBar::new(total_steps));
        bar.set_style(bar_style());
        bar.set_prefix(name.to_string());

        let state = Arc::new(Mutex::new(ProgressSnapshot {
            total: total_steps,
            ..Default::default()
        }));
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(consume(receiver, bar, state.clone()));

        let previous = lock(&self.nodes).insert(
            name.to_string(),
            NodeProgress {
                sender,
                state,
                handle: Some(handle),
            },
        );
        if let Some(mut previous) = previous {
            // Dropping the old sender lets its consumer drain and exit
            if !lock(&previous.state).finished {
                debug!(node = %name, "restarting unfinished progress");
            }
            if let Some(handle) = previous.handle.take() {
                lock(&self.retired).push((name.to_string(), handle));
            }
        }
    }

    fn add_event(&self, name: &str, event: &str) {
        let nodes = lock(&self.nodes);
        match nodes.get(name) {
            Some(node) => {
                if node.sender.send(event.to_string()).is_err() {
                    debug!(node = %name, event, "event after terminal event dropped");
                }
            }
            None => warn!(node = %name, event, "event for unregistered node dropped"),
        }
    }
}
