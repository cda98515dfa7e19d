//! Per-node fan-out with first-error-wins fan-in
//!
//! One task per item is spawned into a [`JoinSet`]. The first failure is
//! returned to the caller; sibling tasks are cancelled through a shared
//! [`CancellationToken`], given a bounded grace period to stop, then aborted.

use crate::error::ClusterError;
use anyhow::{Result, anyhow};
use std::future::Future;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

fn flatten(joined: Result<Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(anyhow!("node task panicked: {}", e)),
        Err(e) => Err(anyhow!("node task was aborted: {}", e)),
    }
}

/// Run `task` for every item concurrently.
///
/// Returns `Ok(())` once every task has reported success, or the first error
/// observed. No task outlives this call.
pub async fn fan_out<T, F, Fut>(
    items: impl IntoIterator<Item = T>,
    grace: Duration,
    task: F,
) -> Result<()>
where
    T: Send + 'static,
    F: Fn(T, CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let token = CancellationToken::new();
    let mut set = JoinSet::new();
    for item in items {
        set.spawn(task(item, token.child_token()));
    }

    let mut first_error = None;
    while let Some(joined) = set.join_next().await {
        if let Err(e) = flatten(joined) {
            first_error = Some(e);
            break;
        }
    }

    let Some(err) = first_error else {
        return Ok(());
    };

    debug!(remaining = set.len(), error = %err, "fan-out failed, cancelling siblings");
    token.cancel();

    let drained = tokio::time::timeout(grace, async {
        while let Some(joined) = set.join_next().await {
            if let Err(e) = flatten(joined) {
                debug!(error = %e, "sibling stopped after cancellation");
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            remaining = set.len(),
            grace_ms = grace.as_millis() as u64,
            "aborting tasks that ignored cancellation"
        );
        set.abort_all();
        while set.join_next().await.is_some() {}
    }

    Err(err)
}

/// Race `fut` against cancellation of `token`.
///
/// Dropping the losing future is what stops an in-flight remote command.
pub async fn until_cancelled<T>(
    token: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(ClusterError::Cancelled.into()),
        result = fut => result,
    }
}
