//! Ordered phase execution
//!
//! Each phase decides whether it must run. Phases that ran are followed by the
//! chain's after-run hook, typically persisting cluster state. The first
//! failure stops the chain; earlier phases are not rolled back.

pub mod cluster;

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use tracing::{error, info};

#[async_trait]
pub trait Phase: Send + Sync {
    fn name(&self) -> &str;

    fn should_run(&self) -> bool;

    async fn run(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    Pending,
    Skipped,
    Running,
    Done,
    Failed,
}

impl PhaseState {
    /// Terminal phases are not revisited when the chain runs again. A failed
    /// phase is not terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Skipped | Self::Done)
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Skipped => write!(f, "Skipped"),
            Self::Running => write!(f, "Running"),
            Self::Done => write!(f, "Done"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

pub type AfterRunHook = Box<dyn FnMut(&str) -> Result<()> + Send>;

pub struct PhaseChain {
    phases: Vec<(Box<dyn Phase>, PhaseState)>,
    after_run: Option<AfterRunHook>,
}

impl PhaseChain {
    pub fn new(phases: Vec<Box<dyn Phase>>) -> Self {
        Self {
            phases: phases
                .into_iter()
                .map(|p| (p, PhaseState::Pending))
                .collect(),
            after_run: None,
        }
    }

    /// Hook invoked with the phase name after every phase that ran
    pub fn after_run(mut self, hook: impl FnMut(&str) -> Result<()> + Send + 'static) -> Self {
        self.after_run = Some(Box::new(hook));
        self
    }

    pub fn states(&self) -> Vec<(String, PhaseState)> {
        self.phases
            .iter()
            .map(|(p, state)| (p.name().to_string(), *state))
            .collect()
    }

    pub async fn run(&mut self) -> Result<()> {
        for (phase, state) in self.phases.iter_mut() {
            if state.is_terminal() {
                continue;
            }
            let name = phase.name().to_string();

            if !phase.should_run() {
                info!(phase = %name, "skipping phase");
                *state = PhaseState::Skipped;
                continue;
            }

            info!(phase = %name, "running phase");
            *state = PhaseState::Running;
            if let Err(e) = phase.run().await {
                *state = PhaseState::Failed;
                error!(phase = %name, error = %e, "phase failed");
                return Err(e.context(format!("phase '{}' failed", name)));
            }
            // the phase only counts as done once its hook succeeded
            if let Some(hook) = self.after_run.as_mut() {
                if let Err(e) = hook(&name) {
                    *state = PhaseState::Failed;
                    error!(phase = %name, error = %e, "after-run hook failed");
                    return Err(e.context(format!("after-run hook for phase '{}'", name)));
                }
            }
            *state = PhaseState::Done;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recorded {
        name: &'static str,
        should_run: bool,
        fail: bool,
        ran: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Phase for Recorded {
        fn name(&self) -> &str {
            self.name
        }

        fn should_run(&self) -> bool {
            self.should_run
        }

        async fn run(&self) -> Result<()> {
            self.ran.lock().unwrap().push(self.name.to_string());
            if self.fail {
                anyhow::bail!("{} broke", self.name);
            }
            Ok(())
        }
    }

    fn chain(
        defs: &[(&'static str, bool, bool)],
    ) -> (PhaseChain, Arc<Mutex<Vec<String>>>, Arc<Mutex<Vec<String>>>) {
        let ran = Arc::new(Mutex::new(Vec::new()));
        let hooked = Arc::new(Mutex::new(Vec::new()));
        let phases = defs
            .iter()
            .map(|&(name, should_run, fail)| {
                Box::new(Recorded {
                    name,
                    should_run,
                    fail,
                    ran: ran.clone(),
                }) as Box<dyn Phase>
            })
            .collect();
        let sink = hooked.clone();
        let chain = PhaseChain::new(phases).after_run(move |name| {
            sink.lock().unwrap().push(name.to_string());
            Ok(())
        });
        (chain, ran, hooked)
    }

    #[tokio::test]
    async fn test_skipped_phase_gets_no_run_and_no_hook() {
        let (mut chain, ran, hooked) =
            chain(&[("one", true, false), ("two", false, false), ("three", true, false)]);

        chain.run().await.unwrap();

        assert_eq!(*ran.lock().unwrap(), ["one", "three"]);
        assert_eq!(*hooked.lock().unwrap(), ["one", "three"]);
        let states: Vec<_> = chain.states().into_iter().map(|(_, s)| s).collect();
        assert_eq!(
            states,
            [PhaseState::Done, PhaseState::Skipped, PhaseState::Done]
        );
    }

    #[tokio::test]
    async fn test_failure_stops_the_chain() {
        let (mut chain, ran, hooked) =
            chain(&[("one", true, true), ("two", true, false), ("three", true, false)]);

        let err = chain.run().await.unwrap_err();

        assert_eq!(err.to_string(), "phase 'one' failed");
        assert_eq!(*ran.lock().unwrap(), ["one"]);
        assert!(hooked.lock().unwrap().is_empty());
        let states: Vec<_> = chain.states().into_iter().map(|(_, s)| s).collect();
        assert_eq!(
            states,
            [PhaseState::Failed, PhaseState::Pending, PhaseState::Pending]
        );
    }

    #[tokio::test]
    async fn test_hook_failure_fails_the_chain() {
        let ran = Arc::new(Mutex::new(Vec::new()));
        let phases: Vec<Box<dyn Phase>> = ["one", "two"]
            .into_iter()
            .map(|name| {
                Box::new(Recorded {
                    name,
                    should_run: true,
                    fail: false,
                    ran: ran.clone(),
                }) as Box<dyn Phase>
            })
            .collect();
        let failures = Arc::new(Mutex::new(1));
        let remaining = failures.clone();
        let mut chain = PhaseChain::new(phases).after_run(move |_| {
            let mut remaining = remaining.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                anyhow::bail!("disk full");
            }
            Ok(())
        });

        let err = chain.run().await.unwrap_err();

        assert_eq!(err.to_string(), "after-run hook for phase 'one'");
        assert_eq!(*ran.lock().unwrap(), ["one"]);
        let states: Vec<_> = chain.states().into_iter().map(|(_, s)| s).collect();
        assert_eq!(states, [PhaseState::Failed, PhaseState::Pending]);

        chain.run().await.unwrap();
        assert_eq!(*ran.lock().unwrap(), ["one", "one", "two"]);
        assert_eq!(*failures.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rerun_resumes_after_finished_phases() {
        let (mut chain, ran, _) = chain(&[("one", true, false), ("two", true, false)]);

        chain.run().await.unwrap();
        chain.run().await.unwrap();

        assert_eq!(*ran.lock().unwrap(), ["one", "two"]);
    }

    #[tokio::test]
    async fn test_rerun_retries_the_failed_phase() {
        let (mut chain, ran, _) = chain(&[("one", true, false), ("two", true, true)]);

        assert!(chain.run().await.is_err());
        assert!(chain.run().await.is_err());

        assert_eq!(*ran.lock().unwrap(), ["one", "two", "two"]);
    }

    #[test]
    fn test_phase_state_display() {
        assert_eq!(PhaseState::Running.to_string(), "Running");
        assert!(!PhaseState::Pending.is_terminal());
        assert!(PhaseState::Skipped.is_terminal());
        assert!(PhaseState::Done.is_terminal());
        assert!(!PhaseState::Failed.is_terminal());
    }
}
