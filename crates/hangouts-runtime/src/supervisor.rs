//! Task supervisor: owns every long-running task and the shared shutdown token.
//!
//! All tasks receive clones of one `CancellationToken`. The supervisor is the
//! only place that cancels it, and `run` returns only after every task has
//! finished. Tasks are never aborted.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;

use futures::future::{FusedFuture, FutureExt};
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use hangouts_core::config::FailurePolicy;
use hangouts_core::error::Result;

/// How a supervised task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Returned `Ok` on its own, before any shutdown.
    Completed,
    /// Returned after shutdown was requested.
    Cancelled,
    Failed(String),
    Panicked(String),
}

impl TaskOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Panicked(_))
    }
}

/// Outcomes in the order the tasks finished.
#[derive(Debug, Default)]
pub struct SupervisorReport {
    pub outcomes: Vec<(String, TaskOutcome)>,
}

impl SupervisorReport {
    pub fn any_failed(&self) -> bool {
        self.outcomes.iter().any(|(_, outcome)| outcome.is_failure())
    }

    pub fn outcome(&self, task: &str) -> Option<&TaskOutcome> {
        self.outcomes
            .iter()
            .find(|(name, _)| name == task)
            .map(|(_, outcome)| outcome)
    }
}

pub struct Supervisor {
    cancel: CancellationToken,
    tasks: JoinSet<Result<()>>,
    names: HashMap<Id, String>,
    policy: FailurePolicy,
}

impl Supervisor {
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
            names: HashMap::new(),
            policy,
        }
    }

    /// Start a named task. `f` receives the shared shutdown token.
    pub fn spawn<F, Fut>(&mut self, name: &str, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handle = self.tasks.spawn(f(self.cancel.clone()));
        self.names.insert(handle.id(), name.to_string());
        tracing::debug!(task = name, "Task started");
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request shutdown. Only the first call has an effect.
    pub fn shutdown(&self, reason: &str) {
        if self.cancel.is_cancelled() {
            return;
        }
        tracing::info!("🛑 Shutting down: {reason}");
        self.cancel.cancel();
    }

    /// Wait until every task has finished. `signal` resolving requests shutdown.
    pub async fn run(mut self, signal: impl Future<Output = ()>) -> SupervisorReport {
        let mut report = SupervisorReport::default();
        let signal = signal.fuse();
        futures::pin_mut!(signal);

        loop {
            tokio::select! {
                () = &mut signal, if !signal.is_terminated() => self.shutdown("signal received"),
                joined = self.tasks.join_next_with_id() => {
                    let Some(joined) = joined else { break };
                    let (name, outcome) = self.classify(joined);
                    self.log_outcome(&name, &outcome);
                    if outcome.is_failure() && self.policy == FailurePolicy::ShutdownAll {
                        self.shutdown(&format!("task '{name}' failed"));
                    }
                    report.outcomes.push((name, outcome));
                }
            }
        }

        tracing::info!("👋 All {} tasks stopped", report.outcomes.len());
        report
    }

    fn classify(
        &mut self,
        joined: std::result::Result<(Id, Result<()>), JoinError>,
    ) -> (String, TaskOutcome) {
        match joined {
            Ok((id, result)) => {
                let outcome = match result {
                    Ok(()) if self.cancel.is_cancelled() => TaskOutcome::Cancelled,
                    Ok(()) => TaskOutcome::Completed,
                    Err(e) => TaskOutcome::Failed(e.to_string()),
                };
                (self.take_name(id), outcome)
            }
            Err(e) => {
                let name = self.take_name(e.id());
                if e.is_panic() {
                    (name, TaskOutcome::Panicked(panic_message(e.into_panic())))
                } else {
                    (name, TaskOutcome::Cancelled)
                }
            }
        }
    }

    fn take_name(&mut self, id: Id) -> String {
        self.names.remove(&id).unwrap_or_else(|| format!("task-{id}"))
    }

    fn log_outcome(&self, name: &str, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Completed => tracing::info!(task = name, "✅ Task completed"),
            TaskOutcome::Cancelled => tracing::debug!(task = name, "Task stopped after shutdown"),
            TaskOutcome::Failed(reason) => tracing::error!(task = name, "❌ Task failed: {reason}"),
            TaskOutcome::Panicked(reason) => {
                tracing::error!(task = name, "💥 Task panicked: {reason}")
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
