//! The run state machine.
//!
//! ```text
//! Idle -> Provisioning -> Warming -> Running -> Collecting -> CleaningUp -> Succeeded
//!   \__________\______________\__________\____________\____________\______> Failed
//! ```
//!
//! States only move forward. `Failed` can be entered from any non-terminal state. Whatever
//! happens, every role that was started is stopped before the controller reaches a terminal
//! state.
//!
//! The measurement window normally ends when `timeout` elapses. That is the expected way for a
//! run to end, not an error. A [`CompletionHandle`] lets an external workload driver end the
//! window early, or abort the run.

use std::sync::mpsc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::collector::{ArtifactRecord, Collector};
use crate::config::RunConfig;
use crate::deploy::{DeploymentManager, RoleOutcome};
use crate::error::DeployError;
use crate::executor::Executor;
use crate::topology::Topology;

/// Why a run failed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    /// `DeploymentFailed(role, cause)`.
    DeploymentFailed { role: String, cause: String },
    /// The workload driver aborted the run.
    Aborted { reason: String },
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::DeploymentFailed { role, cause } => {
                write!(f, "deployment of `{}` failed: {}", role, cause)
            }
            FailureCause::Aborted { reason } => write!(f, "run aborted: {}", reason),
        }
    }
}

impl From<&DeployError> for FailureCause {
    fn from(error: &DeployError) -> Self {
        FailureCause::DeploymentFailed {
            role: error.role.clone(),
            cause: error.cause.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Provisioning,
    Warming,
    Running,
    Collecting,
    CleaningUp,
    Succeeded,
    Failed(FailureCause),
}

impl RunState {
    fn rank(&self) -> usize {
        match self {
            RunState::Idle => 0,
            RunState::Provisioning => 1,
            RunState::Warming => 2,
            RunState::Running => 3,
            RunState::Collecting => 4,
            RunState::CleaningUp => 5,
            RunState::Succeeded | RunState::Failed(_) => 6,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed(_))
    }

    /// The state's name, without the failure cause.
    pub fn name(&self) -> &'static str {
        match self {
            RunState::Idle => "Idle",
            RunState::Provisioning => "Provisioning",
            RunState::Warming => "Warming",
            RunState::Running => "Running",
            RunState::Collecting => "Collecting",
            RunState::CleaningUp => "CleaningUp",
            RunState::Succeeded => "Succeeded",
            RunState::Failed(_) => "Failed",
        }
    }
}

/// A state change, with its offset from the creation of the controller.
#[derive(Clone, Debug, Serialize)]
pub struct Transition {
    pub state: RunState,
    pub offset_ms: u64,
    #[serde(skip)]
    pub at: Instant,
}

/// How the measurement window ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowEnd {
    /// `timeout` elapsed.
    Timeout,
    /// The overall run budget ran out before `timeout` did.
    Deadline,
    /// The workload driver signalled completion.
    Completed,
    /// The workload driver aborted the run.
    Aborted,
}

enum RunSignal {
    Completed,
    Abort(String),
}

/// Lets an external workload driver end the measurement window.
///
/// Signals sent before the window opens take effect as soon as it does.
#[derive(Clone)]
pub struct CompletionHandle(mpsc::Sender<RunSignal>);

impl CompletionHandle {
    /// The workload finished; stop measuring.
    pub fn complete(&self) {
        let _ = self.0.send(RunSignal::Completed);
    }

    /// Something went wrong with the workload (e.g. a role crashed). The run ends as failed, but
    /// artifacts are still collected.
    pub fn abort(&self, reason: &str) {
        let _ = self.0.send(RunSignal::Abort(reason.to_owned()));
    }
}

/// Everything the controller did, for the final report.
#[derive(Debug)]
pub struct RunOutcome {
    pub state: RunState,
    pub transitions: Vec<Transition>,
    pub provisioning: Vec<RoleOutcome>,
    pub teardown: Vec<RoleOutcome>,
    pub artifacts: Vec<ArtifactRecord>,
    pub window: Option<WindowEnd>,
    pub phases: Vec<(&'static str, Duration)>,
    pub elapsed: Duration,
}

/// Stops the started roles when dropped, so that even a panic between provisioning and cleanup
/// tears the deployment down.
struct TeardownGuard<'g, 'a, E: Executor> {
    deploy: &'g DeploymentManager<'a, E>,
    topology: &'g Topology,
    started: Vec<String>,
    armed: bool,
}

impl<'g, 'a, E: Executor> TeardownGuard<'g, 'a, E> {
    fn finish(mut self) -> Vec<RoleOutcome> {
        self.armed = false;
        self.deploy.teardown(self.topology, &self.started)
    }
}

impl<E: Executor> Drop for TeardownGuard<'_, '_, E> {
    fn drop(&mut self) {
        if self.armed {
            log::warn!("unwinding; stopping {} roles", self.started.len());
            self.deploy.teardown(self.topology, &self.started);
        }
    }
}

pub struct RunController<'a, E: Executor> {
    exec: &'a E,
    cfg: &'a RunConfig,
    state: RunState,
    created: Instant,
    transitions: Vec<Transition>,
    tx: mpsc::Sender<RunSignal>,
    rx: mpsc::Receiver<RunSignal>,
}

impl<'a, E: Executor> RunController<'a, E> {
    pub fn new(exec: &'a E, cfg: &'a RunConfig) -> Self {
        let created = Instant::now();
        let (tx, rx) = mpsc::channel();
        RunController {
            exec,
            cfg,
            state: RunState::Idle,
            created,
            transitions: vec![Transition {
                state: RunState::Idle,
                offset_ms: 0,
                at: created,
            }],
            tx,
            rx,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn completion_handle(&self) -> CompletionHandle {
        CompletionHandle(self.tx.clone())
    }

    /// Drive `topology` through a full run. Provisioning, warm-up and measurement together end at
    /// `deadline` at the latest.
    pub fn run(mut self, topology: &Topology, deadline: Instant) -> RunOutcome {
        let mut timers = vec![];
        let deploy = DeploymentManager::new(self.exec, self.cfg);
        let collector = Collector::new(self.exec, self.cfg);

        self.advance(RunState::Provisioning);
        let provision_deadline = deadline.min(crate::deadline_in(self.cfg.provision_timeout));
        let provisioned = time!(
            timers,
            "Provisioning",
            deploy.provision(topology, provision_deadline)
        );

        let deployment = match provisioned {
            Ok(deployment) => deployment,
            Err(failure) => {
                // `provision` already stopped whatever it started.
                self.advance(RunState::Failed(FailureCause::from(&failure.error)));
                return self.finish(
                    failure.outcomes,
                    failure.rollback,
                    vec![],
                    None,
                    timers,
                );
            }
        };

        let guard = TeardownGuard {
            deploy: &deploy,
            topology,
            started: deployment.started.clone(),
            armed: true,
        };

        self.advance(RunState::Warming);
        time!(timers, "Warming", {
            let left = deadline.saturating_duration_since(Instant::now());
            std::thread::sleep(self.cfg.warmup.min(left));
        });

        self.advance(RunState::Running);
        let (window, fatal) = time!(timers, "Running", self.measure(deadline));
        log::info!("measurement window ended: {:?}", window);

        self.advance(RunState::Collecting);
        let artifacts = time!(
            timers,
            "Collecting",
            collector.collect(topology, &self.cfg.output_dir)
        );

        self.advance(RunState::CleaningUp);
        let teardown = time!(timers, "CleaningUp", guard.finish());

        match fatal {
            None => self.advance(RunState::Succeeded),
            Some(cause) => self.advance(RunState::Failed(cause)),
        }

        self.finish(
            deployment.outcomes,
            teardown,
            artifacts,
            Some(window),
            timers,
        )
    }

    /// Block until the window closes: `timeout` after now, the deadline, or a driver signal,
    /// whichever comes first.
    fn measure(&self, deadline: Instant) -> (WindowEnd, Option<FailureCause>) {
        let nominal = crate::deadline_in(self.cfg.timeout);
        let end = nominal.min(deadline);

        loop {
            let now = Instant::now();
            if now >= end {
                let how = if end < nominal {
                    WindowEnd::Deadline
                } else {
                    WindowEnd::Timeout
                };
                return (how, None);
            }

            match self.rx.recv_timeout(end - now) {
                Ok(RunSignal::Completed) => return (WindowEnd::Completed, None),
                Ok(RunSignal::Abort(reason)) => {
                    log::warn!("run aborted by driver: {}", reason);
                    return (WindowEnd::Aborted, Some(FailureCause::Aborted { reason }));
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                // We hold a sender ourselves.
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    unreachable!("controller dropped its own sender")
                }
            }
        }
    }

    fn advance(&mut self, next: RunState) {
        let allowed = !self.state.is_terminal()
            && (matches!(next, RunState::Failed(_)) || next.rank() > self.state.rank());
        assert!(
            allowed,
            "invalid transition {:?} -> {:?}",
            self.state, next
        );

        let at = Instant::now();
        log::info!("{} -> {}", self.state.name(), next.name());
        self.transitions.push(Transition {
            state: next.clone(),
            offset_ms: (at - self.created).as_millis() as u64,
            at,
        });
        self.state = next;
    }

    fn finish(
        self,
        provisioning: Vec<RoleOutcome>,
        teardown: Vec<RoleOutcome>,
        artifacts: Vec<ArtifactRecord>,
        window: Option<WindowEnd>,
        phases: Vec<(&'static str, Duration)>,
    ) -> RunOutcome {
        RunOutcome {
            state: self.state,
            transitions: self.transitions,
            provisioning,
            teardown,
            artifacts,
            window,
            phases,
            elapsed: self.created.elapsed(),
        }
    }
}
