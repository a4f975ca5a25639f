//! Bringing the services of a topology up and back down.
//!
//! Every role gets its own thread. A role starts only after all of its dependencies have passed
//! their readiness check; independent roles proceed in parallel, at most `concurrency` at a time.
//! The first failure cancels every sibling that has not finished yet, and the roles that were
//! already started are stopped again before [`DeploymentManager::provision`] returns.
//!
//! Teardown runs in reverse dependency order: a role is stopped once every started role that
//! depends on it has had its stop attempt, whether or not that attempt succeeded.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::RunConfig;
use crate::error::{DeployCause, DeployError, ExecError};
use crate::executor::{compose_command, Direction, Executor};
use crate::lock;
use crate::sched::{Gate, Permits, Settle, Signal, Wait};
use crate::topology::{HostSpec, ServiceSpec, Topology};

/// Every started role gets a stop attempt of at least this long, even when the teardown budget is
/// already used up.
const MIN_STOP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Started and passed its readiness check.
    Ready,
    /// Its stop command succeeded.
    Stopped,
    Failed,
    /// Interrupted by a sibling's failure.
    Cancelled,
    /// Never started.
    Skipped,
}

/// What happened to one role during provisioning or teardown.
#[derive(Clone, Debug, Serialize)]
pub struct RoleOutcome {
    pub role: String,
    pub status: Status,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    /// When the start (or stop) command was issued.
    #[serde(skip)]
    pub started_at: Option<Instant>,
    /// When the role passed its readiness check (or finished stopping).
    #[serde(skip)]
    pub finished_at: Option<Instant>,
}

impl RoleOutcome {
    fn new(role: &str, begin: Instant) -> Self {
        RoleOutcome {
            role: role.to_owned(),
            status: Status::Skipped,
            error: None,
            elapsed_ms: 0,
            started_at: None,
            finished_at: None,
        }
        .timed(begin)
    }

    fn timed(mut self, begin: Instant) -> Self {
        self.elapsed_ms = begin.elapsed().as_millis() as u64;
        self
    }

    fn panicked(role: &str) -> Self {
        RoleOutcome {
            role: role.to_owned(),
            status: Status::Failed,
            error: Some("task panicked".into()),
            elapsed_ms: 0,
            started_at: None,
            finished_at: None,
        }
    }
}

/// A fully provisioned topology.
#[derive(Clone, Debug)]
pub struct Deployment {
    /// Per-role outcomes, in start order.
    pub outcomes: Vec<RoleOutcome>,
    /// Roles that were issued a start command.
    pub started: Vec<String>,
}

/// `provision` failed. The started roles have already been stopped.
#[derive(Debug)]
pub struct ProvisionFailure {
    /// The first fatal failure.
    pub error: DeployError,
    pub outcomes: Vec<RoleOutcome>,
    /// Outcomes of stopping the roles that had been started.
    pub rollback: Vec<RoleOutcome>,
}

pub struct DeploymentManager<'a, E> {
    exec: &'a E,
    cfg: &'a RunConfig,
}

impl<'a, E: Executor> DeploymentManager<'a, E> {
    pub fn new(exec: &'a E, cfg: &'a RunConfig) -> Self {
        DeploymentManager { exec, cfg }
    }

    /// Bring every role of `topology` to "ready", giving up at `deadline`.
    pub fn provision(
        &self,
        topology: &Topology,
        deadline: Instant,
    ) -> Result<Deployment, ProvisionFailure> {
        let gate = Gate::new();
        let permits = Permits::new(self.cfg.concurrency);
        let started = Mutex::new(Vec::new());
        let first_failure = Mutex::new(None);

        log::info!("provisioning {} roles", topology.services().len());

        let outcomes: Vec<RoleOutcome> = std::thread::scope(|s| {
            let handles: Vec<_> = topology
                .start_order()
                .map(|svc| {
                    let (gate, permits, started, first_failure) =
                        (&gate, &permits, &started, &first_failure);
                    let handle = s.spawn(move || {
                        self.provision_role(
                            topology,
                            svc,
                            deadline,
                            gate,
                            permits,
                            started,
                            first_failure,
                        )
                    });
                    (svc.role.as_str(), handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(role, h)| h.join().unwrap_or_else(|_| RoleOutcome::panicked(role)))
                .collect()
        });

        let mut started: Vec<(String, Instant)> =
            started.into_inner().unwrap_or_else(|p| p.into_inner());
        started.sort_by_key(|(_, at)| *at);
        let started: Vec<String> = started.into_iter().map(|(role, _)| role).collect();

        let failure = first_failure
            .into_inner()
            .unwrap_or_else(|p| p.into_inner())
            .or_else(|| {
                // Only reachable if a task panicked.
                outcomes
                    .iter()
                    .find(|o| o.status != Status::Ready)
                    .map(|o| DeployError {
                        role: o.role.clone(),
                        cause: DeployCause::Exec {
                            error: ExecError::Command {
                                host: o.role.clone(),
                                command: o.error.clone().unwrap_or_default(),
                                exit: -1,
                                stderr: String::new(),
                            },
                        },
                    })
            });

        match failure {
            None => {
                log::info!("all roles ready");
                Ok(Deployment { outcomes, started })
            }
            Some(error) => {
                log::warn!("{}; stopping {} started roles", error, started.len());
                let rollback = self.teardown(topology, &started);
                Err(ProvisionFailure {
                    error,
                    outcomes,
                    rollback,
                })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn provision_role(
        &self,
        topology: &Topology,
        svc: &ServiceSpec,
        deadline: Instant,
        gate: &Gate,
        permits: &Permits,
        started: &Mutex<Vec<(String, Instant)>>,
        first_failure: &Mutex<Option<DeployError>>,
    ) -> RoleOutcome {
        let begin = Instant::now();
        let role = svc.role.as_str();
        let mut settle = Settle::new(gate, role, Signal::Failed);
        let mut outcome = RoleOutcome::new(role, begin);

        let cause = match gate.wait_for(&svc.depends_on) {
            Wait::Proceed => None,
            Wait::Blocked(dependency) => Some(DeployCause::DependencyFailed { dependency }),
            Wait::Cancelled => Some(DeployCause::Cancelled),
        };
        if let Some(cause) = cause {
            log::debug!("skipping `{}`: {}", role, cause);
            outcome.error = Some(cause.to_string());
            return outcome.timed(begin);
        }

        let _permit = permits.acquire();
        if gate.is_cancelled() {
            outcome.error = Some(DeployCause::Cancelled.to_string());
            return outcome.timed(begin);
        }

        // Topology validation guarantees every service has a host.
        let host = match topology.host(role) {
            Some(host) => host,
            None => unreachable!("service `{}` without host", role),
        };

        match self.bring_up(svc, host, deadline, gate, started, &mut outcome) {
            Ok(()) => {
                log::info!("`{}` is ready", role);
                outcome.status = Status::Ready;
                outcome.finished_at = Some(Instant::now());
                settle.set(Signal::Done);
            }
            Err(DeployCause::Cancelled) => {
                outcome.status = Status::Cancelled;
                outcome.error = Some(DeployCause::Cancelled.to_string());
            }
            Err(cause) => {
                log::warn!("`{}` failed: {}", role, cause);
                outcome.status = Status::Failed;
                outcome.error = Some(cause.to_string());
                lock(first_failure).get_or_insert(DeployError {
                    role: role.to_owned(),
                    cause,
                });
                gate.cancel();
            }
        }

        outcome.timed(begin)
    }

    /// Push files, start, and wait for readiness.
    fn bring_up(
        &self,
        svc: &ServiceSpec,
        host: &HostSpec,
        deadline: Instant,
        gate: &Gate,
        started: &Mutex<Vec<(String, Instant)>>,
        outcome: &mut RoleOutcome,
    ) -> Result<(), DeployCause> {
        let env = self.cfg.env_for(svc);
        let workdir = self.cfg.workdir_for(svc);

        for file in svc.pushes() {
            let timeout = budget(self.cfg.transfer_timeout, deadline)?;
            log::debug!("`{}`: pushing {}", svc.role, file.local.display());
            self.retry(
                gate,
                |_| {
                    self.exec.transfer(
                        host,
                        Direction::Push,
                        &file.local,
                        Path::new(&file.remote),
                        timeout,
                    )
                },
                |e| e.is_connection() || e.is_timeout(),
            )?;
        }

        if gate.is_cancelled() {
            return Err(DeployCause::Cancelled);
        }

        let start = compose_command(workdir, &env, &svc.start);
        let timeout = budget(self.cfg.command_timeout, deadline)?;
        let now = Instant::now();
        lock(started).push((svc.role.clone(), now));
        outcome.started_at = Some(now);
        log::info!("starting `{}` on {}", svc.role, host.address);
        self.retry(
            gate,
            |_| self.exec.execute(host, &start, timeout),
            ExecError::is_connection,
        )?;

        let health = compose_command(workdir, &env, &svc.health_command());
        let attempts = self.cfg.readiness.attempts;
        for attempt in 0..attempts {
            if gate.is_cancelled() {
                return Err(DeployCause::Cancelled);
            }
            let timeout = budget(self.cfg.command_timeout, deadline)?;
            match self.exec.execute(host, &health, timeout) {
                Ok(_) => return Ok(()),
                Err(e) => log::debug!(
                    "`{}` not ready ({}/{}): {}",
                    svc.role,
                    attempt + 1,
                    attempts,
                    e
                ),
            }
            if attempt + 1 < attempts {
                let pause = budget(self.cfg.readiness_interval(), deadline)?;
                if !gate.sleep(pause) {
                    return Err(DeployCause::Cancelled);
                }
            }
        }

        Err(DeployCause::NotReady { attempts })
    }

    /// Retry `op` under the configured policy. A cancellation ends the backoff early.
    fn retry<T, F, R>(&self, gate: &Gate, op: F, retry_if: R) -> Result<T, DeployCause>
    where
        F: FnMut(usize) -> Result<T, ExecError>,
        R: Fn(&ExecError) -> bool,
    {
        let mut interrupted = false;
        let res = self.cfg.retry.run_until(op, retry_if, |delay| {
            interrupted = !gate.sleep(delay);
            !interrupted
        });
        res.map_err(|error| {
            if interrupted {
                DeployCause::Cancelled
            } else {
                DeployCause::from(error)
            }
        })
    }

    /// Stop every role in `started`, dependents before their dependencies. Individual failures are
    /// recorded and do not keep the other roles from being stopped.
    pub fn teardown(&self, topology: &Topology, started: &[String]) -> Vec<RoleOutcome> {
        let started: HashSet<&str> = started.iter().map(String::as_str).collect();
        let gate = Gate::new();
        let permits = Permits::new(self.cfg.concurrency);
        let deadline = crate::deadline_in(self.cfg.teardown_timeout);

        log::info!("stopping {} roles", started.len());

        let order: Vec<&ServiceSpec> = topology
            .start_order()
            .filter(|svc| started.contains(svc.role.as_str()))
            .collect();

        std::thread::scope(|s| {
            let handles: Vec<_> = order
                .iter()
                .rev()
                .map(|svc| {
                    let waits: Vec<&str> = topology
                        .dependents(&svc.role)
                        .into_iter()
                        .filter(|d| started.contains(d))
                        .collect();
                    let (gate, permits) = (&gate, &permits);
                    let handle = s.spawn(move || {
                        let _settle = Settle::new(gate, &svc.role, Signal::Done);
                        // Nobody cancels or fails this gate.
                        let _ = gate.wait_for(&waits);
                        let _permit = permits.acquire();
                        self.stop_role(topology, svc, deadline)
                    });
                    (svc.role.as_str(), handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(role, h)| h.join().unwrap_or_else(|_| RoleOutcome::panicked(role)))
                .collect()
        })
    }

    fn stop_role(&self, topology: &Topology, svc: &ServiceSpec, deadline: Instant) -> RoleOutcome {
        let begin = Instant::now();
        let mut outcome = RoleOutcome::new(&svc.role, begin);

        let host = match topology.host(&svc.role) {
            Some(host) => host,
            None => unreachable!("service `{}` without host", svc.role),
        };

        let timeout = deadline
            .checked_duration_since(begin)
            .unwrap_or_default()
            .min(self.cfg.stop_timeout)
            .max(MIN_STOP_TIMEOUT);
        let stop = compose_command(
            self.cfg.workdir_for(svc),
            &self.cfg.env_for(svc),
            &svc.stop_command(),
        );

        log::info!("stopping `{}` on {}", svc.role, host.address);
        outcome.started_at = Some(begin);
        match self.exec.execute(host, &stop, timeout) {
            Ok(_) => outcome.status = Status::Stopped,
            Err(e) => {
                log::warn!("unable to stop `{}`: {}", svc.role, e);
                outcome.status = Status::Failed;
                outcome.error = Some(e.to_string());
            }
        }
        outcome.finished_at = Some(Instant::now());

        outcome.timed(begin)
    }
}

/// `base`, shortened to what is left until `deadline`.
fn budget(base: Duration, deadline: Instant) -> Result<Duration, DeployCause> {
    match deadline.checked_duration_since(Instant::now()) {
        Some(left) if left > Duration::from_millis(0) => Ok(base.min(left)),
        _ => Err(DeployCause::DeadlineExceeded),
    }
}
