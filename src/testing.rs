//! Fixtures shared by the unit tests: topology builders and a scripted [`MockExecutor`].

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::{ReadinessPolicy, RetryPolicy, RunConfig};
use crate::error::ExecError;
use crate::executor::{CommandOutput, Direction, Executor};
use crate::topology::{HostSpec, ServiceSpec, Topology};

pub fn host(role: &str) -> HostSpec {
    HostSpec {
        role: role.into(),
        address: format!("{}.test", role),
        port: None,
        username: None,
        key: None,
    }
}

/// A service whose commands are `start-<role>`, `stop-<role>` and `health-<role>`, producing one
/// artifact at `/tmp/<role>.log`.
pub fn service(role: &str, deps: &[&str]) -> ServiceSpec {
    ServiceSpec {
        role: role.into(),
        binary: format!("{}-bin", role),
        start: format!("start-{}", role),
        stop: Some(format!("stop-{}", role)),
        health: Some(format!("health-{}", role)),
        config: None,
        uploads: vec![],
        artifacts: vec![format!("/tmp/{}.log", role)],
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        workdir: None,
        env: Default::default(),
    }
}

/// A topology with one host per role.
pub fn topology(roles: &[(&str, &[&str])]) -> Topology {
    Topology::new(
        "test",
        roles.iter().map(|(role, _)| host(role)).collect(),
        roles.iter().map(|(role, deps)| service(role, deps)).collect(),
    )
    .unwrap()
}

/// A config with short budgets, writing to `output_dir`.
pub fn config(output_dir: &Path) -> RunConfig {
    let mut cfg = RunConfig::with_output_dir(output_dir.to_owned());
    cfg.timeout = Duration::from_secs(1);
    cfg.warmup = Duration::from_millis(0);
    cfg.command_timeout = Duration::from_secs(1);
    cfg.transfer_timeout = Duration::from_secs(1);
    cfg.stop_timeout = Duration::from_secs(1);
    cfg.retry = RetryPolicy {
        max_attempts: 2,
        backoff_ms: 1,
        max_backoff_ms: 1,
    };
    cfg.readiness = ReadinessPolicy {
        attempts: 3,
        interval_ms: 10,
    };
    cfg
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Start,
    Health,
    Stop,
    Push,
    Fetch,
    Other,
}

#[derive(Clone, Debug)]
pub struct Call {
    pub role: String,
    pub action: Action,
    pub at: Instant,
}

/// Records every call and fails the ones it was told to fail.
#[derive(Default)]
pub struct MockExecutor {
    calls: Mutex<Vec<Call>>,
    failing: HashSet<(String, Action)>,
    delays: HashMap<(String, Action), Duration>,
    /// Remaining calls that fail with a connection error.
    flaky: Mutex<HashMap<(String, Action), usize>>,
    /// Number of health checks that fail before one succeeds.
    warming: HashMap<String, usize>,
    health_seen: Mutex<HashMap<String, usize>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(mut self, role: &str, action: Action) -> Self {
        self.failing.insert((role.into(), action));
        self
    }

    pub fn delay(mut self, role: &str, action: Action, d: Duration) -> Self {
        self.delays.insert((role.into(), action), d);
        self
    }

    /// Fail the first `n` calls of `action` on `role` as if the host were unreachable.
    pub fn flaky(self, role: &str, action: Action, n: usize) -> Self {
        self.flaky.lock().unwrap().insert((role.into(), action), n);
        self
    }

    pub fn ready_after(mut self, role: &str, failed_checks: usize) -> Self {
        self.warming.insert(role.into(), failed_checks);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, role: &str, action: Action) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.role == role && c.action == action)
            .count()
    }

    pub fn first(&self, role: &str, action: Action) -> Option<Instant> {
        self.calls()
            .iter()
            .find(|c| c.role == role && c.action == action)
            .map(|c| c.at)
    }

    pub fn last(&self, role: &str, action: Action) -> Option<Instant> {
        self.calls()
            .iter()
            .rev()
            .find(|c| c.role == role && c.action == action)
            .map(|c| c.at)
    }

    fn record(&self, role: &str, action: Action) -> Result<(), ExecError> {
        self.calls.lock().unwrap().push(Call {
            role: role.into(),
            action,
            at: Instant::now(),
        });

        if let Some(d) = self.delays.get(&(role.to_owned(), action)) {
            std::thread::sleep(*d);
        }

        if let Some(n) = self.flaky.lock().unwrap().get_mut(&(role.to_owned(), action)) {
            if *n > 0 {
                *n -= 1;
                return Err(ExecError::Connection {
                    host: role.into(),
                    cause: "connection reset".into(),
                });
            }
        }

        if self.failing.contains(&(role.to_owned(), action)) {
            return Err(ExecError::Command {
                host: role.into(),
                command: format!("{:?}", action),
                exit: 1,
                stderr: String::new(),
            });
        }

        if action == Action::Health {
            if let Some(&needed) = self.warming.get(role) {
                let mut seen = self.health_seen.lock().unwrap();
                let n = seen.entry(role.into()).or_insert(0);
                *n += 1;
                if *n <= needed {
                    return Err(ExecError::Command {
                        host: role.into(),
                        command: "health".into(),
                        exit: 1,
                        stderr: String::new(),
                    });
                }
            }
        }

        Ok(())
    }
}

impl Executor for MockExecutor {
    fn execute(
        &self,
        host: &HostSpec,
        command: &str,
        _timeout: Duration,
    ) -> Result<CommandOutput, ExecError> {
        let role = host.role.as_str();
        let action = if command.ends_with(&format!("start-{}", role)) {
            Action::Start
        } else if command.ends_with(&format!("health-{}", role)) {
            Action::Health
        } else if command.ends_with(&format!("stop-{}", role)) {
            Action::Stop
        } else {
            Action::Other
        };

        self.record(role, action)?;
        Ok(CommandOutput::default())
    }

    fn transfer(
        &self,
        host: &HostSpec,
        direction: Direction,
        source: &Path,
        dest: &Path,
        _timeout: Duration,
    ) -> Result<u64, ExecError> {
        let action = match direction {
            Direction::Push => Action::Push,
            Direction::Fetch => Action::Fetch,
        };
        self.record(&host.role, action)?;

        match direction {
            Direction::Push => Ok(0),
            Direction::Fetch => {
                let contents = format!("{} from {}\n", source.display(), host.role);
                std::fs::write(dest, &contents).unwrap();
                Ok(contents.len() as u64)
            }
        }
    }
}
