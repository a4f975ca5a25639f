//! Error types shared by the launcher's components.

use std::fmt;
use std::time::Duration;

use failure::Fail;

/// Everything the remote executor can report back to its caller.
#[derive(Debug, Clone, Fail)]
pub enum ExecError {
    /// The host could not be reached, or authentication failed.
    Connection { host: String, cause: String },

    /// The remote command ran to completion with a non-zero exit code. `stderr` holds the tail
    /// of what it wrote to standard error.
    Command {
        host: String,
        command: String,
        exit: i32,
        stderr: String,
    },

    /// The operation did not finish within its time budget. The remote side has been sent a
    /// best-effort kill.
    Timeout { host: String, after: Duration },
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::Connection { host, cause } => {
                write!(f, "unable to reach `{}`: {}", host, cause)
            }
            ExecError::Command {
                host,
                command,
                exit,
                stderr,
            } => {
                write!(f, "`{}` on `{}` exited with {}", command, host, exit)?;
                if !stderr.is_empty() {
                    write!(f, ": {}", stderr)?;
                }
                Ok(())
            }
            ExecError::Timeout { host, after } => {
                write!(f, "operation on `{}` timed out after {:?}", host, after)
            }
        }
    }
}

impl ExecError {
    /// Connection failures are the only errors that retrying can reasonably be expected to fix.
    pub fn is_connection(&self) -> bool {
        matches!(self, ExecError::Connection { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecError::Timeout { .. })
    }
}

/// A benchmark descriptor that does not describe a runnable topology.
#[derive(Debug, Clone, PartialEq, Eq, Fail)]
pub enum TopologyError {
    #[fail(display = "invalid role name `{}`", role)]
    InvalidRole { role: String },

    #[fail(display = "role `{}` is declared by more than one service", role)]
    DuplicateService { role: String },

    #[fail(display = "role `{}` is declared by more than one host", role)]
    DuplicateHost { role: String },

    #[fail(display = "service `{}` has no host entry", role)]
    MissingHost { role: String },

    #[fail(display = "host `{}` does not belong to any service", role)]
    UnusedHost { role: String },

    #[fail(display = "service `{}` depends on unknown role `{}`", role, dependency)]
    UnknownDependency { role: String, dependency: String },

    #[fail(display = "dependency cycle between roles: {}", roles)]
    Cycle { roles: String },
}

/// A descriptor that could not be read or parsed.
#[derive(Debug, Fail)]
pub enum ConfigError {
    #[fail(display = "unable to read `{}`: {}", path, error)]
    Io {
        path: String,
        error: std::io::Error,
    },

    #[fail(display = "malformed descriptor `{}`: {}", path, error)]
    Parse { path: String, error: toml::de::Error },

    #[fail(display = "{}", error)]
    Topology { error: TopologyError },

    #[fail(display = "invalid value for `{}`: {}", field, reason)]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn io(path: &std::path::Path, error: std::io::Error) -> Self {
        ConfigError::Io {
            path: path.display().to_string(),
            error,
        }
    }

    pub(crate) fn parse(path: &std::path::Path, error: toml::de::Error) -> Self {
        ConfigError::Parse {
            path: path.display().to_string(),
            error,
        }
    }
}

impl From<TopologyError> for ConfigError {
    fn from(error: TopologyError) -> Self {
        ConfigError::Topology { error }
    }
}

/// Why a single role could not be brought up.
#[derive(Debug, Clone, Fail)]
pub enum DeployCause {
    #[fail(display = "{}", error)]
    Exec { error: ExecError },

    #[fail(display = "not ready after {} readiness checks", attempts)]
    NotReady { attempts: usize },

    #[fail(display = "dependency `{}` did not become ready", dependency)]
    DependencyFailed { dependency: String },

    #[fail(display = "cancelled after a sibling role failed")]
    Cancelled,

    #[fail(display = "provisioning deadline exceeded")]
    DeadlineExceeded,
}

impl From<ExecError> for DeployCause {
    fn from(error: ExecError) -> Self {
        DeployCause::Exec { error }
    }
}

/// `DeploymentFailed(role, cause)`.
#[derive(Debug, Clone, Fail)]
#[fail(display = "deployment of `{}` failed: {}", role, cause)]
pub struct DeployError {
    pub role: String,
    pub cause: DeployCause,
}

/// Why one artifact could not be collected. Never fatal for the run.
#[derive(Debug, Fail)]
pub enum CollectionError {
    #[fail(display = "fetching `{}` from `{}`: {}", remote, role, error)]
    Transfer {
        role: String,
        remote: String,
        error: ExecError,
    },

    #[fail(display = "writing `{}`: {}", path, error)]
    Local { path: String, error: std::io::Error },
}

impl CollectionError {
    pub(crate) fn local(path: &std::path::Path, error: std::io::Error) -> Self {
        CollectionError::Local {
            path: path.display().to_string(),
            error,
        }
    }
}
