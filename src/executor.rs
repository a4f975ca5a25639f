//! Running commands on, and copying files to and from, the hosts of a topology.
//!
//! Everything that touches a remote machine goes through the [`Executor`] trait. The real
//! implementation is [`crate::ssh::SshExecutor`]; [`DryRunExecutor`] only logs what would happen.
//!
//! Both operations are safe to call again after a failure, but the remote side effect of a command
//! (e.g. starting a container) may not be idempotent. Deciding whether to retry is left to the
//! caller; an executor never retries on its own beyond re-establishing a dropped connection once.

use std::path::Path;
use std::time::Duration;

use crate::error::ExecError;
use crate::topology::HostSpec;

/// Which way a file travels in [`Executor::transfer`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Local `source` to remote `dest`.
    Push,
    /// Remote `source` to local `dest`.
    Fetch,
}

/// The result of a command that exited successfully.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

pub trait Executor: Sync {
    /// Run `command` on `host`, giving up after `timeout`.
    ///
    /// A non-zero exit is reported as [`ExecError::Command`]. On [`ExecError::Timeout`], the
    /// remote command has been sent a best-effort kill.
    fn execute(
        &self,
        host: &HostSpec,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecError>;

    /// Copy a file between this machine and `host`. Returns the number of bytes transferred.
    fn transfer(
        &self,
        host: &HostSpec,
        direction: Direction,
        source: &Path,
        dest: &Path,
        timeout: Duration,
    ) -> Result<u64, ExecError>;
}

impl<E: Executor + ?Sized> Executor for &E {
    fn execute(
        &self,
        host: &HostSpec,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecError> {
        (**self).execute(host, command, timeout)
    }

    fn transfer(
        &self,
        host: &HostSpec,
        direction: Direction,
        source: &Path,
        dest: &Path,
        timeout: Duration,
    ) -> Result<u64, ExecError> {
        (**self).transfer(host, direction, source, dest, timeout)
    }
}

/// Logs every operation instead of performing it. Fetches create an empty local file so that the
/// rest of the run behaves as it would for real.
#[derive(Debug, Default)]
pub struct DryRunExecutor;

impl Executor for DryRunExecutor {
    fn execute(
        &self,
        host: &HostSpec,
        command: &str,
        _timeout: Duration,
    ) -> Result<CommandOutput, ExecError> {
        log::info!("[dry run] {} ({}): {}", host.role, host.address, command);
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
        log::info!(
            "[dry run] {:?} {} ({}): {} -> {}",
            direction,
            host.role,
            host.address,
            source.display(),
            dest.display()
        );

        match direction {
            Direction::Push => Ok(std::fs::metadata(source).map(|m| m.len()).unwrap_or(0)),
            Direction::Fetch => {
                std::fs::write(dest, b"").map_err(|e| ExecError::Command {
                    host: host.role.clone(),
                    command: format!("create {}", dest.display()),
                    exit: 1,
                    stderr: e.to_string(),
                })?;
                Ok(0)
            }
        }
    }
}

/// Quote `s` as a single shell word.
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Like [`quote`], but leaves a leading `~/` outside the quotes so the remote shell expands it.
pub fn quote_path(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => format!("~/{}", quote(rest)),
        None if path == "~" => "~".into(),
        None => quote(path),
    }
}

/// Build the shell command line for `command`: change into `workdir` and export `env` first.
/// Values are quoted, so they may contain spaces and quotes.
pub fn compose_command<'a, I>(workdir: Option<&str>, env: I, command: &str) -> String
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut line = String::new();
    if let Some(workdir) = workdir {
        line.push_str(&format!("cd {} && ", quote_path(workdir)));
    }
    for (key, value) in env {
        line.push_str(&format!("export {}={}; ", key, quote(value)));
    }
    line.push_str(command);
    line
}
