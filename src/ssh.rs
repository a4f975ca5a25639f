//! The real [`Executor`]: commands over SSH via `spurs`, files via `rsync`.
//!
//! Every command is wrapped in coreutils `timeout` on the remote, so the remote process is killed
//! when its budget runs out even if we lose the connection. The wrapped `bash` gets a unique tag
//! as its `$0`, which lets us `pkill -f` it from a fresh connection if the original connection
//! hangs. The wrapper then reports the exit status on stderr after a marker, so stderr reaches
//! the caller even for failing commands.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use spurs::{cmd, Execute, SshError};

use crate::config::SshDefaults;
use crate::error::ExecError;
use crate::executor::{quote, quote_path, CommandOutput, Direction, Executor};
use crate::pool::{ConnectionPool, Target};
use crate::topology::HostSpec;

/// How long the remote `timeout` waits after SIGTERM before sending SIGKILL.
const KILL_GRACE_SECS: u64 = 5;

/// How much longer than the command's own budget we wait locally before declaring the connection
/// hung.
const LOCAL_SLACK: Duration = Duration::from_secs(KILL_GRACE_SECS + 5);

/// Budget of the best-effort kill issued after a local timeout.
const KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Exit status of coreutils `timeout` when the command timed out.
const TIMEOUT_EXIT: i32 = 124;

/// How often a running `rsync` is checked for completion.
const RSYNC_POLL: Duration = Duration::from_millis(20);

/// Exit codes with which `rsync` reports a transport rather than a file problem.
const RSYNC_TRANSPORT_EXITS: &[i32] = &[5, 10, 12, 30, 35, 255];

/// Precedes the exit status the remote wrapper prints on stderr.
const EXIT_MARKER: &str = "launcher-exit:";

/// How much of a failing command's stderr is kept in [`ExecError::Command`].
const STDERR_TAIL_LINES: usize = 5;
const STDERR_TAIL_CHARS: usize = 1000;

pub struct SshExecutor {
    pool: ConnectionPool,
    defaults: SshDefaults,
    next_tag: AtomicUsize,
    slack: Duration,
    kill_timeout: Duration,
}

impl SshExecutor {
    pub fn new(defaults: SshDefaults) -> Self {
        SshExecutor::with_pool(defaults, ConnectionPool::default())
    }

    pub fn with_pool(defaults: SshDefaults, pool: ConnectionPool) -> Self {
        SshExecutor {
            pool,
            defaults,
            next_tag: AtomicUsize::new(0),
            slack: LOCAL_SLACK,
            kill_timeout: KILL_TIMEOUT,
        }
    }

    fn target(&self, host: &HostSpec) -> Target {
        Target {
            username: self.defaults.username_for(host),
            address: host.address.clone(),
            port: self.defaults.port_for(host),
            key: self.defaults.key_for(host),
        }
    }

    fn tag(&self) -> String {
        format!(
            "launcher-op-{}-{}",
            std::process::id(),
            self.next_tag.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Run an already-wrapped command on a pooled connection, waiting at most `wait`. The wait
    /// covers connecting as well as running, since neither has a timeout of its own.
    ///
    /// Returns `None` if the wait expired.
    fn run_on_pool(
        &self,
        target: &Target,
        line: &str,
        wait: Duration,
        fresh: bool,
    ) -> Option<Result<spurs::SshOutput, SshError>> {
        let (tx, rx) = mpsc::channel();
        let pool = self.pool.clone();
        let target = target.clone();
        let cmd = cmd!("{}", line).no_pty().allow_error();
        std::thread::spawn(move || {
            let conn = if fresh {
                pool.acquire_fresh(&target)
            } else {
                pool.acquire(&target)
            };
            let res = conn.and_then(|mut conn| {
                let res = conn.run(cmd);
                // With `allow_error`, any error is the connection's.
                if res.is_err() {
                    conn.mark_broken();
                }
                res
            });
            let _ = tx.send(res);
        });

        rx.recv_timeout(wait).ok()
    }

    fn kill_tagged(&self, target: &Target, tag: &str) {
        // The bracket keeps the pattern from matching the shell that runs `pkill` itself.
        let (first, rest) = tag.split_at(1);
        let line = format!("pkill -f -- '[{}]{}$' || true", first, rest);
        match self.run_on_pool(target, &line, self.kill_timeout, true) {
            Some(Ok(_)) => log::debug!("killed {} on {}", tag, target.remote()),
            Some(Err(e)) => log::warn!("unable to kill {} on {}: {}", tag, target.remote(), e),
            None => log::warn!("kill of {} on {} timed out", tag, target.remote()),
        }
    }

    fn rsync(
        &self,
        host: &HostSpec,
        target: &Target,
        source: String,
        dest: String,
        timeout: Duration,
    ) -> Result<(), ExecError> {
        let mut ssh = format!(
            "ssh -p {} -o BatchMode=yes -o StrictHostKeyChecking=accept-new -o ConnectTimeout=10",
            target.port
        );
        if let Some(key) = &target.key {
            ssh.push_str(&format!(" -i {}", key.display()));
        }

        let mut rsync = Command::new("rsync");
        rsync
            .arg("-az")
            .arg("-e")
            .arg(&ssh)
            .arg(&source)
            .arg(&dest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        log::debug!("{:?}", rsync);

        let mut child = rsync.spawn().map_err(|e| ExecError::Command {
            host: host.role.clone(),
            command: "rsync".into(),
            exit: 127,
            stderr: e.to_string(),
        })?;

        let deadline = crate::deadline_in(timeout);
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ExecError::Timeout {
                        host: host.role.clone(),
                        after: timeout,
                    });
                }
                Ok(None) => std::thread::sleep(RSYNC_POLL),
                Err(e) => {
                    return Err(ExecError::Connection {
                        host: host.role.clone(),
                        cause: format!("waiting for rsync: {}", e),
                    })
                }
            }
        };

        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        let stderr = stderr_tail(&stderr);

        match status.code() {
            Some(0) => Ok(()),
            Some(code) if RSYNC_TRANSPORT_EXITS.contains(&code) => Err(ExecError::Connection {
                host: host.role.clone(),
                cause: if stderr.is_empty() {
                    format!("rsync exited with {}", code)
                } else {
                    format!("rsync exited with {}: {}", code, stderr)
                },
            }),
            code => Err(ExecError::Command {
                host: host.role.clone(),
                command: format!("rsync {} {}", source, dest),
                exit: code.unwrap_or(-1),
                stderr,
            }),
        }
    }
}

impl Executor for SshExecutor {
    fn execute(
        &self,
        host: &HostSpec,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ExecError> {
        let target = self.target(host);
        let tag = self.tag();
        let line = remote_line(command, timeout, &tag);
        let wait = timeout.saturating_add(self.slack);

        log::debug!("{} ({}): {}", host.role, target.remote(), command);

        let mut reconnected = false;
        loop {
            let res = match self.run_on_pool(&target, &line, wait, reconnected) {
                Some(res) => res,
                None => {
                    self.kill_tagged(&target, &tag);
                    return Err(ExecError::Timeout {
                        host: host.role.clone(),
                        after: timeout,
                    });
                }
            };

            return match res {
                Ok(out) => match split_exit(&out.stderr) {
                    Some((0, stderr)) => Ok(CommandOutput {
                        stdout: out.stdout,
                        stderr: stderr.to_owned(),
                        exit_code: 0,
                    }),
                    Some((TIMEOUT_EXIT, _)) => Err(ExecError::Timeout {
                        host: host.role.clone(),
                        after: timeout,
                    }),
                    Some((exit, stderr)) => Err(ExecError::Command {
                        host: host.role.clone(),
                        command: command.to_owned(),
                        exit,
                        stderr: stderr_tail(stderr),
                    }),
                    None => Err(ExecError::Connection {
                        host: host.role.clone(),
                        cause: "the remote shell did not report an exit status".into(),
                    }),
                },
                Err(e) if !reconnected => {
                    log::warn!("connection to {} failed ({}); reconnecting", target.remote(), e);
                    reconnected = true;
                    continue;
                }
                Err(e) => Err(ExecError::Connection {
                    host: host.role.clone(),
                    cause: e.to_string(),
                }),
            };
        }
    }

    fn transfer(
        &self,
        host: &HostSpec,
        direction: Direction,
        source: &Path,
        dest: &Path,
        timeout: Duration,
    ) -> Result<u64, ExecError> {
        let target = self.target(host);
        let remote = |path: &Path| {
            format!(
                "{}@{}:{}",
                target.username,
                target.address,
                path.display()
            )
        };

        match direction {
            Direction::Push => {
                let bytes = std::fs::metadata(source)
                    .map_err(|e| ExecError::Command {
                        host: host.role.clone(),
                        command: format!("stat {}", source.display()),
                        exit: 1,
                        stderr: e.to_string(),
                    })?
                    .len();
                let mut timeout = timeout;
                if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
                    let started = Instant::now();
                    let parent = parent.display().to_string();
                    self.execute(host, &mkdir_command(&parent), timeout)?;
                    timeout = timeout.checked_sub(started.elapsed()).unwrap_or_default();
                }
                self.rsync(host, &target, source.display().to_string(), remote(dest), timeout)?;
                Ok(bytes)
            }
            Direction::Fetch => {
                self.rsync(host, &target, remote(source), dest.display().to_string(), timeout)?;
                std::fs::metadata(dest)
                    .map(|m| m.len())
                    .map_err(|e| ExecError::Command {
                        host: host.role.clone(),
                        command: format!("stat {}", dest.display()),
                        exit: 1,
                        stderr: e.to_string(),
                    })
            }
        }
    }
}

/// Wrap `command` so that the remote kills it after `timeout`, tagging the process with `tag`.
fn bounded_command(command: &str, timeout: Duration, tag: &str) -> String {
    // `timeout` has one-second granularity here; round up so short budgets are not zero.
    let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    format!(
        "timeout --kill-after={} {} bash -c {} {}",
        KILL_GRACE_SECS,
        secs.max(1),
        quote(command),
        tag
    )
}

/// The line sent to the remote login shell: [`bounded_command`] followed by the exit status,
/// printed on stderr after [`EXIT_MARKER`].
fn remote_line(command: &str, timeout: Duration, tag: &str) -> String {
    format!(
        "{}; printf '\\n{}%d\\n' \"$?\" >&2",
        bounded_command(command, timeout, tag),
        EXIT_MARKER
    )
}

/// Split the exit status reported by [`remote_line`] off the end of `stderr`.
fn split_exit(stderr: &str) -> Option<(i32, &str)> {
    let at = stderr.rfind(EXIT_MARKER)?;
    let exit = stderr[at + EXIT_MARKER.len()..].trim().parse().ok()?;
    let rest = &stderr[..at];
    Some((exit, rest.strip_suffix('\n').unwrap_or(rest)))
}

/// The last few lines of `stderr`, enough to explain a failure.
fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .collect();
    let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");

    let chars = tail.chars().count();
    if chars > STDERR_TAIL_CHARS {
        tail.chars().skip(chars - STDERR_TAIL_CHARS).collect()
    } else {
        tail
    }
}

fn mkdir_command(dir: &str) -> String {
    format!("mkdir -p -- {}", quote_path(dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::host;

    #[test]
    fn bounded_command_rounds_up_and_tags() {
        let line = bounded_command("true", Duration::from_millis(1500), "launcher-op-1-0");
        assert_eq!(line, "timeout --kill-after=5 2 bash -c 'true' launcher-op-1-0");

        let line = bounded_command("true", Duration::from_millis(0), "t");
        assert!(line.starts_with("timeout --kill-after=5 1 bash"));
    }

    /// Run `line` the way the remote login shell would, returning stdout and the reported exit.
    fn run_locally(line: &str) -> (String, i32, String) {
        let out = Command::new("bash").arg("-c").arg(line).output().unwrap();
        let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
        let (exit, stderr) = split_exit(&stderr).expect("no exit status reported");
        (stdout, exit, stderr.to_owned())
    }

    #[test]
    fn wrapped_commands_keep_their_words() {
        let mut env = std::collections::BTreeMap::new();
        env.insert("CFG".to_string(), "/tmp/server's config.toml".to_string());
        let command = crate::executor::compose_command(
            Some("/tmp"),
            &env,
            r#"echo hello   world; printf '%s|' "$CFG" "$(pwd)""#,
        );

        let (stdout, exit, _) = run_locally(&remote_line(&command, Duration::from_secs(5), "t"));
        assert_eq!(exit, 0);
        assert_eq!(stdout, "hello world\n/tmp/server's config.toml|/tmp|");
    }

    #[test]
    fn failing_commands_report_exit_and_stderr() {
        let line = remote_line(
            "echo starting; echo 'bind: address in use' >&2; exit 3",
            Duration::from_secs(5),
            "t",
        );
        let (stdout, exit, stderr) = run_locally(&line);
        assert_eq!(stdout, "starting\n");
        assert_eq!(exit, 3);
        assert_eq!(stderr, "bind: address in use\n");
        assert_eq!(stderr_tail(&stderr), "bind: address in use");
    }

    #[test]
    fn overrunning_commands_exit_with_timeout_status() {
        let line = remote_line("sleep 10", Duration::from_secs(1), "t");
        let started = Instant::now();
        let (_, exit, _) = run_locally(&line);
        assert_eq!(exit, TIMEOUT_EXIT);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    fn default_commands(binary: &str) -> (String, String) {
        let mut svc = crate::testing::service("a", &[]);
        svc.binary = binary.into();
        svc.stop = None;
        svc.health = None;
        (svc.health_command(), svc.stop_command())
    }

    #[test]
    fn default_health_and_stop_do_not_match_themselves() {
        let (health, stop) = default_commands(&format!("launcher-missing-{}", std::process::id()));
        for command in &[health, stop] {
            let (_, exit, _) = run_locally(&remote_line(command, Duration::from_secs(5), "t"));
            assert_eq!(exit, 1, "{}", command);
        }
    }

    #[test]
    fn default_health_and_stop_find_the_running_binary() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir
            .path()
            .join(format!("launcher-sleeper-{}", std::process::id()));
        std::fs::copy("/bin/sleep", &binary).unwrap();
        let mut child = Command::new(&binary).arg("30").spawn().unwrap();

        let (health, stop) = default_commands(&binary.display().to_string());
        let (_, exit, _) = run_locally(&remote_line(&health, Duration::from_secs(5), "t"));
        assert_eq!(exit, 0);
        let (_, exit, _) = run_locally(&remote_line(&stop, Duration::from_secs(5), "t"));
        assert_eq!(exit, 0);

        assert!(!child.wait().unwrap().success());
        let (_, exit, _) = run_locally(&remote_line(&health, Duration::from_secs(5), "t"));
        assert_eq!(exit, 1);
    }

    #[test]
    fn split_exit_takes_the_last_marker() {
        assert_eq!(split_exit("oops\n\nlauncher-exit:2\n"), Some((2, "oops\n")));
        assert_eq!(
            split_exit("launcher-exit:1 printed by the service\n\nlauncher-exit:0\n"),
            Some((0, "launcher-exit:1 printed by the service\n"))
        );
        assert_eq!(split_exit("no marker here"), None);
    }

    #[test]
    fn stderr_tail_keeps_the_last_lines() {
        let stderr: String = (0..20).map(|i| format!("line {}\n", i)).collect();
        assert_eq!(
            stderr_tail(&stderr),
            "line 15\nline 16\nline 17\nline 18\nline 19"
        );

        let long = "x".repeat(5000);
        assert_eq!(stderr_tail(&long).len(), STDERR_TAIL_CHARS);
        assert_eq!(stderr_tail(""), "");
    }

    #[test]
    fn mkdir_expands_home_and_keeps_spaces() {
        let home = tempfile::tempdir().unwrap();
        let line = remote_line(&mkdir_command("~/bench dir/conf"), Duration::from_secs(5), "t");
        let out = Command::new("bash")
            .arg("-c")
            .arg(&line)
            .env("HOME", home.path())
            .output()
            .unwrap();
        assert!(out.status.success());
        assert!(home.path().join("bench dir").join("conf").is_dir());
    }

    #[test]
    fn unreachable_hosts_are_bounded_by_the_timeout() {
        let mut exec = SshExecutor::new(SshDefaults::default());
        exec.slack = Duration::from_millis(200);
        exec.kill_timeout = Duration::from_millis(200);

        // A non-routable address: connecting either fails at once or hangs.
        let mut h = host("a");
        h.address = "10.255.255.1".into();

        let started = Instant::now();
        let res = exec.execute(&h, "true", Duration::from_secs(1));
        let elapsed = started.elapsed();

        match res {
            Err(e) => assert!(e.is_timeout() || e.is_connection(), "{}", e),
            Ok(_) => panic!("reached a non-routable address"),
        }
        assert!(elapsed < Duration::from_secs(5), "took {:?}", elapsed);
    }

    #[test]
    fn target_resolves_host_then_defaults() {
        let exec = SshExecutor::new(SshDefaults {
            username: Some("bench".into()),
            key: Some("/keys/id_rsa".into()),
            port: Some(2022),
        });

        let mut h = host("a");
        let t = exec.target(&h);
        assert_eq!(t.username, "bench");
        assert_eq!(t.port, 2022);
        assert_eq!(t.remote(), format!("{}:2022", h.address));

        h.port = Some(22);
        h.username = Some("root".into());
        let t = exec.target(&h);
        assert_eq!(t.username, "root");
        assert_eq!(t.port, 22);
        assert_eq!(t.key.as_deref(), Some(Path::new("/keys/id_rsa")));
    }

    #[test]
    fn tags_are_unique() {
        let exec = SshExecutor::new(SshDefaults::default());
        assert_ne!(exec.tag(), exec.tag());
    }
}
