//! The runtime configuration of a launch.
//!
//! The config descriptor is TOML. Every field has a default except `output_dir`, which can also
//! be given on the command line with `-o`. Unknown fields are rejected at load time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::topology::{HostSpec, ServiceSpec, DEFAULT_SSH_PORT};

/// The longest time budget a config may ask for (ten years).
pub const MAX_BUDGET: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

/// How often and how patiently to retry an operation that failed for a transient reason.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: usize,
    /// Delay before the second attempt. Doubles after each further failure.
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            backoff_ms: 500,
            max_backoff_ms: 5000,
        }
    }
}

impl RetryPolicy {
    /// The delay before attempt number `attempt + 1` (0-based `attempt`), with up to 25% jitter
    /// so that many roles failing together do not retry in lockstep.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exp = self
            .backoff_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.max_backoff_ms);
        let jitter = if exp >= 4 {
            rand::thread_rng().gen_range(0..=exp / 4)
        } else {
            0
        };
        Duration::from_millis(exp - jitter)
    }

    /// Run `op` until it succeeds, fails with an error for which `retry_if` is false, or the
    /// attempts are exhausted. The last error is returned.
    pub fn run<T, E, F, R>(&self, op: F, retry_if: R) -> Result<T, E>
    where
        F: FnMut(usize) -> Result<T, E>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        self.run_until(op, retry_if, |delay| {
            std::thread::sleep(delay);
            true
        })
    }

    /// Like [`RetryPolicy::run`], but waits out each backoff with `sleep`. If `sleep` returns
    /// false, no further attempt is made and the last error is returned.
    pub fn run_until<T, E, F, R, S>(&self, mut op: F, retry_if: R, mut sleep: S) -> Result<T, E>
    where
        F: FnMut(usize) -> Result<T, E>,
        R: Fn(&E) -> bool,
        S: FnMut(Duration) -> bool,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(v) => return Ok(v),
                Err(e) if attempt + 1 < attempts && retry_if(&e) => {
                    let delay = self.backoff(attempt);
                    log::warn!(
                        "attempt {}/{} failed: {}; retrying in {:?}",
                        attempt + 1,
                        attempts,
                        e,
                        delay
                    );
                    if !sleep(delay) {
                        return Err(e);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Bounds on the readiness probe of each role.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ReadinessPolicy {
    pub attempts: usize,
    pub interval_ms: u64,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        ReadinessPolicy {
            attempts: 20,
            interval_ms: 500,
        }
    }
}

/// Defaults for hosts that do not specify their own SSH parameters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SshDefaults {
    pub username: Option<String>,
    pub key: Option<PathBuf>,
    pub port: Option<u16>,
}

impl SshDefaults {
    /// The username to log into `host` with.
    pub fn username_for(&self, host: &HostSpec) -> String {
        host.username
            .clone()
            .or_else(|| self.username.clone())
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".into())
    }

    pub fn key_for(&self, host: &HostSpec) -> Option<PathBuf> {
        host.key.clone().or_else(|| self.key.clone())
    }

    pub fn port_for(&self, host: &HostSpec) -> u16 {
        host.port.or(self.port).unwrap_or(DEFAULT_SSH_PORT)
    }
}

/// The config descriptor as written on disk.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigDescriptor {
    #[serde(default)]
    output_dir: Option<PathBuf>,
    #[serde(default = "defaults::timeout_secs")]
    timeout_secs: u64,
    #[serde(default)]
    warmup_secs: u64,
    #[serde(default)]
    max_duration_secs: Option<u64>,
    #[serde(default = "defaults::provision_timeout_secs")]
    provision_timeout_secs: u64,
    #[serde(default = "defaults::command_timeout_secs")]
    command_timeout_secs: u64,
    #[serde(default = "defaults::transfer_timeout_secs")]
    transfer_timeout_secs: u64,
    #[serde(default = "defaults::stop_timeout_secs")]
    stop_timeout_secs: u64,
    #[serde(default = "defaults::collect_timeout_secs")]
    collect_timeout_secs: u64,
    #[serde(default = "defaults::teardown_timeout_secs")]
    teardown_timeout_secs: u64,
    #[serde(default = "defaults::concurrency")]
    concurrency: usize,
    #[serde(default)]
    retry: RetryPolicy,
    #[serde(default)]
    readiness: ReadinessPolicy,
    #[serde(default)]
    ssh: SshDefaults,
    #[serde(default)]
    workdir: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    params: BTreeMap<String, toml::Value>,
}

mod defaults {
    pub fn timeout_secs() -> u64 {
        60
    }
    pub fn provision_timeout_secs() -> u64 {
        300
    }
    pub fn command_timeout_secs() -> u64 {
        30
    }
    pub fn transfer_timeout_secs() -> u64 {
        120
    }
    pub fn stop_timeout_secs() -> u64 {
        15
    }
    pub fn collect_timeout_secs() -> u64 {
        300
    }
    pub fn teardown_timeout_secs() -> u64 {
        120
    }
    pub fn concurrency() -> usize {
        8
    }
}

/// Values given on the command line, which take precedence over the descriptor.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub output_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub concurrency: Option<usize>,
}

/// Everything about a run that is not the topology itself. Immutable once built.
#[derive(Clone, Debug, Serialize)]
pub struct RunConfig {
    pub output_dir: PathBuf,
    /// Length of the measurement window.
    pub timeout: Duration,
    pub warmup: Duration,
    /// Upper bound on provisioning, warm-up and the measurement window combined.
    pub max_duration: Duration,
    /// Upper bound on provisioning alone.
    pub provision_timeout: Duration,
    /// Per-command timeout for start commands and readiness probes.
    pub command_timeout: Duration,
    /// Per-file timeout for pushes and artifact retrieval.
    pub transfer_timeout: Duration,
    /// Per-role timeout for stop commands.
    pub stop_timeout: Duration,
    /// Budget for collecting all artifacts.
    pub collect_timeout: Duration,
    /// Budget for stopping all roles.
    pub teardown_timeout: Duration,
    /// Maximum number of roles operated on at the same time.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub readiness: ReadinessPolicy,
    pub ssh: SshDefaults,
    pub workdir: Option<String>,
    pub env: BTreeMap<String, String>,
    pub params: BTreeMap<String, toml::Value>,
}

impl RunConfig {
    /// Read the config descriptor at `path` and apply `overrides` on top of it.
    pub fn load(path: &Path, overrides: &Overrides) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
        Self::from_toml(&contents, overrides).map_err(|e| match e {
            ConfigError::Parse { error, .. } => ConfigError::parse(path, error),
            other => other,
        })
    }

    pub fn from_toml(contents: &str, overrides: &Overrides) -> Result<Self, ConfigError> {
        let desc: ConfigDescriptor =
            toml::from_str(contents).map_err(|e| ConfigError::parse(Path::new("<config>"), e))?;

        let output_dir = overrides
            .output_dir
            .clone()
            .or(desc.output_dir)
            .ok_or_else(|| ConfigError::Invalid {
                field: "output_dir",
                reason: "no output directory; set `output_dir` or pass `-o`".into(),
            })?;

        let concurrency = overrides.concurrency.unwrap_or(desc.concurrency);
        if concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "concurrency",
                reason: "must be at least 1".into(),
            });
        }
        if desc.readiness.attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "readiness.attempts",
                reason: "must be at least 1".into(),
            });
        }

        let timeout = match overrides.timeout {
            Some(timeout) => within_budget("timeout", timeout)?,
            None => secs("timeout_secs", desc.timeout_secs)?,
        };
        let warmup = secs("warmup_secs", desc.warmup_secs)?;
        let provision_timeout = secs("provision_timeout_secs", desc.provision_timeout_secs)?;
        let max_duration = match desc.max_duration_secs {
            Some(n) => secs("max_duration_secs", n)?,
            None => provision_timeout + warmup + timeout,
        };

        for key in desc.env.keys() {
            if !is_env_name(key) {
                return Err(ConfigError::Invalid {
                    field: "env",
                    reason: format!("`{}` is not usable as an environment variable name", key),
                });
            }
        }
        let mut exported = BTreeMap::new();
        for key in desc.params.keys() {
            if !is_env_name(key) {
                return Err(ConfigError::Invalid {
                    field: "params",
                    reason: format!("`{}` is not usable as an environment variable name", key),
                });
            }
            if let Some(other) = exported.insert(param_var(key), key) {
                return Err(ConfigError::Invalid {
                    field: "params",
                    reason: format!("`{}` and `{}` both export {}", other, key, param_var(key)),
                });
            }
        }

        Ok(RunConfig {
            output_dir,
            timeout,
            warmup,
            max_duration,
            provision_timeout,
            command_timeout: secs("command_timeout_secs", desc.command_timeout_secs)?,
            transfer_timeout: secs("transfer_timeout_secs", desc.transfer_timeout_secs)?,
            stop_timeout: secs("stop_timeout_secs", desc.stop_timeout_secs)?,
            collect_timeout: secs("collect_timeout_secs", desc.collect_timeout_secs)?,
            teardown_timeout: secs("teardown_timeout_secs", desc.teardown_timeout_secs)?,
            concurrency,
            retry: desc.retry,
            readiness: desc.readiness,
            ssh: desc.ssh,
            workdir: desc.workdir,
            env: desc.env,
            params: desc.params,
        })
    }

    /// A config with defaults everywhere, writing to `output_dir`.
    pub fn with_output_dir(output_dir: PathBuf) -> Self {
        let overrides = Overrides {
            output_dir: Some(output_dir),
            ..Overrides::default()
        };
        // The empty descriptor is always valid.
        match Self::from_toml("", &overrides) {
            Ok(cfg) => cfg,
            Err(e) => unreachable!("default config rejected: {}", e),
        }
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness.interval_ms)
    }

    /// The environment `svc`'s commands run with: config `env`, then the service's own `env`,
    /// then the benchmark parameters as `LAUNCHER_PARAM_<KEY>`.
    pub fn env_for(&self, svc: &ServiceSpec) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        env.extend(svc.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        for (key, value) in self.params.iter() {
            let value = match value {
                toml::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            env.insert(param_var(key), value);
        }
        env
    }

    pub fn workdir_for<'a>(&'a self, svc: &'a ServiceSpec) -> Option<&'a str> {
        svc.workdir.as_deref().or(self.workdir.as_deref())
    }
}

fn within_budget(field: &'static str, d: Duration) -> Result<Duration, ConfigError> {
    if d > MAX_BUDGET {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("{:?} is longer than the maximum of {:?}", d, MAX_BUDGET),
        });
    }
    Ok(d)
}

fn secs(field: &'static str, secs: u64) -> Result<Duration, ConfigError> {
    within_budget(field, Duration::from_secs(secs))
}

/// The environment variable benchmark parameter `key` is exported as.
fn param_var(key: &str) -> String {
    format!("LAUNCHER_PARAM_{}", key.to_uppercase())
}

fn is_env_name(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::service;

    #[test]
    fn defaults_fill_empty_descriptor() {
        let cfg = RunConfig::with_output_dir("/tmp/out".into());
        assert_eq!(cfg.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(cfg.timeout, Duration::from_secs(60));
        assert_eq!(cfg.concurrency, 8);
        assert_eq!(cfg.retry, RetryPolicy::default());
        assert_eq!(
            cfg.max_duration,
            cfg.provision_timeout + cfg.warmup + cfg.timeout
        );
    }

    #[test]
    fn overrides_win() {
        let cfg = RunConfig::from_toml(
            r#"
output_dir = "/data/results"
timeout_secs = 600
concurrency = 4
"#,
            &Overrides {
                output_dir: Some("/tmp/mrpc-eval".into()),
                timeout: Some(Duration::from_secs(15)),
                concurrency: None,
            },
        )
        .unwrap();

        assert_eq!(cfg.output_dir, PathBuf::from("/tmp/mrpc-eval"));
        assert_eq!(cfg.timeout, Duration::from_secs(15));
        assert_eq!(cfg.concurrency, 4);
    }

    #[test]
    fn missing_output_dir_is_rejected() {
        let err = RunConfig::from_toml("timeout_secs = 5", &Overrides::default()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "output_dir",
                ..
            }
        ));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = RunConfig::from_toml(
            "output_dir = \"/tmp\"\n[retry]\nmax_attempt = 3\n",
            &Overrides::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn env_merges_config_service_and_params() {
        let cfg = RunConfig::from_toml(
            r#"
output_dir = "/tmp"
[env]
RUST_LOG = "warn"
RUST_BACKTRACE = "1"
[params]
msg_size = 32
transport = "tcp"
"#,
            &Overrides::default(),
        )
        .unwrap();

        let mut svc = service("a", &[]);
        svc.env.insert("RUST_LOG".into(), "info".into());

        let env = cfg.env_for(&svc);
        assert_eq!(env["RUST_LOG"], "info");
        assert_eq!(env["RUST_BACKTRACE"], "1");
        assert_eq!(env["LAUNCHER_PARAM_MSG_SIZE"], "32");
        assert_eq!(env["LAUNCHER_PARAM_TRANSPORT"], "tcp");
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_ms: 100,
            max_backoff_ms: 300,
        };
        let first = policy.backoff(0);
        assert!(first >= Duration::from_millis(75) && first <= Duration::from_millis(100));
        let capped = policy.backoff(10);
        assert!(capped >= Duration::from_millis(225) && capped <= Duration::from_millis(300));
    }

    #[test]
    fn retry_stops_on_non_retryable_errors() {
        let policy = RetryPolicy {
            max_attempts: 4,
            backoff_ms: 1,
            max_backoff_ms: 1,
        };

        let mut calls = 0;
        let res: Result<(), String> = policy.run(
            |_| {
                calls += 1;
                Err("fatal".to_string())
            },
            |e| e != "fatal",
        );
        assert!(res.is_err());
        assert_eq!(calls, 1);

        let mut calls = 0;
        let res: Result<usize, String> = policy.run(
            |attempt| {
                calls += 1;
                if attempt < 2 {
                    Err("flaky".to_string())
                } else {
                    Ok(attempt)
                }
            },
            |_| true,
        );
        assert_eq!(res, Ok(2));
        assert_eq!(calls, 3);
    }

    #[test]
    fn retry_gives_up_when_the_sleep_is_interrupted() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_ms: 60_000,
            max_backoff_ms: 60_000,
        };

        let mut calls = 0;
        let mut slept = vec![];
        let res: Result<(), String> = policy.run_until(
            |_| {
                calls += 1;
                Err("flaky".to_string())
            },
            |_| true,
            |delay| {
                slept.push(delay);
                false
            },
        );
        assert_eq!(res, Err("flaky".to_string()));
        assert_eq!(calls, 1);
        assert_eq!(slept.len(), 1);
    }

    fn invalid_field(contents: &str, overrides: &Overrides) -> &'static str {
        match RunConfig::from_toml(contents, overrides) {
            Err(ConfigError::Invalid { field, .. }) => field,
            other => panic!("expected an invalid field, got {:?}", other),
        }
    }

    #[test]
    fn budgets_beyond_the_maximum_are_rejected() {
        let out = Overrides {
            output_dir: Some("/tmp".into()),
            ..Overrides::default()
        };
        assert_eq!(
            invalid_field("timeout_secs = 9223372036854775807", &out),
            "timeout_secs"
        );
        assert_eq!(
            invalid_field("max_duration_secs = 9223372036854775807", &out),
            "max_duration_secs"
        );
        assert_eq!(
            invalid_field("teardown_timeout_secs = 9223372036854775807", &out),
            "teardown_timeout_secs"
        );

        let huge = Overrides {
            timeout: Some(Duration::from_secs(u64::MAX)),
            ..out.clone()
        };
        assert_eq!(invalid_field("", &huge), "timeout");

        let cfg = RunConfig::from_toml("timeout_secs = 86400", &out).unwrap();
        assert_eq!(cfg.timeout, Duration::from_secs(86400));
    }

    #[test]
    fn bad_env_names_are_reported_under_env() {
        let out = Overrides {
            output_dir: Some("/tmp".into()),
            ..Overrides::default()
        };
        assert_eq!(invalid_field("[env]\n\"BAD-NAME\" = \"1\"\n", &out), "env");
        assert_eq!(invalid_field("[params]\n\"msg-size\" = 1\n", &out), "params");
    }

    #[test]
    fn params_exporting_the_same_variable_are_rejected() {
        let out = Overrides {
            output_dir: Some("/tmp".into()),
            ..Overrides::default()
        };
        match RunConfig::from_toml("[params]\nrate = 1\nRATE = 2\n", &out) {
            Err(ConfigError::Invalid {
                field: "params",
                reason,
            }) => assert!(reason.contains("LAUNCHER_PARAM_RATE"), "{}", reason),
            other => panic!("expected a collision, got {:?}", other),
        }
    }
}
