//! Command line options of the `launcher` binary.

use std::path::PathBuf;
use std::time::Duration;

use clap::{clap_app, ArgMatches};

use crate::config::Overrides;

/// Validators for use with `clap_app!`'s `{...}` syntax.
pub mod validator {
    /// Accepts positive integers.
    pub fn positive(s: String) -> Result<(), String> {
        match s.parse::<u64>() {
            Ok(n) if n > 0 => Ok(()),
            _ => Err(format!("expected a positive integer, got `{}`", s)),
        }
    }
}

/// Everything the command line asks for.
#[derive(Clone, Debug)]
pub struct Args {
    pub benchmark: PathBuf,
    /// Without a config descriptor, every setting takes its default value.
    pub configfile: Option<PathBuf>,
    pub overrides: Overrides,
    pub dry_run: bool,
}

pub fn cli_options() -> clap::App<'static, 'static> {
    clap_app! { launcher =>
        (about: "Provisions a distributed benchmark on remote hosts, runs it for a fixed \
                 window, collects its result artifacts, and tears it down again.")
        (@setting ArgRequiredElseHelp)
        (@setting DisableVersion)
        (@arg BENCHMARK: +required +takes_value --benchmark
         "The benchmark descriptor (TOML) listing hosts and services \
          (e.g. --benchmark rpc_bench.toml)")
        (@arg CONFIGFILE: +takes_value --configfile
         "(Optional) The runtime configuration descriptor (TOML). If omitted, all \
          settings take their default values and -o is required.")
        (@arg OUTPUT_DIR: +takes_value -o --("output-dir")
         "(Optional) The local directory artifacts and the report are written to. \
          Overrides `output_dir` in the configuration.")
        (@arg TIMEOUT: +takes_value {validator::positive} --timeout
         "(Optional) The length of the measurement window in seconds. Overrides \
          `timeout_secs` in the configuration.")
        (@arg CONCURRENCY: +takes_value {validator::positive} --concurrency
         "(Optional) The maximum number of roles operated on at once. Overrides \
          `concurrency` in the configuration.")
        (@arg DRY_RUN: --("dry-run")
         "(Optional) Log every remote command and transfer instead of performing it.")
    }
}

pub fn parse(matches: &ArgMatches<'_>) -> Args {
    // Presence and format are enforced by clap.
    let number = |name: &str| {
        matches
            .value_of(name)
            .and_then(|value| value.parse::<u64>().ok())
    };

    Args {
        benchmark: matches.value_of("BENCHMARK").map(PathBuf::from).unwrap_or_default(),
        configfile: matches.value_of("CONFIGFILE").map(PathBuf::from),
        overrides: Overrides {
            output_dir: matches.value_of("OUTPUT_DIR").map(PathBuf::from),
            timeout: number("TIMEOUT").map(Duration::from_secs),
            concurrency: number("CONCURRENCY").map(|n| n as usize),
        },
        dry_run: matches.is_present("DRY_RUN"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_args(argv: &[&str]) -> Result<Args, clap::Error> {
        let mut full = vec!["launcher"];
        full.extend_from_slice(argv);
        cli_options()
            .get_matches_from_safe(full)
            .map(|m| parse(&m))
    }

    #[test]
    fn all_options() {
        let args = parse_args(&[
            "--benchmark",
            "bench.toml",
            "--configfile",
            "run.toml",
            "-o",
            "/tmp/out",
            "--timeout",
            "90",
            "--concurrency",
            "4",
            "--dry-run",
        ])
        .unwrap();

        assert_eq!(args.benchmark, PathBuf::from("bench.toml"));
        assert_eq!(args.configfile, Some(PathBuf::from("run.toml")));
        assert_eq!(args.overrides.output_dir, Some(PathBuf::from("/tmp/out")));
        assert_eq!(args.overrides.timeout, Some(Duration::from_secs(90)));
        assert_eq!(args.overrides.concurrency, Some(4));
        assert!(args.dry_run);
    }

    #[test]
    fn only_the_benchmark_is_required() {
        let args = parse_args(&["--benchmark", "bench.toml"]).unwrap();
        assert_eq!(args.configfile, None);
        assert_eq!(args.overrides.timeout, None);
        assert!(!args.dry_run);

        assert!(parse_args(&["-o", "/tmp/out"]).is_err());
    }

    #[test]
    fn rejects_zero_and_garbage() {
        assert!(parse_args(&["--benchmark", "b.toml", "--timeout", "0"]).is_err());
        assert!(parse_args(&["--benchmark", "b.toml", "--concurrency", "many"]).is_err());
    }
}
