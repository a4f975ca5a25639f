//! Fetching result artifacts from every host into one local directory.
//!
//! Each declared artifact becomes `<output_dir>/<role>.<ext>`, replacing whatever a previous run
//! left there. A failed transfer is recorded and does not stop the other transfers.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::RunConfig;
use crate::error::{CollectionError, ExecError};
use crate::executor::{Direction, Executor};
use crate::sched::Permits;
use crate::topology::Topology;

/// The run report's file name. Never used for an artifact.
pub const REPORT_FILE: &str = "report.json";

/// Extension for artifacts whose remote name has none.
const DEFAULT_EXT: &str = "out";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Retrieval {
    Retrieved,
    Failed { error: String },
}

#[derive(Clone, Debug, Serialize)]
pub struct ArtifactRecord {
    pub role: String,
    pub remote_path: String,
    pub local_path: PathBuf,
    /// Bytes written, if retrieved.
    pub size: Option<u64>,
    #[serde(flatten)]
    pub retrieval: Retrieval,
}

impl ArtifactRecord {
    pub fn is_retrieved(&self) -> bool {
        self.retrieval == Retrieval::Retrieved
    }
}

/// One planned transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Fetch<'t> {
    role: &'t str,
    remote: &'t str,
    local: PathBuf,
}

pub struct Collector<'a, E> {
    exec: &'a E,
    cfg: &'a RunConfig,
}

impl<'a, E: Executor> Collector<'a, E> {
    pub fn new(exec: &'a E, cfg: &'a RunConfig) -> Self {
        Collector { exec, cfg }
    }

    /// Fetch every artifact declared in `topology` into `output_dir`. Returns one record per
    /// declared artifact, in declaration order.
    pub fn collect(&self, topology: &Topology, output_dir: &Path) -> Vec<ArtifactRecord> {
        let plan = plan(topology, output_dir);
        let deadline = crate::deadline_in(self.cfg.collect_timeout);

        log::info!(
            "collecting {} artifacts into {}",
            plan.len(),
            output_dir.display()
        );

        if let Err(e) = std::fs::create_dir_all(output_dir) {
            let error = CollectionError::local(output_dir, e).to_string();
            return plan
                .into_iter()
                .map(|f| record(&f, Err(error.clone())))
                .collect();
        }

        let permits = Permits::new(self.cfg.concurrency);
        std::thread::scope(|s| {
            let handles: Vec<_> = plan
                .iter()
                .map(|fetch| {
                    let permits = &permits;
                    s.spawn(move || {
                        let _permit = permits.acquire();
                        self.fetch(topology, fetch, deadline)
                            .map_err(|e| {
                                log::warn!("{}", e);
                                e.to_string()
                            })
                    })
                })
                .collect();

            plan.iter()
                .zip(handles)
                .map(|(fetch, h)| {
                    let res = h
                        .join()
                        .unwrap_or_else(|_| Err("collection task panicked".into()));
                    record(fetch, res)
                })
                .collect()
        })
    }

    fn fetch(
        &self,
        topology: &Topology,
        fetch: &Fetch<'_>,
        deadline: Instant,
    ) -> Result<u64, CollectionError> {
        let transfer_error = |error| CollectionError::Transfer {
            role: fetch.role.to_owned(),
            remote: fetch.remote.to_owned(),
            error,
        };

        let host = match topology.host(fetch.role) {
            Some(host) => host,
            None => unreachable!("service `{}` without host", fetch.role),
        };

        let partial = partial_path(&fetch.local);
        let res = self
            .cfg
            .retry
            .run(
                |_| {
                    let left = deadline
                        .checked_duration_since(Instant::now())
                        .filter(|left| *left > Duration::from_millis(0))
                        .ok_or_else(|| ExecError::Timeout {
                            host: fetch.role.to_owned(),
                            after: self.cfg.collect_timeout,
                        })?;
                    self.exec.transfer(
                        host,
                        Direction::Fetch,
                        Path::new(fetch.remote),
                        &partial,
                        self.cfg.transfer_timeout.min(left),
                    )
                },
                |e| e.is_connection() || (e.is_timeout() && Instant::now() < deadline),
            )
            .map_err(transfer_error)
            .and_then(|size| {
                std::fs::rename(&partial, &fetch.local)
                    .map(|()| size)
                    .map_err(|e| CollectionError::local(&fetch.local, e))
            });

        if res.is_err() {
            // Do not leave a previous run's file behind under this run's name.
            remove_if_present(&partial);
            remove_if_present(&fetch.local);
        } else {
            log::debug!("`{}`: {} -> {}", fetch.role, fetch.remote, fetch.local.display());
        }

        res
    }
}

/// Assign a distinct local name to every declared artifact.
fn plan<'t>(topology: &'t Topology, output_dir: &Path) -> Vec<Fetch<'t>> {
    let mut taken: HashSet<String> = HashSet::new();
    taken.insert(REPORT_FILE.to_owned());

    let mut plan = vec![];
    for svc in topology.services() {
        for remote in svc.artifacts.iter() {
            let ext = Path::new(remote)
                .extension()
                .and_then(|e| e.to_str())
                .filter(|e| !e.is_empty())
                .unwrap_or(DEFAULT_EXT);

            let mut name = format!("{}.{}", svc.role, ext);
            let mut n = 1;
            while taken.contains(&name) {
                name = format!("{}.{}.{}", svc.role, n, ext);
                n += 1;
            }
            taken.insert(name.clone());

            plan.push(Fetch {
                role: &svc.role,
                remote,
                local: output_dir.join(name),
            });
        }
    }
    plan
}

fn partial_path(local: &Path) -> PathBuf {
    let mut name = local.file_name().unwrap_or_default().to_owned();
    name.push(".partial");
    local.with_file_name(name)
}

fn record(fetch: &Fetch<'_>, res: Result<u64, String>) -> ArtifactRecord {
    let (size, retrieval) = match res {
        Ok(size) => (Some(size), Retrieval::Retrieved),
        Err(error) => (None, Retrieval::Failed { error }),
    };
    ArtifactRecord {
        role: fetch.role.to_owned(),
        remote_path: fetch.remote.to_owned(),
        local_path: fetch.local.clone(),
        size,
        retrieval,
    }
}

fn remove_if_present(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("unable to remove {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::{config, host, service, topology, Action, MockExecutor};

    #[test]
    fn one_record_per_artifact_despite_failures() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let topology = topology(&[("a", &[]), ("b", &[]), ("c", &[])]);
        let exec = MockExecutor::new().fail("b", Action::Fetch);

        let records = Collector::new(&exec, &cfg).collect(&topology, dir.path());

        assert_eq!(records.len(), 3);
        assert_eq!(records.iter().filter(|r| r.is_retrieved()).count(), 2);

        let b = &records[1];
        assert_eq!(b.role, "b");
        assert!(matches!(b.retrieval, Retrieval::Failed { .. }));
        assert!(!dir.path().join("b.log").exists());

        for role in &["a", "c"] {
            let path = dir.path().join(format!("{}.log", role));
            let contents = std::fs::read_to_string(&path).unwrap();
            assert_eq!(contents, format!("/tmp/{}.log from {}\n", role, role));
        }
        assert!(!dir.path().join("a.log.partial").exists());
    }

    #[test]
    fn overwrites_and_clears_previous_runs() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let topology = topology(&[("a", &[]), ("b", &[])]);
        std::fs::write(dir.path().join("a.log"), "stale").unwrap();
        std::fs::write(dir.path().join("b.log"), "stale").unwrap();

        let exec = MockExecutor::new().fail("b", Action::Fetch);
        Collector::new(&exec, &cfg).collect(&topology, dir.path());

        let a = std::fs::read_to_string(dir.path().join("a.log")).unwrap();
        assert_ne!(a, "stale");
        assert!(!dir.path().join("b.log").exists());
    }

    #[test]
    fn names_are_distinct() {
        let mut svc = service("report", &[]);
        svc.artifacts = vec![
            "/tmp/report.json".into(),
            "/tmp/stats.csv".into(),
            "/tmp/other.csv".into(),
            "/var/log/noext".into(),
        ];
        let topology = Topology::new("t", vec![host("report")], vec![svc]).unwrap();

        let names: Vec<_> = plan(&topology, Path::new("/out"))
            .into_iter()
            .map(|f| f.local)
            .collect();

        assert_eq!(
            names,
            vec![
                PathBuf::from("/out/report.1.json"),
                PathBuf::from("/out/report.csv"),
                PathBuf::from("/out/report.1.csv"),
                PathBuf::from("/out/report.out"),
            ]
        );
    }

    #[test]
    fn services_without_artifacts_produce_no_records() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let mut svc = service("a", &[]);
        svc.artifacts.clear();
        let topology = Topology::new("t", vec![host("a")], vec![svc]).unwrap();

        let exec = MockExecutor::new();
        let records = Collector::new(&exec, &cfg).collect(&topology, dir.path());

        assert!(records.is_empty());
        assert_eq!(exec.count("a", Action::Fetch), 0);
    }
}
