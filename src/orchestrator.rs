//! Top-level entry point: run one benchmark end to end and describe what happened.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use failure::ResultExt;
use serde::Serialize;

use crate::collector::{ArtifactRecord, REPORT_FILE};
use crate::config::RunConfig;
use crate::controller::{
    CompletionHandle, FailureCause, RunController, RunOutcome, RunState, Transition, WindowEnd,
};
use crate::deploy::RoleOutcome;
use crate::executor::Executor;
use crate::topology::Topology;

#[derive(Clone, Debug, Serialize)]
pub struct PhaseTiming {
    pub phase: String,
    pub elapsed_ms: u64,
}

/// The record of a complete run. Written to `<output_dir>/report.json`.
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub benchmark: String,
    /// Wall-clock start of the run, RFC 3339.
    pub started_at: String,
    pub final_state: RunState,
    pub transitions: Vec<Transition>,
    pub window: Option<WindowEnd>,
    pub phases: Vec<PhaseTiming>,
    pub provisioning: Vec<RoleOutcome>,
    pub teardown: Vec<RoleOutcome>,
    pub artifacts: Vec<ArtifactRecord>,
    pub params: BTreeMap<String, toml::Value>,
    pub elapsed_ms: u64,
}

impl RunReport {
    fn new(topology: &Topology, cfg: &RunConfig, started_at: String, outcome: RunOutcome) -> Self {
        RunReport {
            benchmark: topology.name().to_owned(),
            started_at,
            final_state: outcome.state,
            transitions: outcome.transitions,
            window: outcome.window,
            phases: outcome
                .phases
                .iter()
                .map(|(phase, d)| PhaseTiming {
                    phase: phase.to_string(),
                    elapsed_ms: d.as_millis() as u64,
                })
                .collect(),
            provisioning: outcome.provisioning,
            teardown: outcome.teardown,
            artifacts: outcome.artifacts,
            params: cfg.params.clone(),
            elapsed_ms: outcome.elapsed.as_millis() as u64,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.final_state == RunState::Succeeded
    }

    pub fn failure(&self) -> Option<&FailureCause> {
        match &self.final_state {
            RunState::Failed(cause) => Some(cause),
            _ => None,
        }
    }

    /// Write the report as pretty-printed JSON into `output_dir`, returning the file's path.
    pub fn save(&self, output_dir: &Path) -> Result<PathBuf, failure::Error> {
        std::fs::create_dir_all(output_dir)
            .with_context(|_| format!("creating {}", output_dir.display()))?;
        let path = output_dir.join(REPORT_FILE);
        let file = std::fs::File::create(&path)
            .with_context(|_| format!("creating {}", path.display()))?;
        serde_json::to_writer_pretty(file, self)
            .with_context(|_| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

pub struct Orchestrator<'a, E: Executor> {
    topology: &'a Topology,
    cfg: &'a RunConfig,
    exec: &'a E,
}

impl<'a, E: Executor> Orchestrator<'a, E> {
    pub fn new(topology: &'a Topology, cfg: &'a RunConfig, exec: &'a E) -> Self {
        Orchestrator {
            topology,
            cfg,
            exec,
        }
    }

    /// Run with the measurement window ending only at `timeout` (or the overall deadline).
    pub fn run(&self) -> RunReport {
        self.run_with(|_| {})
    }

    /// Like [`Orchestrator::run`], handing a [`CompletionHandle`] to `driver` before provisioning
    /// starts. The driver may keep the handle (e.g. move it to a thread watching the workload) and
    /// use it to end the window early or abort the run.
    pub fn run_with<F>(&self, driver: F) -> RunReport
    where
        F: FnOnce(CompletionHandle),
    {
        let started_at = chrono::Local::now().to_rfc3339();
        let controller = RunController::new(self.exec, self.cfg);
        driver(controller.completion_handle());

        log::info!(
            "launching `{}`: {} roles, {:?} window, results in {}",
            self.topology.name(),
            self.topology.services().len(),
            self.cfg.timeout,
            self.cfg.output_dir.display()
        );

        let deadline = crate::deadline_in(self.cfg.max_duration);
        let outcome = controller.run(self.topology, deadline);

        log::info!(
            "`{}` finished as {} after {:?}\n{}",
            self.topology.name(),
            outcome.state.name(),
            outcome.elapsed,
            crate::timings_str(&outcome.phases)
        );

        RunReport::new(self.topology, self.cfg, started_at, outcome)
    }
}
