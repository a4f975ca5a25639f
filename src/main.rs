//! Launches one distributed benchmark: provision, measure, collect, tear down.

use failure::ResultExt;

use launcher::{
    cli,
    config::RunConfig,
    executor::{DryRunExecutor, Executor},
    orchestrator::{Orchestrator, RunReport},
    ssh::SshExecutor,
    topology::Topology,
};

fn launch<E: Executor>(topology: &Topology, cfg: &RunConfig, exec: &E) -> RunReport {
    Orchestrator::new(topology, cfg, exec).run()
}

/// Returns whether the run succeeded.
fn run() -> Result<bool, failure::Error> {
    let matches = cli::cli_options().get_matches();
    let args = cli::parse(&matches);

    let topology = Topology::load(&args.benchmark)
        .with_context(|_| format!("loading benchmark {}", args.benchmark.display()))?;
    let cfg = match &args.configfile {
        Some(path) => RunConfig::load(path, &args.overrides)
            .with_context(|_| format!("loading configuration {}", path.display()))?,
        None => RunConfig::from_toml("", &args.overrides).context("default configuration")?,
    };

    let report = if args.dry_run {
        launch(&topology, &cfg, &DryRunExecutor)
    } else {
        launch(&topology, &cfg, &SshExecutor::new(cfg.ssh.clone()))
    };

    let path = report.save(&cfg.output_dir)?;
    println!("{}", path.display());

    if let Some(cause) = report.failure() {
        eprintln!(
            "{}",
            console::style(format!("`{}` failed: {}", topology.name(), cause))
                .red()
                .bold()
        );
    }

    Ok(report.succeeded())
}

fn main() {
    use console::style;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),

        // If an error occurred, try to print something helpful.
        Err(err) => {
            const MESSAGE: &str = r#"== ERROR ==================================================================================
`launcher` encountered an error. The log above may offer clues. If the error pertains to SSH, you
may be able to get useful information by setting the RUST_LOG=debug environment variable.
"#;

            println!("{}", style(MESSAGE).red().bold());

            println!(
                "`launcher` encountered the following error:\n{}",
                err.iter_chain()
                    .map(|cause| cause.to_string())
                    .collect::<Vec<_>>()
                    .join("\n  caused by: ")
            );

            std::process::exit(101);
        }
    }
}
