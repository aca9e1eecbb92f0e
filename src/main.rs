//! fwpilot - firmware checks and updates over a remote shell
//!
//! ```text
//! fwpilot bmc --ip 10.0.0.5 --password secret
//! fwpilot hba --ip 10.0.0.5 --ip 10.0.0.6 --controller 1 --dry-run
//! fwpilot nic --ip 10.0.0.5 --model NX-3060-G6 --version 1.2 --part INTC
//! ```
//!
//! Exit code 0 when every host is up to date or updated, 1 otherwise.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fwpilot::config::ConfigLoader;
use fwpilot::fleet::{run_fleet, HostResult};
use fwpilot::orchestrator::ApplyOutcome;
use fwpilot::runner::{JobOutcome, UpdateJob, UpdateMode};
use fwpilot::session::{Connector, Credentials, Dialer, Prober, Target};
use fwpilot::{logging, ComponentKind, Error};

#[derive(Parser)]
#[command(name = "fwpilot")]
#[command(about = "Check and update server firmware over SSH", long_about = None)]
#[command(disable_version_flag = true)]
struct Cli {
    /// Component family: bmc, bios, hba, mcu, mlx or nic
    family: ComponentKind,

    /// Host to update; repeat for several hosts
    #[arg(long = "ip", required = true)]
    hosts: Vec<String>,

    #[arg(short, long, default_value = "root")]
    username: String,

    #[arg(short, long, env = "FWPILOT_PASSWORD", hide_env_values = true)]
    password: String,

    /// Platform model; forces an update to --version
    #[arg(long, requires = "fw_version")]
    model: Option<String>,

    /// Firmware version to force
    #[arg(long = "version", id = "fw_version", requires = "model")]
    fw_version: Option<String>,

    /// Model map slot (needed for mlx and nic)
    #[arg(long)]
    part: Option<String>,

    /// Controller index for hosts with several adapters
    #[arg(long, default_value_t = 0)]
    controller: u32,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log: Option<PathBuf>,

    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Policy file; overrides the configured one
    #[arg(long)]
    policy: Option<PathBuf>,

    /// Hosts updated at the same time
    #[arg(long, default_value_t = 4)]
    parallel: usize,

    /// Decide only, do not flash
    #[arg(long)]
    dry_run: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn update_mode(cli: &Cli) -> Result<UpdateMode> {
    match (&cli.model, &cli.fw_version) {
        (Some(model), Some(version)) => {
            let slot = cli
                .part
                .clone()
                .or_else(|| cli.family.model_slot().map(str::to_string))
                .ok_or_else(|| anyhow!("--part is required to force a {} update", cli.family))?;
            Ok(UpdateMode::Forced {
                model: model.clone(),
                slot,
                version: version.as_str().into(),
            })
        }
        _ => Ok(UpdateMode::Auto),
    }
}

fn print_outcome(host: &str, outcome: &JobOutcome) {
    match outcome {
        JobOutcome::NoUpdate(d) => {
            println!("{}: {} {}: no update needed ({})", host, d.identity, d.current, d.outcome);
        }
        JobOutcome::Planned(d) => {
            let artifact = d.artifact.as_ref().map(|a| a.as_str()).unwrap_or("-");
            println!(
                "{}: {} would update {} -> {} from {}",
                host, d.identity, d.current, d.target, artifact
            );
        }
        JobOutcome::Applied { decision, report } => {
            println!(
                "{}: {} updated {} -> {} ({} step(s), {} reboot(s))",
                host,
                decision.identity,
                decision.current,
                decision.target,
                report.steps.len(),
                report.reboots
            );
            if report.outcome == ApplyOutcome::PowerCycleRequired {
                println!("{}: power cycle required to activate the new firmware", host);
            }
        }
    }
}

fn report(results: &[HostResult<Vec<JobOutcome>>]) -> bool {
    let mut all_ok = true;
    for HostResult { host, result } in results {
        match result {
            Ok(outcomes) => {
                for outcome in outcomes {
                    print_outcome(host, outcome);
                }
            }
            Err(e) => {
                all_ok = false;
                eprintln!("{}: FAIL: {}", host, e);
                if let Error::Apply {
                    completed, skipped, ..
                } = e
                {
                    eprintln!("{}:   completed: {:?}", host, completed);
                    eprintln!("{}:   not run:   {:?}", host, skipped);
                }
            }
        }
    }
    all_ok
}

async fn run(cli: Cli) -> Result<bool> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_path(path);
    }
    let config = loader.load().context("loading configuration")?;

    let level = if cli.verbose {
        logging::level_for(true)
    } else {
        config.logging.level.as_str()
    };
    let log_file = cli.log.clone().or_else(|| config.logging.file.clone());
    logging::init(level, log_file.as_deref()).context("initialising logging")?;
    info!("fwpilot v{} updating {}", fwpilot::VERSION, cli.family);

    let kind = cli.family;
    let mode = update_mode(&cli)?;
    let catalog = Arc::new(
        config
            .load_catalog(cli.policy.as_deref())
            .context("loading policy")?,
    );
    let collector = config.collector(kind, &catalog)?;
    let plan = config.plan(kind);
    plan.validate().context("checking apply plan")?;

    let job = UpdateJob::new(kind, catalog, collector, plan)
        .mode(mode)
        .orchestrator_options(config.orchestrator.to_options())
        .controller(cli.controller)
        .dry_run(cli.dry_run);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling running transactions");
            on_signal.cancel();
        }
    });

    let credentials = Credentials::new(cli.username.clone(), cli.password.clone());
    let options = config.session.to_options();
    let port = config.session.port;
    let dialer: Arc<dyn Dialer> = Arc::new(config.session.dialer());
    let prober: Arc<dyn Prober> = Arc::new(config.session.prober());

    let results = run_fleet(cli.hosts.clone(), cli.parallel, move |host| {
        let job = job.clone();
        let connector = Connector::new(
            Target::new(host).with_port(port),
            credentials.clone(),
            options.clone(),
            Arc::clone(&dialer),
            Arc::clone(&prober),
        )
        .with_cancellation(cancel.clone());
        async move { job.run_all(Arc::new(connector)).await }
    })
    .await;

    Ok(report(&results))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
