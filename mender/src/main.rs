//! Iterative self-repair runner for a Python source tree.
//!
//! `mender run` analyzes every in-scope file under the target directory, then
//! loops repair and evaluation on it until an objective verdict settles it.
//! All writes go through a sandbox confined to the target directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;

use mender::core::summary::RunSummary;
use mender::core::types::RunStatus;
use mender::exit_codes;
use mender::io::analyzer::PylintAnalyzer;
use mender::io::config::{CONFIG_FILE_NAME, MenderConfig, load_config, write_config};
use mender::io::discover::discover_files;
use mender::io::generator::CommandGenerator;
use mender::io::retry::ThreadSleeper;
use mender::io::sandbox::Sandbox;
use mender::io::syntax::PythonSyntaxValidator;
use mender::io::telemetry::JsonTelemetry;
use mender::io::test_runner::PytestRunner;
use mender::logging;
use mender::workflow::{Collaborators, Workflow, WorkflowOptions};

#[derive(Parser)]
#[command(
    name = "mender",
    version,
    about = "Iterative, sandboxed self-repair of a source tree"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default `mender.toml` into the target directory if missing.
    Init {
        #[arg(long, default_value = ".")]
        target_dir: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Print the files a run would process, one per line.
    Discover {
        #[arg(long, default_value = ".")]
        target_dir: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Repair every in-scope file under the target directory.
    Run(RunArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    #[arg(long, default_value = ".")]
    target_dir: PathBuf,
    /// Config file (default: `<target-dir>/mender.toml`).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override `workflow.max_iterations`.
    #[arg(long)]
    max_iterations: Option<u32>,
    /// Run every stage without writing files.
    #[arg(long)]
    dry_run: bool,
    /// Override `telemetry.log_dir`.
    #[arg(long)]
    log_dir: Option<PathBuf>,
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();
    let verbose = matches!(&cli.command, Command::Run(args) if args.verbose);
    logging::init(verbose);

    let code = match dispatch(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn dispatch(command: Command) -> Result<i32> {
    match command {
        Command::Init { target_dir, force } => cmd_init(&target_dir, force),
        Command::Discover { target_dir, config } => cmd_discover(&target_dir, config.as_deref()),
        Command::Run(args) => cmd_run(&args),
    }
}

fn cmd_init(target_dir: &Path, force: bool) -> Result<i32> {
    let path = target_dir.join(CONFIG_FILE_NAME);
    if path.exists() && !force {
        println!("init: {} already exists", path.display());
        return Ok(exit_codes::OK);
    }
    write_config(&path, &MenderConfig::default())?;
    println!("init: wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_discover(target_dir: &Path, config: Option<&Path>) -> Result<i32> {
    let cfg = load_for(target_dir, config)?;
    for path in discover_files(target_dir, &cfg.sandbox)? {
        println!("{}", path.display());
    }
    Ok(exit_codes::OK)
}

fn cmd_run(args: &RunArgs) -> Result<i32> {
    let mut cfg = load_for(&args.target_dir, args.config.as_deref())?;
    if let Some(max_iterations) = args.max_iterations {
        cfg.workflow.max_iterations = max_iterations;
    }
    if args.dry_run {
        cfg.workflow.dry_run = true;
    }
    if let Some(log_dir) = &args.log_dir {
        cfg.telemetry.log_dir = log_dir.clone();
    }
    cfg.validate().context("validate configuration")?;

    let sandbox = Sandbox::new(&args.target_dir, &cfg.sandbox, cfg.workflow.dry_run)?;
    let generator = CommandGenerator::new(&cfg.generator, &cfg.timeouts);
    let analyzer = PylintAnalyzer::new(&cfg.python, &cfg.timeouts);
    let test_runner = PytestRunner::new(&cfg.python, &cfg.timeouts);
    let validator = PythonSyntaxValidator::new(&cfg.python, &cfg.timeouts);
    let mut telemetry = JsonTelemetry::new(
        &cfg.telemetry.log_dir,
        sandbox.root(),
        cfg.workflow.max_iterations,
        cfg.telemetry.auto_save_interval,
    );

    let cancel = Arc::new(AtomicBool::new(false));
    watch_interrupt(Arc::clone(&cancel));

    let workflow = Workflow::new(
        &sandbox,
        Collaborators {
            generator: &generator,
            analyzer: &analyzer,
            test_runner: &test_runner,
            validator: &validator,
            sleeper: &ThreadSleeper,
        },
        WorkflowOptions::from(&cfg),
    )
    .with_cancel_flag(cancel);

    let summary = workflow.run(&mut telemetry)?;
    print_summary(&summary, telemetry.path());
    Ok(exit_code(&summary))
}

fn load_for(target_dir: &Path, config: Option<&Path>) -> Result<MenderConfig> {
    let path = config
        .map(Path::to_path_buf)
        .unwrap_or_else(|| target_dir.join(CONFIG_FILE_NAME));
    load_config(&path)
}

/// Set `cancel` on Ctrl-C from a helper thread running its own runtime.
fn watch_interrupt(cancel: Arc<AtomicBool>) {
    let spawned = thread::Builder::new()
        .name("mender-interrupt".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    warn!(err = %err, "interrupt handler unavailable");
                    return;
                }
            };
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("run: interrupt received, stopping before the next stage");
                    cancel.store(true, Ordering::SeqCst);
                }
            });
        });
    if let Err(err) = spawned {
        warn!(err = %err, "interrupt handler thread not started");
    }
}

fn print_summary(summary: &RunSummary, telemetry_path: &Path) {
    println!(
        "run: status={} files={} successful={} failed={} score={:.2}->{:.2} iterations={}",
        summary.status.as_str(),
        summary.files_processed,
        summary.files_successful,
        summary.files_failed,
        summary.initial_average,
        summary.final_average,
        summary.global_iterations,
    );
    for file in &summary.files {
        println!(
            "run:   {:?} {} (iterations={}, score {:.2}->{:.2})",
            file.status,
            file.path.display(),
            file.iterations,
            file.original_score,
            file.current_score,
        );
    }
    println!("run: telemetry={}", telemetry_path.display());
}

fn exit_code(summary: &RunSummary) -> i32 {
    match summary.status {
        RunStatus::Cancelled => exit_codes::INTERRUPTED,
        _ if summary.has_failures() => exit_codes::PARTIAL,
        RunStatus::Success | RunStatus::NoFiles => exit_codes::OK,
        RunStatus::Partial | RunStatus::Running => exit_codes::PARTIAL,
    }
}
