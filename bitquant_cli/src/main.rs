mod cli;

use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use bitquant_rs::pipeline::{
    run_backtest_pipeline, run_evaluation, run_factor_pipeline, run_signal_pipeline,
};
use bitquant_rs::storage::read_wire_records;
use clap::Parser;
use cli::{Cli, Commands};
use tracing_appender::non_blocking;
use tracing_subscriber::{EnvFilter, prelude::*};

fn init_tracing(log_file: Option<PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| anyhow!("failed to create log directory {parent:?}: {err}"))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| anyhow!("failed to open log file {path:?}: {err}"))?;
        let (non_blocking_writer, guard) = non_blocking(file);
        // The writer flushes only while the guard lives.
        let _guard = Box::leak(Box::new(guard));
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(non_blocking_writer);
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .with(file_layer)
            .try_init()
            .map_err(|err| anyhow!("failed to initialize tracing: {err}"))
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .try_init()
            .map_err(|err| anyhow!("failed to initialize tracing: {err}"))
    }
}

fn log_invocation(command: &str, log_file: Option<&PathBuf>) {
    let cwd = std::env::current_dir().ok();
    let argv: Vec<String> = std::env::args_os()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();

    tracing::info!("==================== new bitquant run ====================");
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        command,
        cwd = ?cwd,
        log_file = ?log_file,
        argv = ?argv,
        "bitquant invoked"
    );
    if argv.len() >= 2 {
        tracing::info!(
            "cargo_repro_command=cargo run --release -p bitquant_cli -- {}",
            argv[1..].join(" ")
        );
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{body}");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = cli.command.run_args().clone();
    let no_file_log = args.no_file_log;
    let config = args.into_config()?;
    let log_file = (!no_file_log).then(|| config.output_dir.join("bitquant.log"));

    let name = match &cli.command {
        Commands::Backtest(_) => "backtest",
        Commands::Signal(_) => "signal",
        Commands::Evaluate(_) => "evaluate",
        Commands::Factors(_) => "factors",
    };
    init_tracing(log_file.clone())?;
    log_invocation(name, log_file.as_ref());

    match cli.command {
        Commands::Backtest(_) => {
            let outcome = run_backtest_pipeline(&config)?;
            print_json(&outcome.report.metrics)
        }
        Commands::Signal(_) => {
            let record = run_signal_pipeline(&config)?;
            print_json(&record.to_wire())
        }
        Commands::Evaluate(args) => {
            let records = read_wire_records(&args.records)?;
            let outcome = run_evaluation(&config, &records)?;
            print_json(&outcome)
        }
        Commands::Factors(_) => {
            let table = run_factor_pipeline(&config)?;
            tracing::info!(
                names = ?table.names(),
                rows = table.n_rows(),
                "factor table ready"
            );
            Ok(())
        }
    }
}
