//! velocity-runner: runs the burst-detection pipeline for one rule family.
//!
//! Usage:
//!   velocity-runner --config family.json run
//!   velocity-runner --config family.json --today 2025-03-01 detect --rule burst_10min
//!   velocity-runner --config family.json --log-file run.log reconcile --rule burst_10min
//!
//! Every stage outcome is printed to stdout as one JSON line.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use velocity_core::{
    clock::RunClock,
    config::{PipelineConfig, ValidatedConfig},
    flag_reconciliation::FlagReconciliationStage,
    historical_merge::HistoricalUpdateStage,
    stage::PipelineStage,
    velocity_detection::FlagDetectionStage,
};

#[derive(Parser, Debug)]
#[command(name = "velocity-runner")]
#[command(author, version, about = "Transaction velocity burst detection", long_about = None)]
struct Cli {
    /// Rule-family configuration (JSON)
    #[arg(long, env = "VELOCITY_CONFIG")]
    config: PathBuf,

    /// Evaluate the run as of this date (default: local today)
    #[arg(long, value_name = "YYYY-MM-DD")]
    today: Option<chrono::NaiveDate>,

    /// Also append log output to this file (stderr still receives it)
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Merge the last n_days of daily files into the historical store
    Historical,
    /// Run one rule's detection and write its daily flag batch
    Detect {
        #[arg(long)]
        rule: String,
    },
    /// Reconcile one rule's daily flag batch into the historical store
    Reconcile {
        #[arg(long)]
        rule: String,
    },
    /// Historical update, then detect and reconcile every rule
    Run,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logging(cli.log_file.as_ref()) {
        eprintln!("velocity-runner: {e:#}");
        return ExitCode::FAILURE;
    }
    match execute(&cli) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(failed) => {
            log::error!("{failed} stage(s) failed");
            ExitCode::FAILURE
        }
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(log_file: Option<&PathBuf>) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Cannot open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(Tee { file })));
    }
    builder.init();
    Ok(())
}

/// Log sink writing every line to stderr and to the log file.
struct Tee {
    file: std::fs::File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

/// Returns the number of failed stages.
fn execute(cli: &Cli) -> Result<usize> {
    let config = PipelineConfig::load(&cli.config)
        .with_context(|| format!("Cannot load configuration {}", cli.config.display()))?;
    let validated = config
        .validate()
        .with_context(|| format!("Invalid configuration {}", cli.config.display()))?;
    let clock = cli.today.map(RunClock::fixed).unwrap_or_else(RunClock::system);
    log::info!("velocity-runner: {} as of {}", cli.config.display(), clock.today);

    let failed = match &cli.command {
        Command::Historical => {
            let stage = HistoricalUpdateStage::new(&config, &validated.declared_flags);
            usize::from(!run_stage(&stage, &clock)?)
        }
        Command::Detect { rule } => {
            let stage = FlagDetectionStage::new(&config, validated.rule(rule)?);
            usize::from(!run_stage(&stage, &clock)?)
        }
        Command::Reconcile { rule } => {
            let stage = FlagReconciliationStage::new(&config, validated.rule(rule)?);
            usize::from(!run_stage(&stage, &clock)?)
        }
        Command::Run => run_all(&config, &validated, &clock)?,
    };
    Ok(failed)
}

/// Historical update first; a failure there stops the run. Each rule then
/// detects and reconciles; a failed detection skips that rule's
/// reconciliation only.
fn run_all(config: &PipelineConfig, validated: &ValidatedConfig, clock: &RunClock) -> Result<usize> {
    let update = HistoricalUpdateStage::new(config, &validated.declared_flags);
    if !run_stage(&update, clock)? {
        log::error!("Historical update failed; skipping all rules");
        return Ok(1);
    }

    let mut failed = 0;
    for rule in &validated.rules {
        if !run_stage(&FlagDetectionStage::new(config, rule), clock)? {
            log::error!("[{}] Detection failed; skipping reconciliation", rule.name);
            failed += 1;
            continue;
        }
        if !run_stage(&FlagReconciliationStage::new(config, rule), clock)? {
            failed += 1;
        }
    }
    Ok(failed)
}

/// Run one stage and print its event. Ok(false) when the stage failed.
fn run_stage(stage: &dyn PipelineStage, clock: &RunClock) -> Result<bool> {
    let label = match stage.rule() {
        Some(rule) => format!("{} [{rule}]", stage.name()),
        None => stage.name().to_string(),
    };
    match stage.run(clock) {
        Ok(event) => {
            let mut stdout = io::stdout().lock();
            writeln!(stdout, "{}", serde_json::to_string(&event)?)?;
            stdout.flush()?;
            Ok(true)
        }
        Err(e) => {
            log::error!("{label} failed: {e}");
            Ok(false)
        }
    }
}
