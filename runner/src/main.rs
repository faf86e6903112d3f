use ccbatch_runner::{
    config::{ConfigErrors, RunnerConfig},
    executors::slurm::SlurmExecutor,
    ledger::Ledger,
    restart::{self, RestartOutcome},
    runner::BatchRunner,
};
use clap::{Parser, Subcommand};
use std::{path::PathBuf, process::ExitCode};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;

#[derive(Parser)]
#[command(name = "ccbatch", version, about = "Dependency aware batch runner for cluster jobs", long_about = None)]
struct Cli {
    /// Runner configuration (YAML), built-in defaults if omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Log at debug level, RUST_LOG takes precedence
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a batch until every job is finished or can't progress
    Run {
        /// Batch definition file
        batch: PathBuf,
        /// Maximum number of pending/running jobs, overrides the config
        #[arg(short = 'j', long)]
        max_jobs: Option<usize>,
        /// Ignore an existing ledger next to the batch file
        #[arg(long)]
        fresh: bool,
    },
    /// Print the failure cause of every failed job in a ledger
    Classify {
        ledger: PathBuf,
    },
    /// Classify and restart the failed jobs of a ledger
    Restart {
        ledger: PathBuf,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<RunnerConfig, ConfigErrors> {
    let config = match path {
        Some(path) if !path.is_file() => return Err(ConfigErrors::FileNotFound(path.clone())),
        Some(path) => RunnerConfig::load(path)?,
        None => RunnerConfig::default(),
    };

    if config.preflight_checks() {
        return Err(ConfigErrors::PreflightFailed);
    }

    Ok(config)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_log();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(error) => {
            error!("Failed to load config: {error}");
            return ExitCode::FAILURE;
        }
    };

    let executor = SlurmExecutor::new(config.scheduler.clone());

    match cli.command {
        Commands::Run {
            batch,
            max_jobs,
            fresh,
        } => {
            let mut config = config;
            if let Some(max_jobs) = max_jobs {
                config.max_jobs = max_jobs.max(1);
            }

            let result = BatchRunner::from_batch(&batch, config, executor, fresh).and_then(|mut runner| runner.run());

            if let Err(error) = result {
                error!("Run aborted: {error}");
                return ExitCode::FAILURE;
            }
        }
        Commands::Classify { ledger } => {
            let ledger = match Ledger::load(&ledger) {
                Ok(ledger) => ledger,
                Err(error) => {
                    error!("Failed to load ledger: {error}");
                    return ExitCode::FAILURE;
                }
            };

            println!("job_directory|program|job_status|fail_cause");
            for classification in restart::classify_ledger(&ledger, &executor, &config) {
                println!("{classification}");
            }
        }
        Commands::Restart { ledger: path } => {
            let mut ledger = match Ledger::load(&path) {
                Ok(ledger) => ledger,
                Err(error) => {
                    error!("Failed to load ledger: {error}");
                    return ExitCode::FAILURE;
                }
            };

            let outcomes = restart::restart_ledger(&mut ledger, &executor, &config);
            let restarted = outcomes
                .iter()
                .filter(|(_, outcome)| matches!(outcome, Ok(RestartOutcome::Restarted { .. })))
                .count();

            if let Err(error) = ledger.persist(&path) {
                error!("Failed to write ledger: {error}");
                return ExitCode::FAILURE;
            }

            info!(restarted, failed = outcomes.len(), "Restart done, run the batch again to resubmit");
        }
    }

    ExitCode::SUCCESS
}
