//! HIDS Agent - Main Entry Point
//!
//! Loads the configuration, wires the collaborators, starts detection and
//! runs until Ctrl-C.

mod constants;
mod logic;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use constants::{APP_NAME, APP_VERSION};
use logic::agent::{Agent, AgentDeps};
use logic::config::Config;
use logic::source::{SourceInput, SubscribeMode};

/// How long shutdown waits for the detection loop to drain
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = APP_NAME, version = APP_VERSION, about = "Host intrusion detection agent")]
struct Cli {
    /// Configuration file (defaults to $HIDS_CONFIG or ./hids-agent.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON lines telemetry file to follow, stdin when absent
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Process the whole input file instead of only new records
    #[arg(long)]
    from_start: bool,

    /// Log response actions instead of performing them
    #[arg(long)]
    dry_run: bool,

    /// Print every scanned event to stdout
    #[arg(long)]
    print_all: bool,

    /// Print a full report and exit
    #[arg(long)]
    dump_report: bool,
}

fn init_logging(logfile: Option<&Path>) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));

    if let Some(path) = logfile {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {}: {}", path.display(), e),
        }
    }

    builder.init();
}

fn load_config(path: &Path) -> Result<Config, logic::config::ConfigError> {
    if path.exists() {
        Config::load(path)
    } else {
        Ok(Config::default())
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(constants::get_config_path);
    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(config.logfile.as_deref());
    log::info!("Starting {} v{}", APP_NAME, APP_VERSION);
    if !config_path.exists() {
        log::warn!("Config file {} not found, using defaults", config_path.display());
    }

    let input = cli
        .input
        .clone()
        .map(SourceInput::File)
        .unwrap_or(SourceInput::Stdin);

    let agent = match AgentDeps::from_config(&config, input).and_then(|deps| Agent::new(config, deps)) {
        Ok(agent) => agent,
        Err(e) => {
            log::error!("Failed to initialize agent: {}", e);
            return ExitCode::FAILURE;
        }
    };
    agent.set_dry_run(cli.dry_run);
    agent.set_print_all(cli.print_all);

    if cli.dump_report {
        match serde_json::to_string_pretty(&agent.report(false)) {
            Ok(json) => println!("{}", json),
            Err(e) => log::error!("Failed to serialize report: {}", e),
        }
        agent.stop();
        return ExitCode::SUCCESS;
    }

    let mode = if cli.from_start {
        SubscribeMode::All
    } else {
        SubscribeMode::Future
    };
    agent.run(mode);

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to create signal runtime: {}", e);
            agent.stop();
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {}", e);
        }
    });

    log::info!("Shutdown requested");
    agent.stop();
    if !agent.wait_with_timeout(SHUTDOWN_TIMEOUT) {
        log::warn!("Detection loop did not stop within {:?}", SHUTDOWN_TIMEOUT);
    }
    agent.log_stats();

    ExitCode::SUCCESS
}
