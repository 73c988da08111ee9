//! gantryd - the Gantry proxy daemon.
//!
//! # Commands
//!
//! - `gantryd run -c gantry.toml` - Load the configuration and serve
//! - `gantryd check -c gantry.toml` - Validate the configuration and exit
//!
//! Exit codes: 0 on clean shutdown, 1 on configuration errors, 2 on
//! runtime failures.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gantry_config::ConfigLoader;
use gantry_core::Worker;

/// Gantry - L4/L7 reverse proxy and load balancer
#[derive(Parser)]
#[command(name = "gantryd")]
#[command(author = "Pegasus Heavy Industries LLC")]
#[command(version)]
#[command(about = "High-performance TCP reverse proxy and load balancer")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log in JSON instead of human-readable lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the configuration and serve traffic
    #[command(alias = "r", visible_alias = "serve")]
    Run(RunArgs),

    /// Validate a configuration file and exit
    #[command(alias = "c")]
    Check(CheckArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Configuration file
    #[arg(short, long, env = "GANTRY_CONFIG", default_value = "gantry.toml")]
    config: PathBuf,
}

#[derive(clap::Args)]
struct CheckArgs {
    /// Configuration file
    #[arg(short, long, env = "GANTRY_CONFIG", default_value = "gantry.toml")]
    config: PathBuf,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Commands::Check(args) => match ConfigLoader::load_file(&args.config) {
            Ok(cfg) => {
                info!(
                    config = %args.config.display(),
                    frontends = cfg.frontend.len(),
                    backends = cfg.backend.len(),
                    "configuration is valid"
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(config = %args.config.display(), "{e}");
                ExitCode::from(1)
            }
        },
        Commands::Run(args) => {
            let cfg = match ConfigLoader::load_file(&args.config) {
                Ok(cfg) => cfg,
                Err(e) => {
                    error!(config = %args.config.display(), "{e}");
                    return ExitCode::from(1);
                }
            };
            let mut worker = match Worker::from_config(&cfg) {
                Ok(w) => w,
                Err(e) => {
                    error!("{e}");
                    return ExitCode::from(e.exit_code() as u8);
                }
            };
            if let Err(e) = worker.install_signals() {
                error!("{e}");
                return ExitCode::from(2);
            }
            match worker.run() {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("{e}");
                    ExitCode::from(e.exit_code() as u8)
                }
            }
        }
    }
}
