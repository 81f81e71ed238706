//! CLI entry point for rf-collect
//!
//! # Usage
//!
//! Run a session with the settings in `config/collect.toml`:
//! ```bash
//! rf-collect run --runs 10 --tag bench
//! ```
//!
//! Validate configuration and check that tools and devices are present:
//! ```bash
//! rf-collect check
//! ```
//!
//! Print what the device info tool reports:
//! ```bash
//! rf-collect devices
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rf_collect::config::{CollectConfig, DEFAULT_CONFIG_PATH};
use rf_collect::error::CollectError;
use rf_collect::{logging, preflight, SessionRunner};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;

#[derive(Parser)]
#[command(name = "rf-collect")]
#[command(about = "Synchronized two-receiver / one-transmitter capture controller", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Override the log format (pretty, compact, json)
    #[arg(long, global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a capture session
    Run {
        /// Number of runs
        #[arg(long)]
        runs: Option<u32>,

        /// Tag appended to the session directory name
        #[arg(long)]
        tag: Option<String>,

        /// Directory that receives the session directory
        #[arg(long)]
        data_root: Option<PathBuf>,

        /// Start receivers immediately instead of waiting for the hardware trigger
        #[arg(long)]
        no_hw_trigger: bool,

        /// Zip the session directory when the session completes
        #[arg(long)]
        archive: bool,

        /// Skip the tool and device presence check
        #[arg(long)]
        skip_preflight: bool,
    },

    /// Validate configuration and check tools and devices
    Check,

    /// Print the device info tool output
    Devices,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err
                .downcast_ref::<CollectError>()
                .map(CollectError::exit_code)
                .unwrap_or(1);
            eprintln!("Error: {err:#}");
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = CollectConfig::load_from(&cli.config)?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    match cli.command {
        Commands::Run {
            runs,
            tag,
            data_root,
            no_hw_trigger,
            archive,
            skip_preflight,
        } => {
            if let Some(runs) = runs {
                config.session.runs = runs;
            }
            if tag.is_some() {
                config.session.tag = tag;
            }
            if let Some(data_root) = data_root {
                config.session.data_root = data_root;
            }
            if no_hw_trigger {
                config.capture.hw_trigger = false;
            }
            if archive {
                config.session.archive = true;
            }
            if skip_preflight {
                config.capture.tools.preflight = false;
            }

            config.validate()?;
            logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
            info!(config = %cli.config.display(), "configuration loaded");

            if config.capture.tools.preflight {
                preflight::run_preflight(&config.capture).await?;
            }

            let runner = SessionRunner::new(config)?;
            let summary = runner.run_until_interrupted().await?;
            println!("Session complete: {}", summary.session_dir.display());
            if let Some(archive) = summary.archive {
                println!("Archive: {}", archive.display());
            }
            Ok(())
        }

        Commands::Check => {
            config.validate()?;
            logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
            preflight::run_preflight(&config.capture).await?;

            let capture = &config.capture;
            println!("Configuration OK: {}", cli.config.display());
            println!("  runs        : {}", config.session.runs);
            println!("  data root   : {}", config.session.data_root.display());
            println!("  freq (Hz)   : {}", capture.rf.center_freq_hz);
            println!("  rate (Hz)   : {}", capture.rf.sample_rate_hz);
            println!("  samples     : {}", capture.rf.num_samples);
            println!("  capture     : {:?}", capture.capture_duration());
            for (role, serial) in capture.device_serials() {
                println!("  {role:<11} : {serial}");
            }
            Ok(())
        }

        Commands::Devices => {
            logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
            let listing = preflight::device_listing(&config.capture.tools.info_program)
                .await
                .context("device listing failed")?;
            print!("{listing}");
            Ok(())
        }
    }
}
