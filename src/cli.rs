use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use flowsentry::classify::{classify_file, ThresholdClassifier};
use flowsentry::config::Config;
use flowsentry::controller::Controller;

#[derive(Parser)]
#[command(name = "flowsentry")]
#[command(author, version, about = "Reactive OpenFlow controller with flow feature collection")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the controller
    Run {
        /// Listen address for the OpenFlow channel
        #[arg(short, long)]
        listen: Option<String>,

        /// Start with mitigation enabled
        #[arg(short, long)]
        mitigation: bool,

        /// Dataset output file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Label stamped on every collected row
        #[arg(long)]
        label: Option<String>,
    },

    /// Show or generate configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Classify a collected dataset
    Classify {
        /// Dataset CSV to read
        file: PathBuf,

        /// Packets-per-second threshold above which a flow is flagged
        #[arg(short, long, default_value = "1000")]
        threshold: f64,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Write a default configuration file
    Init {
        /// Output path
        #[arg(short, long, default_value = "flowsentry.toml")]
        output: PathBuf,
    },
}

/// Set up the subscriber before anything logs. `--debug` wins over
/// `RUST_LOG`; without either the daemon runs at info.
pub fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

pub async fn run_command(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    match cli.command {
        Commands::Run {
            listen,
            mitigation,
            output,
            label,
        } => cmd_run(config, listen, mitigation, output, label).await,
        Commands::Config { action } => cmd_config(config, action),
        Commands::Classify { file, threshold } => cmd_classify(file, threshold),
    }
}

async fn cmd_run(
    mut config: Config,
    listen: Option<String>,
    mitigation: bool,
    output: Option<PathBuf>,
    label: Option<String>,
) -> Result<()> {
    if let Some(listen) = listen {
        config.controller.listen_addr = listen;
    }
    if mitigation {
        config.mitigation.enabled = true;
    }
    if let Some(output) = output {
        config.output.dataset_path = output;
    }
    if let Some(label) = label {
        config.output.label = label;
    }

    let controller = Controller::new(config)?;
    tokio::select! {
        result = controller.run() => result?,
        _ = tokio::signal::ctrl_c() => {}
    }
    controller.shutdown().await;
    Ok(())
}

fn cmd_config(config: Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let text = toml::to_string_pretty(&config)?;
            println!("{text}");
            Ok(())
        }
        ConfigAction::Init { output } => {
            Config::default()
                .save(&output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("Wrote default configuration to {}", output.display());
            Ok(())
        }
    }
}

fn cmd_classify(file: PathBuf, threshold: f64) -> Result<()> {
    let summary = classify_file(&file, &ThresholdClassifier::new(threshold))?;
    println!(
        "{} flows, {} flagged ({} benign)",
        summary.total,
        summary.flagged,
        summary.total - summary.flagged
    );
    Ok(())
}
