// bidsmith: translator-driven BIDS curation
// Main entry point for the bidsmith binary

use std::process::ExitCode;

use anyhow::Context;
use bidsmith_engine::cli::{Cli, Command};
use bidsmith_engine::config::Config;
use bidsmith_engine::dataset::DatasetLayout;
use bidsmith_engine::handlers::{
    apply_overrides, handle_curate, handle_run, handle_scaffold, handle_status, handle_unpack,
    CommandStatus, OutputFormat,
};
use bidsmith_engine::telemetry::init_telemetry_with_level;
use clap::Parser;
use sdk::errors::{CurateError, CurateErrorExt};

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(status) => status.exit_code(),
        Err(err) => {
            eprintln!("Error: {:#}", err);
            if let Some(curate_err) = err.downcast_ref::<CurateError>() {
                eprintln!("Hint: {}", curate_err.user_hint());
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<CommandStatus> {
    let layout = DatasetLayout::open(&cli.dataset).context("Failed to open dataset")?;

    // Load configuration (or use custom path if provided)
    let mut config = match &cli.config {
        Some(config_path) => Config::load_from_path(config_path)?,
        None => Config::load_for_dataset(layout.root())?,
    };

    // --log wins over the config file; RUST_LOG wins over both
    let log_level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with_level(log_level);

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");

    tracing::info!("bidsmith v{} ({} - {})", version, commit, timestamp);
    tracing::debug!("Dataset root: {}", layout.root().display());

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    match cli.command {
        Command::Run {
            selection,
            auto,
            unpack,
            no_convert,
        } => {
            apply_overrides(&mut config, &selection, auto);
            handle_run(&layout, &config, &selection, unpack, no_convert, format)
        }

        Command::Scaffold {
            selection,
            auto,
            no_convert,
        } => {
            tracing::info!("Running scaffold pass...");
            apply_overrides(&mut config, &selection, auto);
            handle_scaffold(&layout, &config, &selection, no_convert, format)
        }

        Command::Curate {
            selection,
            no_convert,
        } => {
            tracing::info!("Running curation pass...");
            apply_overrides(&mut config, &selection, false);
            handle_curate(&layout, &config, &selection, no_convert, format)
        }

        Command::Status => handle_status(&layout, format),

        Command::Unpack => {
            tracing::info!("Unpacking archives...");
            handle_unpack(&layout, format)
        }
    }
}
