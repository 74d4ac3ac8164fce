//! CLI interface for bidsmith
//!
//! This module provides the command-line interface using clap's derive API.
//! It defines all commands and global flags for curating a dataset.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Translator-driven BIDS curation
///
/// Converts raw sessions from sourcedata/, scaffolds an editable protocol
/// translator in code/, and curates the converted series into a BIDS tree.
#[derive(Parser, Debug)]
#[command(name = "bidsmith")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Dataset root directory
    #[arg(short, long, global = true, default_value = ".", value_name = "DIR")]
    pub dataset: PathBuf,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Which subjects and session layout to process
#[derive(Args, Debug, Clone, Default)]
pub struct Selection {
    /// Only process these subjects (space or comma separated)
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub subjects: Vec<String>,

    /// Treat each sourcedata/<subject> folder as a single session
    #[arg(long)]
    pub no_sessions: bool,
}

impl Selection {
    /// Subject filter, `None` meaning every subject.
    pub fn subjects(&self) -> Option<&[String]> {
        if self.subjects.is_empty() {
            None
        } else {
            Some(&self.subjects)
        }
    }
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run whichever pass the dataset is ready for
    Run {
        #[command(flatten)]
        selection: Selection,

        /// Fill new translator entries from protocol names
        #[arg(long)]
        auto: bool,

        /// Unpack flywheel_*.tar archives into sourcedata/ first
        #[arg(long)]
        unpack: bool,

        /// Do not run the converter; use what is already in work/
        #[arg(long)]
        no_convert: bool,
    },

    /// Pass 1: convert and merge discovered protocols into the translator
    Scaffold {
        #[command(flatten)]
        selection: Selection,

        /// Fill new translator entries from protocol names
        #[arg(long)]
        auto: bool,

        /// Do not run the converter; use what is already in work/
        #[arg(long)]
        no_convert: bool,
    },

    /// Pass 2: place converted series into the BIDS tree
    Curate {
        #[command(flatten)]
        selection: Selection,

        /// Do not run the converter; use what is already in work/
        #[arg(long)]
        no_convert: bool,
    },

    /// Show dataset state, translator coverage and registered subjects
    Status,

    /// Unpack flywheel_*.tar archives into sourcedata/
    Unpack,
}
