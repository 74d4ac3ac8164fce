//! bidsmith engine library
//!
//! This library provides the curation engine behind the `bidsmith` binary.
//! It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;

/// Dataset layout and state detection
pub mod dataset;

/// Working-tree discovery of converted series
pub mod scanner;

/// Protocol translator persistence and merging
pub mod translator;

/// Fieldmap classification and grouping
pub mod fieldmap;

/// Run-number assignment
pub mod runs;

/// Intended-For resolution and pruning
pub mod linker;

/// Guarded, idempotent file placement
pub mod placement;

/// participants.tsv and sessions.tsv registries
pub mod registry;

/// External converter and archive unpacking
pub mod converter;

/// Scaffold and curation passes
pub mod curator;
