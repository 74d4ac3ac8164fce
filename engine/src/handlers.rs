//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - run: pick the pass the dataset is ready for
//! - scaffold: convert and merge protocols into the translator
//! - curate: place converted series into the BIDS tree
//! - status: dataset state and translator coverage
//! - unpack: extract archive exports into sourcedata/

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::process::ExitCode;

use crate::cli::Selection;
use crate::config::Config;
use crate::converter::{unpack_archives, ConversionReport, ConverterVersion, Dcm2niix, ToolRunner};
use crate::curator::{CurationSummary, Curator, ScaffoldReport};
use crate::dataset::{DatasetLayout, DatasetState};
use crate::registry::Registry;
use crate::scanner::Scanner;
use crate::translator::Translator;
use sdk::errors::{CurateError, CurateErrorExt};

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Whether every selected subject/session made it through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Complete,
    Incomplete,
}

impl CommandStatus {
    pub fn exit_code(self) -> ExitCode {
        match self {
            Self::Complete => ExitCode::SUCCESS,
            Self::Incomplete => ExitCode::FAILURE,
        }
    }

    fn from_success(success: bool) -> Self {
        if success {
            Self::Complete
        } else {
            Self::Incomplete
        }
    }
}

/// Fold command-line switches into the loaded configuration.
pub fn apply_overrides(config: &mut Config, selection: &Selection, auto: bool) {
    if selection.no_sessions {
        config.curation.use_sessions = false;
    }
    if auto {
        config.curation.auto_translate = true;
    }
}

fn build_converter(config: &Config) -> Result<Dcm2niix> {
    let minimum = ConverterVersion::parse(&config.converter.min_version)
        .context("Invalid converter min_version")?;
    Ok(Dcm2niix::new(
        config.converter.program.clone(),
        config.curation.compression.clone(),
        config.converter.anonymize,
    )
    .with_minimum_version(minimum))
}

fn emit(format: OutputFormat, value: &Value, text: impl FnOnce()) -> Result<()> {
    match format {
        OutputFormat::Text => text(),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

/// Convert new sessions unless disabled.
fn convert_step(
    curator: &Curator<'_>,
    config: &Config,
    selection: &Selection,
    no_convert: bool,
) -> Result<Option<ConversionReport>> {
    if no_convert {
        return Ok(None);
    }
    let converter = build_converter(config)?;
    let report = curator
        .convert(&converter, selection.subjects())
        .context("Conversion failed")?;
    Ok(Some(report))
}

/// Run whichever pass the dataset is ready for
///
/// A dataset without a translator gets pass 1. Otherwise new raw sessions
/// are converted, any new protocols are merged into the translator, and
/// pass 2 runs.
pub fn handle_run(
    layout: &DatasetLayout,
    config: &Config,
    selection: &Selection,
    unpack: bool,
    no_convert: bool,
    format: OutputFormat,
) -> Result<CommandStatus> {
    let mut output = serde_json::Map::new();

    if unpack {
        let report = unpack_archives(layout, &ToolRunner::new()).context("Unpacking failed")?;
        if let OutputFormat::Text = format {
            println!(
                "Unpacked {} archive(s), {} subject(s)",
                report.archives.len(),
                report.subjects.len()
            );
        }
        output.insert("unpacked_subjects".to_string(), json!(report.subjects));
    }

    let state = DatasetState::detect(layout).context("Failed to read dataset state")?;
    tracing::info!("Dataset state: {}", state);
    output.insert("state".to_string(), json!(state.as_str()));

    let curator = Curator::new(layout, config)?;
    let conversion = convert_step(&curator, config, selection, no_convert)?;
    let converted_ok = conversion.as_ref().map_or(true, |c| c.failed.is_empty());
    if let Some(report) = &conversion {
        output.insert("conversion".to_string(), conversion_json(report));
        if let OutputFormat::Text = format {
            print_conversion(report);
        }
    }

    if !state.can_curate() {
        let report = curator
            .scaffold(config.curation.auto_translate)
            .context("Scaffold pass failed")?;
        output.insert("scaffold".to_string(), scaffold_json(&report));
        emit(format, &Value::Object(output), || {
            print_scaffold(&report, layout);
        })?;
        return Ok(CommandStatus::from_success(converted_ok));
    }

    match curator.scaffold(config.curation.auto_translate) {
        Ok(report) => {
            if report.merge.changed() {
                if let OutputFormat::Text = format {
                    println!(
                        "{} new protocol(s) added to the translator; they are skipped until edited",
                        report.merge.added.len() + report.merge.auto_filled.len()
                    );
                }
            }
            output.insert("scaffold".to_string(), scaffold_json(&report));
        }
        Err(CurateError::NotConverted(_)) => {}
        Err(e) => return Err(e).context("Translator update failed"),
    }

    let summary = curator
        .curate(selection.subjects())
        .context("Curation pass failed")?;
    output.insert("curation".to_string(), curation_json(&summary));
    emit(format, &Value::Object(output), || print_curation(&summary))?;

    Ok(CommandStatus::from_success(converted_ok && summary.is_success()))
}

/// Pass 1
pub fn handle_scaffold(
    layout: &DatasetLayout,
    config: &Config,
    selection: &Selection,
    no_convert: bool,
    format: OutputFormat,
) -> Result<CommandStatus> {
    let curator = Curator::new(layout, config)?;
    let conversion = convert_step(&curator, config, selection, no_convert)?;
    if let (OutputFormat::Text, Some(report)) = (format, &conversion) {
        print_conversion(report);
    }

    let report = curator
        .scaffold(config.curation.auto_translate)
        .context("Scaffold pass failed")?;

    let value = json!({
        "conversion": conversion.as_ref().map(conversion_json),
        "scaffold": scaffold_json(&report),
    });
    emit(format, &value, || print_scaffold(&report, layout))?;

    let converted_ok = conversion.as_ref().map_or(true, |c| c.failed.is_empty());
    Ok(CommandStatus::from_success(converted_ok))
}

/// Pass 2
pub fn handle_curate(
    layout: &DatasetLayout,
    config: &Config,
    selection: &Selection,
    no_convert: bool,
    format: OutputFormat,
) -> Result<CommandStatus> {
    let curator = Curator::new(layout, config)?;
    let conversion = convert_step(&curator, config, selection, no_convert)?;
    if let (OutputFormat::Text, Some(report)) = (format, &conversion) {
        print_conversion(report);
    }

    let summary = curator
        .curate(selection.subjects())
        .context("Curation pass failed")?;

    let value = json!({
        "conversion": conversion.as_ref().map(conversion_json),
        "curation": curation_json(&summary),
    });
    emit(format, &value, || print_curation(&summary))?;

    let converted_ok = conversion.as_ref().map_or(true, |c| c.failed.is_empty());
    Ok(CommandStatus::from_success(converted_ok && summary.is_success()))
}

/// Show dataset state, translator coverage and registered subjects
pub fn handle_status(layout: &DatasetLayout, format: OutputFormat) -> Result<CommandStatus> {
    let state = DatasetState::detect(layout).context("Failed to read dataset state")?;
    let translator =
        Translator::load(&layout.translator_path()).context("Failed to load translator")?;
    let coverage = translator.coverage();
    let subjects = Registry::new(layout)
        .subjects()
        .context("Failed to read participants.tsv")?;
    let work_sessions = Scanner::new(layout.work())
        .sessions(None)
        .context("Failed to scan work/")?;

    let value = json!({
        "dataset": layout.root(),
        "state": state.as_str(),
        "translator": {
            "protocols": coverage.total,
            "excluded": coverage.excluded,
            "placeholders": coverage.placeholders,
            "fieldmaps": coverage.fieldmaps,
        },
        "converted_sessions": work_sessions.len(),
        "subjects": subjects,
        "build": {
            "version": env!("CARGO_PKG_VERSION"),
            "commit": env!("GIT_COMMIT_HASH"),
        },
    });

    emit(format, &value, || {
        println!("Dataset: {}", layout.root().display());
        println!("  State:              {}", state);
        println!("  Converted sessions: {}", work_sessions.len());
        println!(
            "  Translator:         {} protocol(s), {} excluded, {} placeholder(s), {} fieldmap(s)",
            coverage.total, coverage.excluded, coverage.placeholders, coverage.fieldmaps
        );
        if subjects.is_empty() {
            println!("  Subjects:           none curated yet");
        } else {
            println!("  Subjects:           {}", subjects.join(", "));
        }
        if coverage.placeholders > 0 {
            println!();
            println!(
                "{} protocol(s) still carry the placeholder; edit {} before curating",
                coverage.placeholders,
                layout.translator_path().display()
            );
        }
    })?;

    Ok(CommandStatus::Complete)
}

/// Unpack archive exports into sourcedata/
pub fn handle_unpack(layout: &DatasetLayout, format: OutputFormat) -> Result<CommandStatus> {
    let report = unpack_archives(layout, &ToolRunner::new()).context("Unpacking failed")?;

    let value = json!({
        "archives": report.archives,
        "subjects": report.subjects,
        "zips": report.zips,
    });
    emit(format, &value, || {
        for archive in &report.archives {
            println!("Unpacked {}", archive.display());
        }
        println!(
            "{} subject(s) moved into sourcedata/, {} session archive(s) extracted",
            report.subjects.len(),
            report.zips.len()
        );
    })?;

    Ok(CommandStatus::Complete)
}

fn conversion_json(report: &ConversionReport) -> Value {
    json!({
        "converted": report.converted.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
        "skipped": report.skipped.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
        "failed": report
            .failed
            .iter()
            .map(|(label, e)| json!({"session": label, "error": e.to_string(), "hint": e.user_hint()}))
            .collect::<Vec<_>>(),
    })
}

fn print_conversion(report: &ConversionReport) {
    if !report.converted.is_empty() {
        println!("Converted {} session(s)", report.converted.len());
    }
    for (label, e) in &report.failed {
        println!("  FAILED {}: {}", label, e);
        println!("    Hint: {}", e.user_hint());
    }
}

fn scaffold_json(report: &ScaffoldReport) -> Value {
    json!({
        "created": report.created,
        "added": report.merge.added,
        "auto_filled": report.merge.auto_filled,
        "existing": report.merge.existing,
        "translator_written": report.translator_written,
        "config_written": report.config_written,
        "placeholders": report.coverage.placeholders,
    })
}

fn print_scaffold(report: &ScaffoldReport, layout: &DatasetLayout) {
    for path in &report.created {
        println!("Created {}", path.display());
    }
    for protocol in &report.merge.added {
        println!("  + {}", protocol);
    }
    for protocol in &report.merge.auto_filled {
        println!("  + {} (auto)", protocol);
    }
    println!(
        "Translator: {} new, {} auto-filled, {} already present",
        report.merge.added.len(),
        report.merge.auto_filled.len(),
        report.merge.existing
    );
    if report.coverage.placeholders > 0 {
        println!();
        println!(
            "Edit {} to assign directories and names, then run the curation pass",
            layout.translator_path().display()
        );
    }
}

fn curation_json(summary: &CurationSummary) -> Value {
    json!({
        "sessions": summary
            .sessions
            .iter()
            .map(|s| json!({
                "session": s.key.as_ref().map(|k| k.to_string()),
                "placed": s.placed,
                "unchanged": s.unchanged,
                "excluded": s.excluded,
                "warnings": s.warnings,
                "flagged": s.flagged,
                "up_to_date": s.is_up_to_date(),
            }))
            .collect::<Vec<_>>(),
        "failed": summary
            .failed
            .iter()
            .map(|(key, e)| json!({"session": key.to_string(), "error": e.to_string(), "hint": e.user_hint()}))
            .collect::<Vec<_>>(),
        "pruned": summary.pruned,
        "cleaned": summary.cleaned,
    })
}

fn print_curation(summary: &CurationSummary) {
    for session in &summary.sessions {
        let label = session
            .key
            .as_ref()
            .map(|k| k.to_string())
            .unwrap_or_default();
        if session.is_up_to_date() {
            println!("{}: up to date ({} file(s))", label, session.unchanged);
        } else {
            println!(
                "{}: {} placed, {} unchanged, {} excluded, {} warning(s)",
                label,
                session.placed.len(),
                session.unchanged,
                session.excluded.len(),
                session.warnings.len()
            );
        }
        for note in &session.flagged {
            println!("  REVIEW {}", note);
        }
    }

    for path in &summary.pruned {
        println!("Pruned stale Intended-For links in {}", path.display());
    }

    println!();
    println!(
        "{} session(s) curated, {} file(s) written, {} warning(s)",
        summary.sessions.len(),
        summary.files_placed(),
        summary.warning_count()
    );
    if !summary.failed.is_empty() {
        println!("{} session(s) failed:", summary.failed.len());
        for (key, e) in &summary.failed {
            println!("  {}: {}", key, e);
            println!("    Hint: {}", e.user_hint());
        }
    }
}
