//! Two-pass curation
//!
//! Pass 1 ([`Curator::scaffold`]) discovers protocol identities in the working
//! tree and merges them into the translator. Pass 2 ([`Curator::curate`])
//! plans the final name of every series of every session (translator stub,
//! optional keys, fieldmap role, run number), resolves Intended-For links and
//! places images and sidecars. Both passes are re-runnable: files already in
//! place are left untouched, and a failing session does not stop the others.

use crate::config::{Config, KeysConfig};
use crate::converter::convert_sessions;
use crate::converter::Converter;
use crate::dataset::{DatasetLayout, SessionKey};
use crate::fieldmap::{group_fieldmaps, EchoTimes, FieldmapRole, FieldmapVerdict};
use crate::linker::{
    apply_intended_for, bind_nearest, prune_intended_for, FieldmapKind, LinkCatalog,
    TimedFieldmap, TimedTarget,
};
use crate::placement::{place_file, write_if_missing, write_sidecar, PlaceOutcome, PlacementGuard};
use crate::registry::{Demographics, Registry};
use crate::runs::{ExistingRuns, RunAssigner, RunRequest};
use crate::scanner::{ConvertedSeries, Scanner};
use crate::translator::{AutoTranslator, Coverage, MergeReport, Translator};
use sdk::entities::{CanonicalName, Stub};
use sdk::errors::{CurateError, CurateErrorExt};
use sdk::translator::{TranslatorEntry, FIELDMAP_DIRECTORY};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

/// Header of the events template created next to each bold series.
pub const EVENTS_TEMPLATE: &str = "onset\tduration\ttrial_type\tresponse_time\n";

const DWI_COMPANIONS: &[&str] = &[".bval", ".bvec"];

/// Result of pass 1.
#[derive(Debug, Default)]
pub struct ScaffoldReport {
    /// Directories and descriptor files that were missing and got created
    pub created: Vec<PathBuf>,
    pub merge: MergeReport,
    pub translator_written: bool,
    pub config_written: bool,
    pub coverage: Coverage,
}

/// What pass 2 did for one subject/session.
#[derive(Debug, Default)]
pub struct SessionReport {
    pub key: Option<SessionKey>,
    /// Files created or updated
    pub placed: Vec<PathBuf>,
    /// Files already in place with identical content
    pub unchanged: usize,
    /// Protocols excluded by the translator
    pub excluded: Vec<String>,
    pub warnings: Vec<String>,
    /// Fieldmaps placed under a neutral name for manual review
    pub flagged: Vec<String>,
    pub registered: bool,
}

impl SessionReport {
    fn new(key: &SessionKey) -> Self {
        Self {
            key: Some(key.clone()),
            ..Self::default()
        }
    }

    /// Nothing was written for this session.
    pub fn is_up_to_date(&self) -> bool {
        self.placed.is_empty() && !self.registered
    }

    fn warn(&mut self, message: String) {
        tracing::warn!("{}", message);
        self.warnings.push(message);
    }

    fn record(&mut self, outcome: PlaceOutcome, path: PathBuf) {
        if outcome.wrote() {
            tracing::debug!("{:?} {}", outcome, path.display());
            self.placed.push(path);
        } else {
            self.unchanged += 1;
        }
    }
}

/// Result of pass 2 over all selected sessions.
#[derive(Debug, Default)]
pub struct CurationSummary {
    pub sessions: Vec<SessionReport>,
    /// Sessions that did not reach the curated state, with the error
    pub failed: Vec<(SessionKey, CurateError)>,
    /// Sidecars whose stale Intended-For entries were removed
    pub pruned: Vec<PathBuf>,
    pub cleaned: Vec<PathBuf>,
}

impl CurationSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn files_placed(&self) -> usize {
        self.sessions.iter().map(|s| s.placed.len()).sum()
    }

    pub fn warning_count(&self) -> usize {
        self.sessions.iter().map(|s| s.warnings.len()).sum()
    }
}

/// One series with its planned output.
struct PlannedSeries<'s> {
    series: &'s ConvertedSeries,
    entry: &'s TranslatorEntry,
    stub: Stub,
    verdict: Option<FieldmapVerdict>,
    echo_times: Option<EchoTimes>,
    name: Option<CanonicalName>,
}

impl PlannedSeries<'_> {
    fn directory(&self) -> &str {
        self.entry.directory()
    }

    fn is_linkable_fieldmap(&self) -> bool {
        self.verdict.as_ref().is_some_and(FieldmapVerdict::is_linkable)
    }
}

/// Drives both passes over one dataset.
pub struct Curator<'a> {
    layout: &'a DatasetLayout,
    config: &'a Config,
    guard: PlacementGuard,
    scanner: Scanner,
}

impl<'a> Curator<'a> {
    pub fn new(layout: &'a DatasetLayout, config: &'a Config) -> Result<Self, CurateError> {
        Ok(Self {
            layout,
            config,
            guard: PlacementGuard::new(layout.root())?,
            scanner: Scanner::new(layout.work()),
        })
    }

    /// Convert raw sessions that have no working output yet.
    pub fn convert(
        &self,
        converter: &dyn Converter,
        subjects: Option<&[String]>,
    ) -> Result<crate::converter::ConversionReport, CurateError> {
        convert_sessions(
            self.layout,
            converter,
            self.config.curation.use_sessions,
            subjects,
        )
    }

    /// Pass 1: scaffold the dataset and merge discovered protocols into the translator.
    ///
    /// # Errors
    ///
    /// `CurateError::NotConverted` when the working tree has no sessions, and
    /// any translator decode error, both before anything is written.
    pub fn scaffold(&self, auto: bool) -> Result<ScaffoldReport, CurateError> {
        let translator_path = self.layout.translator_path();
        let mut translator = Translator::load(&translator_path)?;

        if self.scanner.sessions(None)?.is_empty() {
            return Err(CurateError::NotConverted(self.layout.work()));
        }

        let auto = if auto {
            Some(AutoTranslator::new().map_err(|e| CurateError::Config(e.to_string()))?)
        } else {
            None
        };

        let mut report = ScaffoldReport {
            created: self.layout.ensure_scaffold()?,
            ..ScaffoldReport::default()
        };
        report.config_written =
            Config::write_default_if_missing(&Config::default_config_path(self.layout.root()))?;

        report.merge = translator.merge(self.scanner.protocols(), auto.as_ref());
        report.translator_written = translator.save(&translator_path)?;
        report.coverage = translator.coverage();

        tracing::info!(
            "Translator has {} protocols ({} new, {} auto-filled)",
            translator.len(),
            report.merge.added.len(),
            report.merge.auto_filled.len()
        );
        Ok(report)
    }

    /// Pass 2: curate every selected session of the working tree.
    ///
    /// # Errors
    ///
    /// Only errors that affect the whole dataset are returned (missing or
    /// malformed translator, unreadable working tree). Session failures are
    /// collected in the summary.
    pub fn curate(&self, subjects: Option<&[String]>) -> Result<CurationSummary, CurateError> {
        let translator_path = self.layout.translator_path();
        if !translator_path.is_file() {
            return Err(CurateError::TranslatorMissing(translator_path));
        }
        let translator = Translator::load(&translator_path)?;
        self.layout.ensure_scaffold()?;

        let mut summary = CurationSummary::default();
        let mut subjects_seen = BTreeSet::new();

        for key in self.scanner.sessions(subjects)? {
            tracing::info!("Curating {}", key);
            subjects_seen.insert(key.subject.clone());

            match self.curate_session(&translator, &key) {
                Ok(report) => {
                    if report.is_up_to_date() {
                        tracing::info!("{} is up to date", key);
                    }
                    summary.sessions.push(report);
                }
                Err(e) if e.is_recoverable() => {
                    tracing::error!("Curation of {} failed: {} ({})", key, e, e.user_hint());
                    summary.failed.push((key, e));
                }
                Err(e) => return Err(e),
            }
        }

        if self.config.curation.prune_intended_for {
            for subject in &subjects_seen {
                let subject_dir = self.layout.subject_dir(subject);
                match prune_intended_for(&self.guard, &subject_dir) {
                    Ok(pruned) => summary.pruned.extend(pruned),
                    Err(e) => tracing::warn!("Could not prune {}: {}", subject_dir.display(), e),
                }
            }
        }

        if self.config.curation.clean_work_dir && summary.is_success() {
            for report in &summary.sessions {
                let Some(key) = &report.key else { continue };
                let dir = self.layout.work_session_dir(key);
                if dir.is_dir() {
                    fs::remove_dir_all(&dir)?;
                    tracing::info!("Removed working directory {}", dir.display());
                    summary.cleaned.push(dir);
                }
            }
        }

        Ok(summary)
    }

    fn curate_session(
        &self,
        translator: &Translator,
        key: &SessionKey,
    ) -> Result<SessionReport, CurateError> {
        let mut report = SessionReport::new(key);
        let scan = self.scanner.load_session(key)?;
        report.warnings.extend(scan.warnings.iter().cloned());

        let mut plan = self.plan_series(translator, &scan.series, &mut report);
        self.resolve_fieldmaps(&mut plan, &mut report);

        let session_dir = self.layout.session_dir(key);
        self.assign_runs(key, &session_dir, &mut plan, &mut report)?;
        let links = self.resolve_links(key, &session_dir, &plan, &mut report)?;

        for (idx, item) in plan.iter().enumerate() {
            let Some(name) = &item.name else { continue };
            match self.place_series(item, name, links.get(&idx), &session_dir, &mut report) {
                Ok(()) => {}
                Err(CurateError::NameCollision(message)) => {
                    report.warn(format!("{}; series left in the working tree", message));
                }
                Err(e) => return Err(e),
            }
        }

        let planned_any = plan.iter().any(|item| item.name.is_some());
        let representative = scan.series.iter().find(|s| s.sidecar.is_some());
        if let (true, Some(first)) = (planned_any, representative) {
            let registry = Registry::new(self.layout);
            let demographics = Demographics::from_metadata(first.metadata.fields());
            let subject_added = registry.register_subject(&key.subject, &demographics)?;
            let session_added = registry.register_session(key, acquisition_stamp(first).as_deref())?;
            report.registered = subject_added || session_added;
        }

        Ok(report)
    }

    /// Look up each series in the translator and build its stub.
    fn plan_series<'s>(
        &self,
        translator: &'s Translator,
        series: &'s [ConvertedSeries],
        report: &mut SessionReport,
    ) -> Vec<PlannedSeries<'s>> {
        let mut plan = Vec::new();

        for s in series {
            let Some(entry) = translator.get(&s.protocol) else {
                report.warn(format!(
                    "protocol '{}' is not in the translator; run the scaffold pass",
                    s.protocol
                ));
                continue;
            };
            if entry.is_excluded() {
                tracing::debug!("Excluding protocol '{}'", s.protocol);
                report.excluded.push(s.protocol.clone());
                continue;
            }
            if s.sidecar.is_none() {
                report.warn(format!(
                    "{}: no JSON sidecar, series skipped",
                    s.image.display()
                ));
                continue;
            }
            let Some(mut stub) = entry.stub() else {
                continue;
            };
            if entry.directory() != FIELDMAP_DIRECTORY {
                apply_keys(&mut stub, s, &self.config.keys);
            }
            plan.push(PlannedSeries {
                series: s,
                entry,
                stub,
                verdict: None,
                echo_times: None,
                name: None,
            });
        }

        plan
    }

    /// Classify fieldmaps, rename them by role and collect echo times.
    fn resolve_fieldmaps(&self, plan: &mut [PlannedSeries<'_>], report: &mut SessionReport) {
        let fieldmaps: Vec<&ConvertedSeries> = plan
            .iter()
            .filter(|p| p.directory() == FIELDMAP_DIRECTORY)
            .map(|p| p.series)
            .collect();
        if fieldmaps.is_empty() {
            return;
        }

        let mut verdicts: HashMap<usize, FieldmapVerdict> = HashMap::new();
        let mut echo_times: HashMap<usize, EchoTimes> = HashMap::new();
        for group in group_fieldmaps(&fieldmaps) {
            match group.echo_times() {
                Ok(Some(times)) => {
                    if let Some(phase) = group.authoritative(FieldmapRole::PhaseDifference) {
                        echo_times.insert(phase.ordinal, times);
                    }
                }
                Ok(None) => {}
                Err(warning) => report.warn(warning),
            }
            for verdict in group.members {
                if let Some(note) = verdict.review_note(&group.protocol) {
                    tracing::warn!("{}", note);
                    report.flagged.push(note);
                }
                verdicts.insert(verdict.ordinal, verdict);
            }
        }

        for item in plan.iter_mut() {
            if let Some(verdict) = verdicts.remove(&item.series.ordinal) {
                item.stub = verdict.stub(&item.stub);
                item.echo_times = echo_times.remove(&item.series.ordinal);
                item.verdict = Some(verdict);
            }
        }
    }

    fn assign_runs(
        &self,
        key: &SessionKey,
        session_dir: &Path,
        plan: &mut [PlannedSeries<'_>],
        report: &mut SessionReport,
    ) -> Result<(), CurateError> {
        let existing = ExistingRuns::scan(session_dir)?;
        let requests: Vec<RunRequest> = plan
            .iter()
            .map(|item| RunRequest {
                ordinal: item.series.ordinal,
                directory: item.directory().to_string(),
                name: CanonicalName::new(key.subject.clone(), key.session.clone(), item.stub.clone()),
                image: item.series.image.clone(),
            })
            .collect();

        let assignments = RunAssigner::new(&existing).assign(&requests);
        for (item, assignment) in plan.iter_mut().zip(assignments) {
            match assignment {
                Ok(assignment) => item.name = Some(assignment.name),
                Err(e) => report.warn(format!("{} ({} skipped)", e, item.series.image.display())),
            }
        }
        Ok(())
    }

    /// Intended-For paths per plan index, for linkable fieldmaps only.
    fn resolve_links(
        &self,
        key: &SessionKey,
        session_dir: &Path,
        plan: &[PlannedSeries<'_>],
        report: &mut SessionReport,
    ) -> Result<HashMap<usize, Vec<String>>, CurateError> {
        let mut links = HashMap::new();
        if !plan.iter().any(PlannedSeries::is_linkable_fieldmap) {
            return Ok(links);
        }

        let mut catalog = LinkCatalog::new(key.clone());
        catalog.add_existing(session_dir)?;
        for item in plan {
            if let Some(name) = &item.name {
                catalog.add(item.directory(), name.clone(), &item.series.extension);
            }
        }

        for (idx, item) in plan.iter().enumerate() {
            if !item.is_linkable_fieldmap() || item.name.is_none() {
                continue;
            }
            let targets = item.entry.intended_for().targets();
            if targets.is_empty() {
                continue;
            }
            let resolution = catalog.resolve(targets);
            for target in &resolution.unresolved {
                report.warn(format!(
                    "{}: Intended-For target '{}' not found in {}",
                    item.series.protocol, target, key
                ));
            }
            links.insert(idx, resolution.paths);
        }

        if self.config.curation.bind_fieldmaps {
            links.extend(self.bind_by_time(plan, report));
        }
        Ok(links)
    }

    /// Nearest-in-time binding of bold series to fieldmaps.
    fn bind_by_time(
        &self,
        plan: &[PlannedSeries<'_>],
        report: &mut SessionReport,
    ) -> BTreeMap<usize, Vec<String>> {
        let mut targets = Vec::new();
        let mut fieldmaps = Vec::new();

        for (idx, item) in plan.iter().enumerate() {
            let Some(name) = &item.name else { continue };
            let time = item.series.metadata.acquisition_time();

            if item.directory() == "func" && name.stub().suffix() == Some("bold") {
                let candidate = crate::linker::LinkCandidate {
                    directory: item.directory().to_string(),
                    name: name.clone(),
                    extension: item.series.extension.clone(),
                };
                match time {
                    Some(time) => targets.push(TimedTarget {
                        relative_path: candidate.relative_path(),
                        time,
                    }),
                    None => report.warn(format!(
                        "{}: no AcquisitionTime, not bound to a fieldmap",
                        candidate.relative_path()
                    )),
                }
                continue;
            }

            let Some(verdict) = item.verdict.as_ref().filter(|v| v.is_linkable()) else {
                continue;
            };
            let kind = match verdict.role {
                FieldmapRole::DirectionAP | FieldmapRole::DirectionPA => FieldmapKind::Epi(
                    name.stub()
                        .entity("dir")
                        .or(verdict.role.direction())
                        .unwrap_or_default()
                        .to_string(),
                ),
                FieldmapRole::Magnitude1
                | FieldmapRole::Magnitude2
                | FieldmapRole::PhaseDifference
                | FieldmapRole::Phase1
                | FieldmapRole::Phase2 => FieldmapKind::Gre,
                FieldmapRole::NotAFieldmap => continue,
            };
            if let Some(time) = time {
                fieldmaps.push(TimedFieldmap { id: idx, kind, time });
            }
        }

        bind_nearest(&targets, &fieldmaps)
    }

    fn place_series(
        &self,
        item: &PlannedSeries<'_>,
        name: &CanonicalName,
        links: Option<&Vec<String>>,
        session_dir: &Path,
        report: &mut SessionReport,
    ) -> Result<(), CurateError> {
        let dir = session_dir.join(item.directory());
        let base = name.to_string();
        let image_dest = dir.join(format!("{}{}", base, item.series.extension));

        let outcome = place_file(&self.guard, &item.series.image, &image_dest)?;
        report.record(outcome, image_dest);

        let mut sidecar = item.series.metadata.fields().clone();
        match item.directory() {
            "func" if name.stub().suffix() == Some("bold") => {
                let task = name.stub().entity("task").unwrap_or("unknown");
                sidecar.insert("TaskName".to_string(), Value::String(task.to_string()));

                if self.config.curation.events_templates {
                    let events_name = CanonicalName::new(
                        name.subject(),
                        name.session().map(str::to_string),
                        name.stub().clone().with_suffix("events"),
                    );
                    let events = dir.join(format!("{}.tsv", events_name));
                    let outcome = write_if_missing(&self.guard, &events, EVENTS_TEMPLATE.as_bytes())?;
                    report.record(outcome, events);
                }
            }
            "dwi" => {
                for ext in DWI_COMPANIONS {
                    match item.series.companion(ext) {
                        Some(source) => {
                            let dest = dir.join(format!("{}{}", base, ext));
                            let outcome = place_file(&self.guard, &source, &dest)?;
                            report.record(outcome, dest);
                        }
                        None => report.warn(format!(
                            "{}: no {} companion",
                            item.series.image.display(),
                            ext
                        )),
                    }
                }
            }
            FIELDMAP_DIRECTORY => {
                if let Some(paths) = links {
                    apply_intended_for(&mut sidecar, paths);
                }
                if let Some(times) = item.echo_times {
                    sidecar.insert("EchoTime1".to_string(), times.echo_time1.into());
                    sidecar.insert("EchoTime2".to_string(), times.echo_time2.into());
                }
            }
            _ => {}
        }

        let sidecar_dest = dir.join(format!("{}.json", base));
        let outcome = write_sidecar(&self.guard, &sidecar_dest, &Value::Object(sidecar))?;
        report.record(outcome, sidecar_dest);
        Ok(())
    }
}

/// Add the optional `echo-`, `part-` and `rec-` entities. Entities already in
/// the translator stub win.
fn apply_keys(stub: &mut Stub, series: &ConvertedSeries, keys: &KeysConfig) {
    if keys.echo && stub.entity("echo").is_none() {
        if let Some(echo) = series.metadata.echo_number() {
            stub.set("echo", &echo.to_string());
        }
    }
    if keys.part && stub.entity("part").is_none() {
        let part = if series.file_name.is_phase_recon() {
            "phase"
        } else {
            "mag"
        };
        stub.set("part", part);
    }
    if keys.recon && stub.entity("rec").is_none() {
        let rec = if series.metadata.image_type().iter().any(|t| t == "NORM") {
            "norm"
        } else {
            "bias"
        };
        stub.set("rec", rec);
    }
}

/// `acq_time` for the sessions file: `<AcquisitionDate>T<AcquisitionTime>`.
fn acquisition_stamp(series: &ConvertedSeries) -> Option<String> {
    let date = series.metadata.acquisition_date()?;
    let time = series
        .metadata
        .fields()
        .get("AcquisitionTime")
        .and_then(Value::as_str)?;
    Some(format!("{}T{}", date, time))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::SeriesMetadata;
    use serde_json::json;

    fn series(stem: &str, meta: Value) -> ConvertedSeries {
        let Value::Object(fields) = meta else {
            panic!("metadata must be an object")
        };
        ConvertedSeries::from_parts(
            SessionKey::new("S1", None),
            PathBuf::from(format!("/work/sub-S1/{}.nii.gz", stem)),
            Some(PathBuf::from(format!("/work/sub-S1/{}.json", stem))),
            SeriesMetadata::new(fields),
        )
        .unwrap()
    }

    #[test]
    fn test_apply_keys() {
        let keys = KeysConfig {
            echo: true,
            part: true,
            recon: true,
        };
        let s = series(
            "S1--ME--GR--4_e2_ph",
            json!({"EchoNumber": 2, "ImageType": ["ORIGINAL", "PRIMARY", "P", "NORM"]}),
        );
        let mut stub = Stub::parse("task-rest_bold").unwrap();
        apply_keys(&mut stub, &s, &keys);
        assert_eq!(stub.to_string(), "task-rest_rec-norm_echo-2_part-phase_bold");

        let mut user = Stub::parse("echo-9_T2star").unwrap();
        apply_keys(&mut user, &s, &KeysConfig { echo: true, ..KeysConfig::default() });
        assert_eq!(user.to_string(), "echo-9_T2star");
    }

    #[test]
    fn test_keys_off_by_default() {
        let s = series("S1--ME--GR--4_e1", json!({"EchoNumber": 1}));
        let mut stub = Stub::parse("T1w").unwrap();
        apply_keys(&mut stub, &s, &KeysConfig::default());
        assert_eq!(stub.to_string(), "T1w");
    }

    #[test]
    fn test_acquisition_stamp() {
        let s = series(
            "S1--T1--GR--2",
            json!({"AcquisitionDate": "2024-03-01", "AcquisitionTime": "10:15:02.500000"}),
        );
        assert_eq!(
            acquisition_stamp(&s).as_deref(),
            Some("2024-03-01T10:15:02.500000")
        );
        assert!(acquisition_stamp(&series("S1--T1--GR--2", json!({}))).is_none());
    }
}
