//! Run number assignment
//!
//! Series that resolve to the same directory and the same name without a run
//! entity are told apart by `run-NN`. Numbers follow acquisition order and are
//! stable across re-runs:
//!
//! 1. a series whose image already sits byte-identically under some run of its
//!    base keeps that run;
//! 2. remaining series get fresh numbers in acquisition order, starting at 1
//!    (or after the highest kept run) and skipping any number already taken on
//!    disk or earlier in this pass.
//!
//! Names that already carry a `run-` entity from the translator pass through.

use crate::placement::same_content;
use sdk::entities::{split_extension, CanonicalName, IMAGE_EXTENSIONS};
use sdk::errors::CurateError;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Identity shared by all runs of one acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BaseKey {
    pub directory: String,
    pub base: CanonicalName,
}

impl BaseKey {
    pub fn of(directory: &str, name: &CanonicalName) -> Self {
        Self {
            directory: directory.to_string(),
            base: name.base(),
        }
    }
}

/// Run-numbered images already present in a session directory.
#[derive(Debug, Default)]
pub struct ExistingRuns {
    runs: HashMap<BaseKey, BTreeMap<u32, PathBuf>>,
}

impl ExistingRuns {
    /// Index `<session_dir>/<datatype>/` images by base and run.
    pub fn scan(session_dir: &Path) -> Result<Self, CurateError> {
        let mut existing = Self::default();
        if !session_dir.is_dir() {
            return Ok(existing);
        }

        for entry in fs::read_dir(session_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(directory) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            for file in fs::read_dir(entry.path())? {
                let file = file?;
                let Some(name) = file.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                let (stem, extension) = split_extension(&name);
                if !IMAGE_EXTENSIONS.contains(&extension) {
                    continue;
                }
                let Some(canonical) = CanonicalName::parse(stem) else {
                    continue;
                };
                if let Some(run) = canonical.run() {
                    existing.insert(BaseKey::of(&directory, &canonical), run, file.path());
                }
            }
        }

        Ok(existing)
    }

    pub fn insert(&mut self, key: BaseKey, run: u32, image: PathBuf) {
        self.runs.entry(key).or_default().insert(run, image);
    }

    /// Runs on disk for one base, ascending.
    pub fn runs(&self, key: &BaseKey) -> impl Iterator<Item = (u32, &Path)> {
        self.runs
            .get(key)
            .into_iter()
            .flat_map(|runs| runs.iter().map(|(run, path)| (*run, path.as_path())))
    }

    fn is_occupied(&self, key: &BaseKey, run: u32) -> bool {
        self.runs.get(key).is_some_and(|runs| runs.contains_key(&run))
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

/// One series asking for a final name.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub ordinal: usize,
    pub directory: String,
    /// Planned name; a run entity here is kept as-is.
    pub name: CanonicalName,
    /// Converted image, compared against images already on disk.
    pub image: PathBuf,
}

/// Final name of one series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunAssignment {
    pub ordinal: usize,
    pub directory: String,
    pub name: CanonicalName,
    /// Whether the run was taken over from an identical image on disk.
    pub reused: bool,
}

/// Assigns run numbers for one session.
pub struct RunAssigner<'a> {
    existing: &'a ExistingRuns,
}

impl<'a> RunAssigner<'a> {
    pub fn new(existing: &'a ExistingRuns) -> Self {
        Self { existing }
    }

    /// Assign final names to every request.
    ///
    /// Results come back in request order. A request whose explicit run name is
    /// already claimed by an earlier request in the same pass gets a
    /// [`CurateError::NameCollision`].
    pub fn assign(&self, requests: &[RunRequest]) -> Vec<Result<RunAssignment, CurateError>> {
        let mut order: Vec<usize> = (0..requests.len()).collect();
        order.sort_by_key(|&i| requests[i].ordinal);

        let mut results: Vec<Option<Result<RunAssignment, CurateError>>> =
            (0..requests.len()).map(|_| None).collect();
        let mut claimed: HashMap<BaseKey, BTreeSet<u32>> = HashMap::new();
        let mut explicit_names: HashSet<(String, String)> = HashSet::new();

        // Explicit runs claim their numbers before anything is allocated
        for &i in &order {
            let request = &requests[i];
            let Some(run) = request.name.run() else {
                continue;
            };
            let full = (request.directory.clone(), request.name.to_string());
            if !explicit_names.insert(full) {
                results[i] = Some(Err(CurateError::NameCollision(format!(
                    "{}/{} is produced by more than one series",
                    request.directory, request.name
                ))));
                continue;
            }
            claimed
                .entry(BaseKey::of(&request.directory, &request.name))
                .or_default()
                .insert(run);
            results[i] = Some(Ok(RunAssignment {
                ordinal: request.ordinal,
                directory: request.directory.clone(),
                name: request.name.clone(),
                reused: false,
            }));
        }

        // Phase 1: keep runs whose placed image is identical
        let mut kept_max: HashMap<BaseKey, u32> = HashMap::new();
        for &i in &order {
            if results[i].is_some() {
                continue;
            }
            let request = &requests[i];
            let key = BaseKey::of(&request.directory, &request.name);
            let taken = claimed.entry(key.clone()).or_default();

            let reused = self.existing.runs(&key).find(|(run, path)| {
                !taken.contains(run) && same_content(&request.image, path).unwrap_or(false)
            });
            if let Some((run, _)) = reused {
                taken.insert(run);
                let max = kept_max.entry(key).or_insert(run);
                *max = (*max).max(run);
                results[i] = Some(Ok(RunAssignment {
                    ordinal: request.ordinal,
                    directory: request.directory.clone(),
                    name: request.name.with_run(run),
                    reused: true,
                }));
            }
        }

        // Phase 2: fresh numbers in acquisition order
        let mut counters: HashMap<BaseKey, u32> = HashMap::new();
        for &i in &order {
            if results[i].is_some() {
                continue;
            }
            let request = &requests[i];
            let key = BaseKey::of(&request.directory, &request.name);
            let start = kept_max.get(&key).map_or(1, |max| max + 1);
            let counter = counters.entry(key.clone()).or_insert(start);
            let taken = claimed.entry(key.clone()).or_default();

            while taken.contains(&*counter) || self.existing.is_occupied(&key, *counter) {
                *counter += 1;
            }
            let run = *counter;
            taken.insert(run);
            *counter += 1;

            tracing::debug!("{}/{} gets run {}", request.directory, request.name, run);
            results[i] = Some(Ok(RunAssignment {
                ordinal: request.ordinal,
                directory: request.directory.clone(),
                name: request.name.with_run(run),
                reused: false,
            }));
        }

        results.into_iter().flatten().collect()
    }
}
