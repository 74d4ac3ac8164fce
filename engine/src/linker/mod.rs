//! Intended-For linkage
//!
//! Resolves the target stubs named by a fieldmap's translator entry against
//! the final names of its subject/session, writes sidecar paths relative to
//! the subject directory, and prunes links to files that no longer exist.
//! [`bind_nearest`] is the acquisition-time alternative to translator targets.

use crate::dataset::{sorted_subdirs, SessionKey};
use crate::placement::{write_sidecar, PlaceOutcome, PlacementGuard};
use chrono::NaiveTime;
use sdk::entities::{split_extension, CanonicalName, Stub, IMAGE_EXTENSIONS};
use sdk::errors::CurateError;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Sidecar field holding the links.
pub const INTENDED_FOR_FIELD: &str = "IntendedFor";

/// Datatype assumed when a target has no `<datatype>/` prefix.
pub const DEFAULT_TARGET_DATATYPE: &str = "func";

/// One parsed Intended-For target (`task-rest_bold`, `dwi/dir-AP_dwi`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTarget {
    pub datatype: String,
    pub stub: Stub,
}

impl LinkTarget {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let (datatype, stub) = match raw.split_once('/') {
            Some((datatype, stub)) => (datatype, stub),
            None => (DEFAULT_TARGET_DATATYPE, raw),
        };
        Ok(Self {
            datatype: datatype.to_string(),
            stub: Stub::parse(stub)?,
        })
    }

    /// A candidate matches when it shares the datatype and suffix and carries
    /// every entity the target names. Entities the target leaves out (`run`,
    /// `echo`, `part`, ...) are not compared, so `task-rest_bold` matches every
    /// run and echo of that task.
    fn matches(&self, candidate: &LinkCandidate) -> bool {
        if candidate.directory != self.datatype {
            return false;
        }
        let stub = candidate.name.stub();
        stub.suffix() == self.stub.suffix()
            && self
                .stub
                .entities()
                .all(|(key, value)| stub.entity(key) == Some(value))
    }
}

/// A final image name that can be linked to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkCandidate {
    pub directory: String,
    pub name: CanonicalName,
    pub extension: String,
}

impl LinkCandidate {
    /// Path relative to the subject directory: `[ses-<ID>/]<datatype>/<file><ext>`.
    pub fn relative_path(&self) -> String {
        let mut path = String::new();
        if let Some(session) = self.name.session() {
            path.push_str(&format!("ses-{}/", session));
        }
        path.push_str(&format!("{}/{}{}", self.directory, self.name, self.extension));
        path
    }
}

/// Outcome of resolving one fieldmap's targets.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Sorted, de-duplicated relative paths
    pub paths: Vec<String>,
    pub unresolved: Vec<String>,
}

/// Final names of one subject/session, planned and already on disk.
#[derive(Debug)]
pub struct LinkCatalog {
    key: SessionKey,
    candidates: Vec<LinkCandidate>,
}

impl LinkCatalog {
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            candidates: Vec::new(),
        }
    }

    /// Add a name planned in this pass.
    pub fn add(&mut self, directory: &str, name: CanonicalName, extension: &str) {
        let candidate = LinkCandidate {
            directory: directory.to_string(),
            name,
            extension: extension.to_string(),
        };
        if !self.candidates.contains(&candidate) {
            self.candidates.push(candidate);
        }
    }

    /// Add every image already curated under `session_dir`.
    pub fn add_existing(&mut self, session_dir: &Path) -> Result<(), CurateError> {
        if !session_dir.is_dir() {
            return Ok(());
        }
        for directory in sorted_subdirs(session_dir)? {
            let mut names: Vec<String> = fs::read_dir(session_dir.join(&directory))?
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
                .collect();
            names.sort();
            for file in names {
                let (stem, extension) = split_extension(&file);
                if !IMAGE_EXTENSIONS.contains(&extension) {
                    continue;
                }
                if let Some(name) = CanonicalName::parse(stem) {
                    self.add(&directory, name, extension);
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Resolve targets to relative paths within this subject/session.
    pub fn resolve(&self, targets: &[String]) -> Resolution {
        let mut paths = BTreeSet::new();
        let mut unresolved = Vec::new();

        for raw in targets {
            let target = match LinkTarget::parse(raw) {
                Ok(target) => target,
                Err(e) => {
                    tracing::warn!("Ignoring Intended-For target '{}': {}", raw, e);
                    unresolved.push(raw.clone());
                    continue;
                }
            };

            let before = paths.len();
            for candidate in &self.candidates {
                if candidate.name.subject() == self.key.subject
                    && candidate.name.session() == self.key.session.as_deref()
                    && target.matches(candidate)
                {
                    paths.insert(candidate.relative_path());
                }
            }
            if paths.len() == before {
                unresolved.push(raw.clone());
            }
        }

        Resolution {
            paths: paths.into_iter().collect(),
            unresolved,
        }
    }
}

/// Set or drop the Intended-For field of a sidecar object.
pub fn apply_intended_for(sidecar: &mut serde_json::Map<String, Value>, paths: &[String]) {
    if paths.is_empty() {
        sidecar.remove(INTENDED_FOR_FIELD);
    } else {
        sidecar.insert(
            INTENDED_FOR_FIELD.to_string(),
            Value::Array(paths.iter().cloned().map(Value::String).collect()),
        );
    }
}

/// Drop Intended-For entries that point at missing files.
///
/// Looks at `fmap/*.json` directly under the subject directory and under each
/// `ses-*`. Returns the sidecars that were rewritten.
pub fn prune_intended_for(
    guard: &PlacementGuard,
    subject_dir: &Path,
) -> Result<Vec<PathBuf>, CurateError> {
    let mut fmap_dirs = vec![subject_dir.join("fmap")];
    if subject_dir.is_dir() {
        for session in sorted_subdirs(subject_dir)? {
            if session.starts_with("ses-") {
                fmap_dirs.push(subject_dir.join(session).join("fmap"));
            }
        }
    }

    let mut rewritten = Vec::new();
    for dir in fmap_dirs.into_iter().filter(|d| d.is_dir()) {
        let mut sidecars: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        sidecars.sort();

        for path in sidecars {
            let text = fs::read_to_string(&path)?;
            let Ok(Value::Object(mut sidecar)) = serde_json::from_str::<Value>(&text) else {
                tracing::warn!("Skipping unreadable sidecar {}", path.display());
                continue;
            };
            let Some(Value::Array(links)) = sidecar.get(INTENDED_FOR_FIELD) else {
                continue;
            };

            let kept: Vec<String> = links
                .iter()
                .filter_map(Value::as_str)
                .filter(|link| subject_dir.join(link).is_file())
                .map(str::to_string)
                .collect();
            if kept.len() == links.len() {
                continue;
            }

            tracing::info!(
                "Pruning {} stale Intended-For link(s) from {}",
                links.len() - kept.len(),
                path.display()
            );
            apply_intended_for(&mut sidecar, &kept);
            if write_sidecar(guard, &path, &Value::Object(sidecar))? != PlaceOutcome::Unchanged {
                rewritten.push(path);
            }
        }
    }

    Ok(rewritten)
}

/// A functional series with its acquisition time.
#[derive(Debug, Clone)]
pub struct TimedTarget {
    pub relative_path: String,
    pub time: NaiveTime,
}

/// Fieldmap flavour for time-based binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldmapKind {
    /// Spin-echo EPI with its phase-encoding direction label
    Epi(String),
    /// Gradient-echo magnitude or phase image
    Gre,
}

/// A fieldmap with its acquisition time; `id` is echoed back in the result.
#[derive(Debug, Clone)]
pub struct TimedFieldmap {
    pub id: usize,
    pub kind: FieldmapKind,
    pub time: NaiveTime,
}

/// Window around the closest GRE fieldmap that still counts as the same set.
const GRE_SET_WINDOW_SECS: f64 = 1.0;

fn seconds_between(a: NaiveTime, b: NaiveTime) -> f64 {
    (a - b).num_milliseconds().abs() as f64 / 1000.0
}

/// Bind each target to the fieldmaps closest to it in time.
///
/// When any EPI fieldmap is present, each target binds to the closest one in
/// every direction and GRE fieldmaps are ignored. Otherwise each target binds
/// to every GRE image acquired within one second of the closest. Returns
/// fieldmap id to sorted relative paths; fieldmaps nothing binds to get an
/// empty list.
pub fn bind_nearest(
    targets: &[TimedTarget],
    fieldmaps: &[TimedFieldmap],
) -> BTreeMap<usize, Vec<String>> {
    let mut bound: BTreeMap<usize, BTreeSet<String>> = BTreeMap::new();

    let epi: Vec<&TimedFieldmap> = fieldmaps
        .iter()
        .filter(|f| matches!(f.kind, FieldmapKind::Epi(_)))
        .collect();

    if !epi.is_empty() {
        for fmap in &epi {
            bound.entry(fmap.id).or_default();
        }
        let directions: BTreeSet<&str> = epi
            .iter()
            .filter_map(|f| match &f.kind {
                FieldmapKind::Epi(dir) => Some(dir.as_str()),
                FieldmapKind::Gre => None,
            })
            .collect();

        for direction in directions {
            let candidates: Vec<&&TimedFieldmap> = epi
                .iter()
                .filter(|f| f.kind == FieldmapKind::Epi(direction.to_string()))
                .collect();
            for target in targets {
                let closest = candidates.iter().min_by(|a, b| {
                    seconds_between(target.time, a.time).total_cmp(&seconds_between(target.time, b.time))
                });
                if let Some(fmap) = closest {
                    bound
                        .entry(fmap.id)
                        .or_default()
                        .insert(target.relative_path.clone());
                }
            }
        }
    } else {
        let gre: Vec<&TimedFieldmap> = fieldmaps
            .iter()
            .filter(|f| f.kind == FieldmapKind::Gre)
            .collect();
        for fmap in &gre {
            bound.entry(fmap.id).or_default();
        }
        for target in targets {
            let min = gre
                .iter()
                .map(|f| seconds_between(target.time, f.time))
                .fold(f64::INFINITY, f64::min);
            for fmap in &gre {
                if (seconds_between(target.time, fmap.time) - min).abs() < GRE_SET_WINDOW_SECS {
                    bound
                        .entry(fmap.id)
                        .or_default()
                        .insert(target.relative_path.clone());
                }
            }
        }
    }

    bound
        .into_iter()
        .map(|(id, paths)| (id, paths.into_iter().collect()))
        .collect()
}
