//! Working-tree scanner
//!
//! Reads converter output under `work/sub-*/[ses-*/]`. Converter files are
//! named `<subject>--<description>--<sequence>--<series>[_<recon>]` with a
//! `.nii`/`.nii.gz` image, a `.json` sidecar and, for diffusion series,
//! `.bval`/`.bvec` companions.
//!
//! Nothing here writes to disk.

use crate::dataset::{sorted_subdirs, SessionKey};
use chrono::NaiveTime;
use sdk::entities::{split_extension, IMAGE_EXTENSIONS};
use sdk::errors::CurateError;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Fields of a converter output file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConverterFileName {
    pub subject_field: String,
    pub description: String,
    pub sequence: String,
    pub series_number: u32,
    /// Recon suffix after the series number: `e1`, `e2_ph`, `ph`, `i00001`, or empty.
    pub recon: String,
}

impl ConverterFileName {
    /// Parse a stem (no extension). Returns `None` for files not written by the converter.
    pub fn parse(stem: &str) -> Option<Self> {
        let fields: Vec<&str> = stem.split("--").collect();
        if fields.len() != 4 {
            return None;
        }
        let (series, recon) = match fields[3].split_once('_') {
            Some((series, recon)) => (series, recon),
            None => (fields[3], ""),
        };
        let series_number = series.trim_start_matches('s').parse().ok()?;
        Some(Self {
            subject_field: fields[0].to_string(),
            description: fields[1].to_string(),
            sequence: fields[2].to_string(),
            series_number,
            recon: recon.to_string(),
        })
    }

    /// Echo index encoded in the recon suffix (`e1`, `e2_ph`).
    pub fn recon_echo(&self) -> Option<u32> {
        self.recon
            .split('_')
            .find_map(|token| token.strip_prefix('e').and_then(|n| n.parse().ok()))
    }

    pub fn is_phase_recon(&self) -> bool {
        self.recon.ends_with("ph")
    }
}

/// Parsed sidecar metadata with typed accessors for the fields curation reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesMetadata {
    fields: Map<String, Value>,
}

impl SeriesMetadata {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Read and parse a sidecar file.
    pub fn load(path: &Path) -> Result<Self, CurateError> {
        let text = fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| CurateError::Sidecar(path.to_path_buf(), e.to_string()))?;
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            _ => Err(CurateError::Sidecar(
                path.to_path_buf(),
                "top level is not an object".to_string(),
            )),
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    fn string(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn series_description(&self) -> Option<&str> {
        self.string("SeriesDescription").filter(|s| !s.is_empty())
    }

    pub fn acquisition_time(&self) -> Option<NaiveTime> {
        parse_acquisition_time(self.string("AcquisitionTime")?)
    }

    pub fn acquisition_date(&self) -> Option<&str> {
        self.string("AcquisitionDate")
    }

    pub fn echo_number(&self) -> Option<u32> {
        self.fields
            .get("EchoNumber")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
    }

    pub fn echo_time(&self) -> Option<f64> {
        self.fields.get("EchoTime").and_then(Value::as_f64)
    }

    /// `ImageType` entries, upper-cased. Accepts a list or a backslash-joined string.
    pub fn image_type(&self) -> Vec<String> {
        match self.fields.get("ImageType") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_uppercase)
                .collect(),
            Some(Value::String(s)) => s.split('\\').map(str::to_uppercase).collect(),
            _ => Vec::new(),
        }
    }

    pub fn phase_encoding_direction(&self) -> Option<&str> {
        self.string("PhaseEncodingDirection")
    }

    /// `ScanningSequence`, flattened to one string when stored as a list.
    pub fn scanning_sequence(&self) -> Option<String> {
        match self.fields.get("ScanningSequence") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join("_"),
            ),
            _ => None,
        }
    }
}

/// Parse `HH:MM:SS[.ffffff]`.
pub fn parse_acquisition_time(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M:%S%.f").ok()
}

/// One converted image in the working tree.
#[derive(Debug, Clone)]
pub struct ConvertedSeries {
    pub key: SessionKey,
    pub protocol: String,
    /// Position in acquisition order within the session, from 0.
    pub ordinal: usize,
    pub image: PathBuf,
    /// Image extension (`.nii.gz` or `.nii`).
    pub extension: String,
    pub sidecar: Option<PathBuf>,
    pub file_name: ConverterFileName,
    pub metadata: SeriesMetadata,
}

impl ConvertedSeries {
    /// Build a series from its image path and metadata.
    ///
    /// Returns `None` if the image name is not a converter file name. The
    /// protocol identity is the sidecar `SeriesDescription`, falling back to the
    /// description field of the file name.
    pub fn from_parts(
        key: SessionKey,
        image: PathBuf,
        sidecar: Option<PathBuf>,
        metadata: SeriesMetadata,
    ) -> Option<Self> {
        let file = image.file_name()?.to_str()?.to_string();
        let (stem, extension) = split_extension(&file);
        if !IMAGE_EXTENSIONS.contains(&extension) {
            return None;
        }
        let file_name = ConverterFileName::parse(stem)?;
        let protocol = metadata
            .series_description()
            .map(str::to_string)
            .unwrap_or_else(|| file_name.description.clone());

        Some(Self {
            key,
            protocol,
            ordinal: 0,
            extension: extension.to_string(),
            image,
            sidecar,
            file_name,
            metadata,
        })
    }

    /// Sibling file with the same stem and another extension (`.bval`, `.bvec`).
    pub fn companion(&self, extension: &str) -> Option<PathBuf> {
        let name = self.image.file_name()?.to_str()?;
        let (stem, _) = split_extension(name);
        let path = self.image.with_file_name(format!("{}{}", stem, extension));
        path.is_file().then_some(path)
    }

    fn file_name_str(&self) -> &str {
        self.image
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

/// Series of one session in acquisition order, plus anything worth warning about.
#[derive(Debug, Default)]
pub struct SessionScan {
    pub series: Vec<ConvertedSeries>,
    pub warnings: Vec<String>,
}

/// Read-only view of the working tree.
#[derive(Debug, Clone)]
pub struct Scanner {
    work_root: PathBuf,
}

impl Scanner {
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
        }
    }

    /// Distinct protocol identities in the working tree.
    ///
    /// Lazy: files are read as the iterator advances. Each call starts a fresh
    /// walk, so the sequence can be restarted by calling this again.
    pub fn protocols(&self) -> ProtocolIter {
        let walker = WalkDir::new(&self.work_root)
            .follow_links(false)
            .min_depth(2)
            .max_depth(3)
            .sort_by_file_name()
            .into_iter();
        ProtocolIter {
            root: self.work_root.clone(),
            walker,
            seen: HashSet::new(),
        }
    }

    /// Subject/session directories present in the working tree, lexically ordered.
    ///
    /// A subject directory contributes one key per `ses-*` subdirectory, plus a
    /// session-less key when images sit directly inside it.
    pub fn sessions(&self, subjects: Option<&[String]>) -> Result<Vec<SessionKey>, CurateError> {
        let mut keys = Vec::new();

        for dir in sorted_subdirs(&self.work_root)? {
            let Some(subject) = dir.strip_prefix("sub-") else {
                continue;
            };
            if let Some(filter) = subjects {
                if !filter.iter().any(|s| s == subject) {
                    continue;
                }
            }

            let subject_dir = self.work_root.join(&dir);
            if contains_images(&subject_dir)? {
                keys.push(SessionKey::new(subject, None));
            }
            for ses_dir in sorted_subdirs(&subject_dir)? {
                if let Some(session) = ses_dir.strip_prefix("ses-") {
                    keys.push(SessionKey::new(subject, Some(session.to_string())));
                }
            }
        }

        Ok(keys)
    }

    /// Load every converted series of one session in acquisition order.
    ///
    /// Order is `AcquisitionTime`, then series number, then file name. If any
    /// series has no acquisition time the whole session falls back to series
    /// number then file name, with a warning.
    pub fn load_session(&self, key: &SessionKey) -> Result<SessionScan, CurateError> {
        let dir = self.work_root.join(key.relative_dir());
        let mut scan = SessionScan::default();

        for entry in WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Error accessing entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            let (stem, extension) = split_extension(name);
            if !IMAGE_EXTENSIONS.contains(&extension) || ConverterFileName::parse(stem).is_none() {
                continue;
            }

            let sidecar_path = dir.join(format!("{}.json", stem));
            let (sidecar, metadata) = if sidecar_path.is_file() {
                match SeriesMetadata::load(&sidecar_path) {
                    Ok(meta) => (Some(sidecar_path), meta),
                    Err(e) => {
                        scan.warnings.push(format!("{}: unreadable sidecar ({})", name, e));
                        (None, SeriesMetadata::default())
                    }
                }
            } else {
                scan.warnings.push(format!("{}: JSON sidecar not found", name));
                (None, SeriesMetadata::default())
            };

            if let Some(series) =
                ConvertedSeries::from_parts(key.clone(), entry.path().to_path_buf(), sidecar, metadata)
            {
                scan.series.push(series);
            }
        }

        let timed = scan
            .series
            .iter()
            .all(|s| s.metadata.acquisition_time().is_some());
        if !timed && !scan.series.is_empty() {
            scan.warnings.push(format!(
                "{}: acquisition times missing; ordering by series number",
                key
            ));
        }

        scan.series.sort_by(|a, b| {
            let by_time = if timed {
                a.metadata.acquisition_time().cmp(&b.metadata.acquisition_time())
            } else {
                std::cmp::Ordering::Equal
            };
            by_time
                .then(a.file_name.series_number.cmp(&b.file_name.series_number))
                .then_with(|| a.file_name_str().cmp(b.file_name_str()))
        });
        for (ordinal, series) in scan.series.iter_mut().enumerate() {
            series.ordinal = ordinal;
        }

        for warning in &scan.warnings {
            tracing::warn!("{}", warning);
        }

        Ok(scan)
    }
}

fn contains_images(dir: &Path) -> Result<bool, CurateError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if IMAGE_EXTENSIONS.contains(&split_extension(name).1) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Iterator returned by [`Scanner::protocols`].
pub struct ProtocolIter {
    root: PathBuf,
    walker: walkdir::IntoIter,
    seen: HashSet<String>,
}

impl ProtocolIter {
    fn identity_of(path: &Path) -> Option<String> {
        let name = path.file_name()?.to_str()?;
        let (stem, extension) = split_extension(name);
        if !IMAGE_EXTENSIONS.contains(&extension) {
            return None;
        }
        let file_name = ConverterFileName::parse(stem)?;

        let sidecar = path.with_file_name(format!("{}.json", stem));
        let description = SeriesMetadata::load(&sidecar)
            .ok()
            .and_then(|meta| meta.series_description().map(str::to_string));
        Some(description.unwrap_or(file_name.description))
    }

    fn under_subject(&self, path: &Path) -> bool {
        path.strip_prefix(&self.root)
            .ok()
            .and_then(|rel| rel.components().next())
            .and_then(|c| c.as_os_str().to_str())
            .is_some_and(|c| c.starts_with("sub-"))
    }
}

impl Iterator for ProtocolIter {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Error accessing entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if !self.under_subject(entry.path()) {
                continue;
            }
            if let Some(identity) = Self::identity_of(entry.path()) {
                if self.seen.insert(identity.clone()) {
                    return Some(identity);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_series(dir: &Path, stem: &str, meta: Value) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(format!("{}.nii.gz", stem)), stem.as_bytes()).unwrap();
        fs::write(dir.join(format!("{}.json", stem)), meta.to_string()).unwrap();
    }

    #[test]
    fn test_parse_converter_file_name() {
        let name = ConverterFileName::parse("S1--FMAP_GRE--GR--7_e2_ph").unwrap();
        assert_eq!(name.description, "FMAP_GRE");
        assert_eq!(name.series_number, 7);
        assert_eq!(name.recon, "e2_ph");
        assert_eq!(name.recon_echo(), Some(2));
        assert!(name.is_phase_recon());

        let plain = ConverterFileName::parse("S1--T1--GR_IR--s3").unwrap();
        assert_eq!(plain.series_number, 3);
        assert_eq!(plain.recon, "");

        assert!(ConverterFileName::parse("sub-S1_T1w").is_none());
    }

    #[test]
    fn test_acquisition_time_parsing() {
        assert!(parse_acquisition_time("14:03:22.517500").is_some());
        assert!(parse_acquisition_time("14:03:22").is_some());
        assert!(parse_acquisition_time("later").is_none());
    }

    #[test]
    fn test_protocols_are_distinct_and_restartable() {
        let temp = TempDir::new().unwrap();
        let work = temp.path().join("work");
        write_series(
            &work.join("sub-S1"),
            "S1--T1_MPRAGE--GR_IR--2",
            json!({"SeriesDescription": "T1_MPRAGE"}),
        );
        write_series(
            &work.join("sub-S1"),
            "S1--T1_MPRAGE--GR_IR--3",
            json!({"SeriesDescription": "T1_MPRAGE"}),
        );
        write_series(
            &work.join("sub-S2/ses-1"),
            "S2--rest--EP--4",
            json!({"SeriesDescription": "Rest fMRI"}),
        );
        write_series(&work.join("stray"), "X--ignored--EP--1", json!({}));

        let scanner = Scanner::new(&work);
        let first: Vec<String> = scanner.protocols().collect();
        assert_eq!(first, vec!["T1_MPRAGE".to_string(), "Rest fMRI".to_string()]);

        let again: Vec<String> = scanner.protocols().collect();
        assert_eq!(first, again);
    }

    #[test]
    fn test_identity_is_not_normalised() {
        let temp = TempDir::new().unwrap();
        let work = temp.path().join("work/sub-S1");
        write_series(&work, "S1--a--GR--1", json!({"SeriesDescription": "T1 mprage"}));
        write_series(&work, "S1--b--GR--2", json!({"SeriesDescription": "T1_MPRAGE"}));

        let found: Vec<String> = Scanner::new(temp.path().join("work")).protocols().collect();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_session_ordering_by_time() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("work/sub-S1");
        write_series(
            &dir,
            "S1--B--EP--9",
            json!({"SeriesDescription": "B", "AcquisitionTime": "09:00:00.000000"}),
        );
        write_series(
            &dir,
            "S1--A--EP--10",
            json!({"SeriesDescription": "A", "AcquisitionTime": "08:00:00.000000"}),
        );

        let scan = Scanner::new(temp.path().join("work"))
            .load_session(&SessionKey::new("S1", None))
            .unwrap();
        let protocols: Vec<&str> = scan.series.iter().map(|s| s.protocol.as_str()).collect();
        assert_eq!(protocols, vec!["A", "B"]);
        assert_eq!(scan.series[1].ordinal, 1);
        assert!(scan.warnings.is_empty());
    }

    #[test]
    fn test_session_ordering_falls_back_to_series_number() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("work/sub-S1");
        write_series(
            &dir,
            "S1--B--EP--9",
            json!({"SeriesDescription": "B", "AcquisitionTime": "07:00:00.000000"}),
        );
        write_series(&dir, "S1--A--EP--10", json!({"SeriesDescription": "A"}));

        let scan = Scanner::new(temp.path().join("work"))
            .load_session(&SessionKey::new("S1", None))
            .unwrap();
        let protocols: Vec<&str> = scan.series.iter().map(|s| s.protocol.as_str()).collect();
        assert_eq!(protocols, vec!["B", "A"]);
        assert_eq!(scan.warnings.len(), 1);
    }

    #[test]
    fn test_sessions_listing() {
        let temp = TempDir::new().unwrap();
        let work = temp.path().join("work");
        write_series(&work.join("sub-S2/ses-2"), "S2--x--GR--1", json!({}));
        write_series(&work.join("sub-S2/ses-1"), "S2--x--GR--1", json!({}));
        write_series(&work.join("sub-S1"), "S1--x--GR--1", json!({}));

        let scanner = Scanner::new(&work);
        let keys = scanner.sessions(None).unwrap();
        assert_eq!(
            keys,
            vec![
                SessionKey::new("S1", None),
                SessionKey::new("S2", Some("1".to_string())),
                SessionKey::new("S2", Some("2".to_string())),
            ]
        );

        let only = scanner.sessions(Some(&["S1".to_string()])).unwrap();
        assert_eq!(only, vec![SessionKey::new("S1", None)]);
    }

    #[test]
    fn test_missing_sidecar_falls_back_to_file_name() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("work/sub-S1");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("S1--LOCALIZER--GR--1_i00001.nii.gz"), b"x").unwrap();

        let scan = Scanner::new(temp.path().join("work"))
            .load_session(&SessionKey::new("S1", None))
            .unwrap();
        assert_eq!(scan.series[0].protocol, "LOCALIZER");
        assert!(scan.series[0].sidecar.is_none());
        assert!(!scan.warnings.is_empty());
    }
}
