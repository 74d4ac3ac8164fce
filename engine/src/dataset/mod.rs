//! Dataset layout and lifecycle state
//!
//! A dataset root holds `sourcedata/` (raw input, never written by curation),
//! `work/` (converter output), `code/` (translator and config) and the curated
//! `sub-*/` tree. Every component receives a [`DatasetLayout`] explicitly; there
//! is no process-wide dataset location.

use sdk::errors::CurateError;
use serde_json::json;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Translator file name inside `code/`.
pub const TRANSLATOR_FILE: &str = "Protocol_Translator.json";

/// Registry file at the dataset root.
pub const PARTICIPANTS_FILE: &str = "participants.tsv";

/// Top-level directories that curation must never place series into.
pub const RESERVED_DIRS: &[&str] = &["sourcedata", "work", "code", "derivatives"];

/// Subject plus optional session: the unit of conversion and curation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub subject: String,
    pub session: Option<String>,
}

impl SessionKey {
    pub fn new(subject: impl Into<String>, session: Option<String>) -> Self {
        Self {
            subject: subject.into(),
            session,
        }
    }

    /// Relative directory under a tree root: `sub-X` or `sub-X/ses-Y`.
    pub fn relative_dir(&self) -> PathBuf {
        let mut dir = PathBuf::from(format!("sub-{}", self.subject));
        if let Some(ses) = &self.session {
            dir.push(format!("ses-{}", ses));
        }
        dir
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.subject)?;
        if let Some(ses) = &self.session {
            write!(f, "/ses-{}", ses)?;
        }
        Ok(())
    }
}

/// Reject subject and session ids that would break filename parsing.
pub fn validate_identifier(id: &str) -> Result<(), CurateError> {
    if id.is_empty()
        || id.contains('-')
        || id.contains('_')
        || id.contains('/')
        || id.contains('\\')
        || id.chars().any(char::is_whitespace)
    {
        return Err(CurateError::InvalidIdentifier(id.to_string()));
    }
    Ok(())
}

/// Where everything lives inside one dataset.
#[derive(Debug, Clone)]
pub struct DatasetLayout {
    root: PathBuf,
}

impl DatasetLayout {
    /// Open an existing dataset root.
    ///
    /// # Errors
    ///
    /// Returns `CurateError::DatasetRoot` if the path is not a readable directory.
    pub fn open(root: &Path) -> Result<Self, CurateError> {
        let root = root
            .canonicalize()
            .map_err(|_| CurateError::DatasetRoot(root.to_path_buf()))?;
        if !root.is_dir() {
            return Err(CurateError::DatasetRoot(root));
        }
        fs::read_dir(&root).map_err(|_| CurateError::DatasetRoot(root.clone()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sourcedata(&self) -> PathBuf {
        self.root.join("sourcedata")
    }

    pub fn work(&self) -> PathBuf {
        self.root.join("work")
    }

    pub fn code(&self) -> PathBuf {
        self.root.join("code")
    }

    pub fn derivatives(&self) -> PathBuf {
        self.root.join("derivatives")
    }

    pub fn translator_path(&self) -> PathBuf {
        self.code().join(TRANSLATOR_FILE)
    }

    pub fn participants_tsv(&self) -> PathBuf {
        self.root.join(PARTICIPANTS_FILE)
    }

    pub fn subject_dir(&self, subject: &str) -> PathBuf {
        self.root.join(format!("sub-{}", subject))
    }

    /// Curated directory for one subject/session.
    pub fn session_dir(&self, key: &SessionKey) -> PathBuf {
        self.root.join(key.relative_dir())
    }

    /// Converter output directory for one subject/session.
    pub fn work_session_dir(&self, key: &SessionKey) -> PathBuf {
        self.work().join(key.relative_dir())
    }

    /// Raw input directory for one subject/session.
    pub fn source_session_dir(&self, key: &SessionKey) -> PathBuf {
        let mut dir = self.sourcedata().join(&key.subject);
        if let Some(ses) = &key.session {
            dir.push(ses);
        }
        dir
    }

    /// Fail unless `sourcedata/` exists.
    pub fn require_sourcedata(&self) -> Result<(), CurateError> {
        if self.sourcedata().is_dir() {
            Ok(())
        } else {
            Err(CurateError::DatasetRoot(self.sourcedata()))
        }
    }

    /// Create the working directories and descriptor files that are missing.
    ///
    /// Existing files are never touched. Returns the paths that were created.
    pub fn ensure_scaffold(&self) -> Result<Vec<PathBuf>, CurateError> {
        let mut created = Vec::new();

        for dir in [self.code(), self.work(), self.derivatives()] {
            if !dir.is_dir() {
                fs::create_dir_all(&dir)?;
                created.push(dir);
            }
        }

        for (name, contents) in descriptor_files()? {
            let path = self.root.join(name);
            if !path.exists() {
                fs::write(&path, contents)?;
                tracing::debug!("Created {}", path.display());
                created.push(path);
            }
        }

        Ok(created)
    }

    /// Subject/session directories in `sourcedata/`, lexically ordered.
    ///
    /// With sessions enabled each subdirectory of a subject folder is a
    /// session; otherwise the subject folder itself is the only session.
    /// Hidden entries are skipped. Invalid ids are returned as errors in place
    /// so one badly named folder does not hide the rest.
    pub fn source_sessions(
        &self,
        use_sessions: bool,
        subjects: Option<&[String]>,
    ) -> Result<Vec<Result<SessionKey, CurateError>>, CurateError> {
        let mut keys = Vec::new();

        for subject in sorted_subdirs(&self.sourcedata())? {
            if let Some(filter) = subjects {
                if !filter.iter().any(|s| s == &subject) {
                    continue;
                }
            }
            if let Err(e) = validate_identifier(&subject) {
                keys.push(Err(e));
                continue;
            }

            if !use_sessions {
                keys.push(Ok(SessionKey::new(subject, None)));
                continue;
            }

            for session in sorted_subdirs(&self.sourcedata().join(&subject))? {
                keys.push(validate_identifier(&session).map(|_| {
                    SessionKey::new(subject.clone(), Some(session.clone()))
                }));
            }
        }

        Ok(keys)
    }
}

/// Names of non-hidden subdirectories, sorted.
pub(crate) fn sorted_subdirs(dir: &Path) -> Result<Vec<String>, CurateError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if !name.starts_with('.') {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn descriptor_files() -> Result<Vec<(&'static str, String)>, CurateError> {
    let description = json!({
        "Name": "Descriptive name for this dataset",
        "BIDSVersion": "1.8.0",
        "DatasetType": "raw",
        "License": "CC-BY-4.0",
        "Authors": ["First Author", "Second Author"],
        "Acknowledgements": "",
        "HowToAcknowledge": "",
        "Funding": [],
        "ReferencesAndLinks": [],
        "DatasetDOI": ""
    });
    let participants = json!({
        "age": {
            "Description": "Age of participant",
            "Units": "years"
        },
        "sex": {
            "Description": "Sex of participant",
            "Levels": {
                "M": "male",
                "F": "female",
                "O": "other"
            }
        },
        "group": {
            "Description": "Participant group assignment"
        }
    });

    Ok(vec![
        ("dataset_description.json", pretty_json(&description)?),
        ("participants.json", pretty_json(&participants)?),
        ("README", "Useful information about this dataset\n".to_string()),
        ("CHANGES", "1.0.0 YYYY-MM-DD\n - Initial release\n".to_string()),
        (".bidsignore", "work/\ncode/\n".to_string()),
    ])
}

/// Serialize with 4-space indentation and a trailing newline.
pub fn pretty_json(value: &serde_json::Value) -> Result<String, CurateError> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    serde::Serialize::serialize(value, &mut ser)
        .map_err(|e| CurateError::Sidecar(PathBuf::new(), e.to_string()))?;
    buf.push(b'\n');
    String::from_utf8(buf).map_err(|e| CurateError::Sidecar(PathBuf::new(), e.to_string()))
}

/// Workflow state derived from what is on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DatasetState {
    /// Only raw input present
    Raw,
    /// Translator exists, nothing converted yet
    Scaffolded,
    /// Working tree populated
    Converted,
    /// At least one subject registered in the final tree
    Curated,
}

impl DatasetState {
    /// Derive the state from the translator file, `work/` contents and the registry.
    pub fn detect(layout: &DatasetLayout) -> Result<Self, CurateError> {
        let has_translator = layout.translator_path().is_file();
        let work_populated = !sorted_subdirs(&layout.work())?.is_empty();
        let curated = !crate::registry::Registry::new(layout).subjects()?.is_empty();

        Ok(match (has_translator, work_populated, curated) {
            (true, _, true) => Self::Curated,
            (true, true, false) => Self::Converted,
            (true, false, false) => Self::Scaffolded,
            (false, _, _) => Self::Raw,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "RAW",
            Self::Scaffolded => "SCAFFOLDED",
            Self::Converted => "CONVERTED",
            Self::Curated => "CURATED",
        }
    }

    /// Whether the curation pass can run from this state.
    pub fn can_curate(&self) -> bool {
        !matches!(self, Self::Raw)
    }
}

impl fmt::Display for DatasetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layout_with_sourcedata() -> (TempDir, DatasetLayout) {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("sourcedata")).unwrap();
        let layout = DatasetLayout::open(temp.path()).unwrap();
        (temp, layout)
    }

    #[test]
    fn test_open_rejects_missing_root() {
        let temp = TempDir::new().unwrap();
        let result = DatasetLayout::open(&temp.path().join("nope"));
        assert!(matches!(result, Err(CurateError::DatasetRoot(_))));
    }

    #[test]
    fn test_session_paths() {
        let (_temp, layout) = layout_with_sourcedata();
        let key = SessionKey::new("S1", Some("2".to_string()));

        assert_eq!(layout.session_dir(&key), layout.root().join("sub-S1/ses-2"));
        assert_eq!(layout.work_session_dir(&key), layout.root().join("work/sub-S1/ses-2"));
        assert_eq!(layout.source_session_dir(&key), layout.root().join("sourcedata/S1/2"));
        assert_eq!(key.to_string(), "sub-S1/ses-2");
    }

    #[test]
    fn test_scaffold_never_overwrites() {
        let (_temp, layout) = layout_with_sourcedata();
        fs::write(layout.root().join("README"), "my notes\n").unwrap();

        let created = layout.ensure_scaffold().unwrap();
        assert!(!created.contains(&layout.root().join("README")));
        assert_eq!(
            fs::read_to_string(layout.root().join("README")).unwrap(),
            "my notes\n"
        );
        assert!(layout.root().join("dataset_description.json").is_file());
        assert!(layout.code().is_dir());

        assert!(layout.ensure_scaffold().unwrap().is_empty());
    }

    #[test]
    fn test_source_sessions_with_and_without_sessions() {
        let (_temp, layout) = layout_with_sourcedata();
        fs::create_dir_all(layout.sourcedata().join("S2/1")).unwrap();
        fs::create_dir_all(layout.sourcedata().join("S1/2")).unwrap();
        fs::create_dir_all(layout.sourcedata().join("S1/1")).unwrap();
        fs::create_dir_all(layout.sourcedata().join(".hidden")).unwrap();

        let keys: Vec<SessionKey> = layout
            .source_sessions(true, None)
            .unwrap()
            .into_iter()
            .map(|k| k.unwrap())
            .collect();
        assert_eq!(
            keys,
            vec![
                SessionKey::new("S1", Some("1".to_string())),
                SessionKey::new("S1", Some("2".to_string())),
                SessionKey::new("S2", Some("1".to_string())),
            ]
        );

        let flat = layout.source_sessions(false, Some(&["S2".to_string()])).unwrap();
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].as_ref().unwrap(), &SessionKey::new("S2", None));
    }

    #[test]
    fn test_invalid_identifiers_reported() {
        let (_temp, layout) = layout_with_sourcedata();
        fs::create_dir_all(layout.sourcedata().join("bad_id/1")).unwrap();

        let keys = layout.source_sessions(true, None).unwrap();
        assert!(matches!(keys[0], Err(CurateError::InvalidIdentifier(_))));
        assert!(validate_identifier("S01").is_ok());
        assert!(validate_identifier("S-01").is_err());
    }

    #[test]
    fn test_state_progression() {
        let (_temp, layout) = layout_with_sourcedata();
        assert_eq!(DatasetState::detect(&layout).unwrap(), DatasetState::Raw);

        layout.ensure_scaffold().unwrap();
        fs::write(layout.translator_path(), "{}\n").unwrap();
        assert_eq!(DatasetState::detect(&layout).unwrap(), DatasetState::Scaffolded);

        fs::create_dir_all(layout.work().join("sub-S1")).unwrap();
        assert_eq!(DatasetState::detect(&layout).unwrap(), DatasetState::Converted);

        fs::write(
            layout.participants_tsv(),
            "participant_id\tage\tsex\tgroup\nsub-S1\tn/a\tn/a\tn/a\n",
        )
        .unwrap();
        assert_eq!(DatasetState::detect(&layout).unwrap(), DatasetState::Curated);
    }
}
