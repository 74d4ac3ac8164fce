//! Subject registry
//!
//! `participants.tsv` gets one row per curated subject and
//! `sub-<ID>/sub-<ID>_sessions.tsv` one row per curated session. Both files
//! are append-only: rows are added the first time an id is seen and never
//! rewritten afterwards, so manual edits to existing rows survive.

use crate::dataset::{DatasetLayout, SessionKey};
use sdk::errors::CurateError;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const PARTICIPANTS_HEADER: &[&str] = &["participant_id", "age", "sex", "group"];
const SESSIONS_HEADER: &[&str] = &["session_id", "acq_time"];

/// Value written for unknown fields.
pub const NOT_AVAILABLE: &str = "n/a";

/// Demographics taken from a representative sidecar.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Demographics {
    pub age: Option<String>,
    pub sex: Option<String>,
}

impl Demographics {
    /// Read `PatientAge` and `PatientSex` from sidecar metadata.
    pub fn from_metadata(meta: &serde_json::Map<String, serde_json::Value>) -> Self {
        let text = |key: &str| {
            meta.get(key)
                .and_then(|v| match v {
                    serde_json::Value::String(s) => Some(s.trim().to_string()),
                    serde_json::Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .filter(|s| !s.is_empty())
        };
        Self {
            age: text("PatientAge").map(|a| normalize_age(&a)),
            sex: text("PatientSex"),
        }
    }
}

/// `035Y` -> `35`; anything else passes through.
fn normalize_age(raw: &str) -> String {
    match raw.strip_suffix(['Y', 'y']) {
        Some(years) => {
            let years = years.trim_start_matches('0');
            if years.is_empty() {
                "0".to_string()
            } else {
                years.to_string()
            }
        }
        None => raw.to_string(),
    }
}

/// Append-only access to the registry files of one dataset.
pub struct Registry<'a> {
    layout: &'a DatasetLayout,
}

impl<'a> Registry<'a> {
    pub fn new(layout: &'a DatasetLayout) -> Self {
        Self { layout }
    }

    /// Participant ids (`sub-X`) already registered, in file order.
    pub fn subjects(&self) -> Result<Vec<String>, CurateError> {
        read_first_column(&self.layout.participants_tsv())
    }

    /// Session ids (`ses-Y`) already registered for a subject.
    pub fn sessions(&self, subject: &str) -> Result<Vec<String>, CurateError> {
        read_first_column(&self.sessions_tsv(subject))
    }

    fn sessions_tsv(&self, subject: &str) -> PathBuf {
        self.layout
            .subject_dir(subject)
            .join(format!("sub-{}_sessions.tsv", subject))
    }

    /// Add a participant row unless the subject is already present.
    ///
    /// Returns whether a row was appended.
    pub fn register_subject(
        &self,
        subject: &str,
        demographics: &Demographics,
    ) -> Result<bool, CurateError> {
        let path = self.layout.participants_tsv();
        let participant_id = format!("sub-{}", subject);

        if self.subjects()?.contains(&participant_id) {
            return Ok(false);
        }

        let row = [
            participant_id.as_str(),
            demographics.age.as_deref().unwrap_or(NOT_AVAILABLE),
            demographics.sex.as_deref().unwrap_or(NOT_AVAILABLE),
            NOT_AVAILABLE,
        ];
        append_row(&path, PARTICIPANTS_HEADER, &row)?;
        tracing::info!("Registered {} in participants.tsv", participant_id);
        Ok(true)
    }

    /// Add a sessions row unless the session is already present or the key has no session.
    pub fn register_session(
        &self,
        key: &SessionKey,
        acq_time: Option<&str>,
    ) -> Result<bool, CurateError> {
        let Some(session) = &key.session else {
            return Ok(false);
        };
        let session_id = format!("ses-{}", session);

        if self.sessions(&key.subject)?.contains(&session_id) {
            return Ok(false);
        }

        let path = self.sessions_tsv(&key.subject);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        append_row(
            &path,
            SESSIONS_HEADER,
            &[session_id.as_str(), acq_time.unwrap_or(NOT_AVAILABLE)],
        )?;
        tracing::info!("Registered {} in {}", session_id, path.display());
        Ok(true)
    }
}

fn read_first_column(path: &Path) -> Result<Vec<String>, CurateError> {
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .skip(1)
        .filter_map(|line| line.split('\t').next())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect())
}

fn append_row(path: &Path, header: &[&str], row: &[&str]) -> Result<(), CurateError> {
    let needs_header = !path.is_file() || fs::metadata(path)?.len() == 0;
    let needs_newline = !needs_header && !fs::read(path)?.ends_with(b"\n");

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if needs_header {
        writeln!(file, "{}", header.join("\t"))?;
    }
    if needs_newline {
        writeln!(file)?;
    }
    writeln!(file, "{}", row.join("\t"))?;
    Ok(())
}
