//! BIDS filename entities
//!
//! A canonical output name is `sub-<label>[_ses-<label>][_<key>-<value>...]_<suffix>`.
//! [`Stub`] holds everything after the subject/session prefix (the part a
//! translator entry spells out, e.g. `task-rest_bold`) and [`CanonicalName`]
//! binds a stub to a subject and optional session.

use std::fmt;

/// Entity keys in the order they appear in a canonical filename.
pub const ENTITY_ORDER: &[&str] = &[
    "sub",
    "ses",
    "task",
    "acq",
    "ce",
    "rec",
    "dir",
    "run",
    "mod",
    "echo",
    "flip",
    "inv",
    "mt",
    "part",
    "recording",
    "chunk",
];

/// Image extensions recognised in the working and final trees, longest first.
pub const IMAGE_EXTENSIONS: &[&str] = &[".nii.gz", ".nii"];

fn entity_rank(key: &str) -> usize {
    ENTITY_ORDER
        .iter()
        .position(|k| *k == key)
        .unwrap_or(ENTITY_ORDER.len())
}

/// Split a file name into stem and extension, treating `.nii.gz` as one extension.
///
/// ```
/// use sdk::entities::split_extension;
///
/// assert_eq!(split_extension("sub-01_T1w.nii.gz"), ("sub-01_T1w", ".nii.gz"));
/// assert_eq!(split_extension("sub-01_T1w.json"), ("sub-01_T1w", ".json"));
/// assert_eq!(split_extension("README"), ("README", ""));
/// ```
pub fn split_extension(file_name: &str) -> (&str, &str) {
    if let Some(stem) = file_name.strip_suffix(".nii.gz") {
        return (stem, &file_name[stem.len()..]);
    }
    match file_name.rfind('.') {
        Some(idx) if idx > 0 => (&file_name[..idx], &file_name[idx..]),
        _ => (file_name, ""),
    }
}

/// Format a run index the way it appears in filenames (`01`, `02`, ... `10`).
pub fn format_run(run: u32) -> String {
    format!("{:02}", run)
}

/// The part of a canonical name after the subject/session prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Stub {
    entities: Vec<(String, String)>,
    suffix: Option<String>,
}

impl Stub {
    /// Parse a stub such as `task-rest_run-01_bold` or `acq-rest`.
    ///
    /// Segments of the form `key-value` become entities; a trailing segment
    /// without a dash is the contrast suffix. Entities are kept in canonical order.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("empty name".to_string());
        }
        if raw.contains('/') || raw.contains('\\') || raw.contains('.') {
            return Err(format!("'{}' must not contain path separators or dots", raw));
        }

        let segments: Vec<&str> = raw.split('_').collect();
        let mut stub = Stub::default();

        for (idx, segment) in segments.iter().enumerate() {
            if segment.is_empty() {
                return Err(format!("'{}' contains an empty segment", raw));
            }
            match segment.split_once('-') {
                Some((key, value)) if !key.is_empty() && !value.is_empty() => {
                    stub.set(key, value);
                }
                Some(_) => return Err(format!("'{}' has a malformed entity '{}'", raw, segment)),
                None if idx + 1 == segments.len() => stub.suffix = Some(segment.to_string()),
                None => {
                    return Err(format!(
                        "'{}' has suffix '{}' before the end of the name",
                        raw, segment
                    ))
                }
            }
        }

        Ok(stub)
    }

    /// Value of one entity, if present.
    pub fn entity(&self, key: &str) -> Option<&str> {
        self.entities
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set or replace an entity, keeping canonical order.
    pub fn set(&mut self, key: &str, value: &str) {
        if let Some(slot) = self.entities.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value.to_string();
            return;
        }
        self.entities.push((key.to_string(), value.to_string()));
        // Stable, so unknown keys keep their relative order at the end
        self.entities.sort_by_key(|(k, _)| entity_rank(k));
    }

    /// Builder-style [`Stub::set`].
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.set(key, value);
        self
    }

    /// Remove an entity if present.
    pub fn remove(&mut self, key: &str) {
        self.entities.retain(|(k, _)| k != key);
    }

    /// Contrast suffix (`bold`, `T1w`, `phasediff`, ...).
    pub fn suffix(&self) -> Option<&str> {
        self.suffix.as_deref()
    }

    /// Replace the contrast suffix.
    pub fn set_suffix(&mut self, suffix: &str) {
        self.suffix = Some(suffix.to_string());
    }

    /// Builder-style [`Stub::set_suffix`].
    pub fn with_suffix(mut self, suffix: &str) -> Self {
        self.set_suffix(suffix);
        self
    }

    /// Run index parsed from the `run` entity.
    pub fn run(&self) -> Option<u32> {
        self.entity("run").and_then(|v| v.parse().ok())
    }

    /// Copy of this stub with the run entity removed.
    pub fn without_run(&self) -> Self {
        let mut stub = self.clone();
        stub.remove("run");
        stub
    }

    /// Copy of this stub with the given run index.
    pub fn with_run(&self, run: u32) -> Self {
        self.clone().with("run", &format_run(run))
    }

    /// Entities in canonical order.
    pub fn entities(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entities.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self
            .entities
            .iter()
            .map(|(k, v)| format!("{}-{}", k, v))
            .collect();
        if let Some(suffix) = &self.suffix {
            parts.push(suffix.clone());
        }
        write!(f, "{}", parts.join("_"))
    }
}

/// Fully resolved output name, without directory or extension.
///
/// ```
/// use sdk::entities::{CanonicalName, Stub};
///
/// let stub = Stub::parse("task-rest_bold").unwrap().with_run(1);
/// let name = CanonicalName::new("S1", None, stub);
/// assert_eq!(name.to_string(), "sub-S1_task-rest_run-01_bold");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalName {
    subject: String,
    session: Option<String>,
    stub: Stub,
}

impl CanonicalName {
    pub fn new(subject: impl Into<String>, session: Option<String>, stub: Stub) -> Self {
        Self {
            subject: subject.into(),
            session,
            stub,
        }
    }

    /// Parse a file stem (`sub-S1_ses-1_task-rest_run-01_bold`).
    ///
    /// Returns `None` when the stem does not start with a subject entity.
    pub fn parse(stem: &str) -> Option<Self> {
        let rest = stem.strip_prefix("sub-")?;
        let (subject, rest) = rest.split_once('_')?;
        let (session, rest) = match rest.strip_prefix("ses-") {
            Some(after) => {
                let (ses, rest) = after.split_once('_')?;
                (Some(ses.to_string()), rest)
            }
            None => (None, rest),
        };
        let stub = Stub::parse(rest).ok()?;
        Some(Self::new(subject, session, stub))
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn stub(&self) -> &Stub {
        &self.stub
    }

    /// Name identity with the run entity removed; series sharing a base are runs
    /// of the same acquisition.
    pub fn base(&self) -> CanonicalName {
        Self::new(self.subject.clone(), self.session.clone(), self.stub.without_run())
    }

    pub fn run(&self) -> Option<u32> {
        self.stub.run()
    }

    pub fn with_run(&self, run: u32) -> CanonicalName {
        Self::new(self.subject.clone(), self.session.clone(), self.stub.with_run(run))
    }
}

impl fmt::Display for CanonicalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.subject)?;
        if let Some(ses) = &self.session {
            write!(f, "_ses-{}", ses)?;
        }
        let stub = self.stub.to_string();
        if !stub.is_empty() {
            write!(f, "_{}", stub)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_orders_entities() {
        let stub = Stub::parse("run-02_task-rest_bold").unwrap();
        assert_eq!(stub.to_string(), "task-rest_run-02_bold");
        assert_eq!(stub.run(), Some(2));
    }

    #[test]
    fn test_parse_without_suffix() {
        let stub = Stub::parse("acq-rest").unwrap();
        assert_eq!(stub.suffix(), None);
        assert_eq!(stub.entity("acq"), Some("rest"));
    }

    #[test]
    fn test_parse_rejects_paths() {
        assert!(Stub::parse("../anat_T1w").is_err());
        assert!(Stub::parse("func/task-rest_bold").is_err());
        assert!(Stub::parse("bold_task-rest").is_err());
        assert!(Stub::parse("").is_err());
    }

    #[test]
    fn test_unknown_entities_sort_last() {
        let stub = Stub::parse("foo-bar_acq-x_T1w").unwrap();
        assert_eq!(stub.to_string(), "acq-x_foo-bar_T1w");
    }

    #[test]
    fn test_canonical_name_round_trip() {
        let name = CanonicalName::parse("sub-S1_ses-2_task-rest_run-03_bold").unwrap();
        assert_eq!(name.subject(), "S1");
        assert_eq!(name.session(), Some("2"));
        assert_eq!(name.run(), Some(3));
        assert_eq!(name.base().to_string(), "sub-S1_ses-2_task-rest_bold");
        assert_eq!(name.with_run(4).to_string(), "sub-S1_ses-2_task-rest_run-04_bold");
    }

    #[test]
    fn test_canonical_name_rejects_foreign_files() {
        assert!(CanonicalName::parse("dataset_description").is_none());
        assert!(CanonicalName::parse("participants").is_none());
    }

    #[test]
    fn test_split_extension_plain_nii() {
        assert_eq!(split_extension("a--b--c--s5.nii"), ("a--b--c--s5", ".nii"));
        assert_eq!(split_extension("x.bval"), ("x", ".bval"));
    }
}
