//! Protocol translator entries
//!
//! On disk the translator is a JSON object keyed by protocol identity whose
//! values are three-element arrays:
//!
//! ```json
//! {
//!     "T1_MPRAGE": ["anat", "T1w", "UNASSIGNED"],
//!     "FMAP_GRE": ["fmap", "acq-rest", ["task-rest_bold"]]
//! }
//! ```
//!
//! The array is decoded once, here, into a [`TranslatorEntry`]. Everything
//! downstream works with named fields and a typed exclusion flag.

use crate::entities::Stub;
use crate::errors::CurateError;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Prefix that marks a directory or suffix as producing no output.
pub const EXCLUDE_PREFIX: &str = "EXCLUDE";

/// Sentinel for "no Intended-For linkage".
pub const UNASSIGNED: &str = "UNASSIGNED";

/// Placeholder directory written for newly discovered protocols.
pub const PLACEHOLDER_DIRECTORY: &str = "EXCLUDE_BIDS_Directory";

/// Placeholder suffix written for newly discovered protocols.
pub const PLACEHOLDER_SUFFIX: &str = "EXCLUDE_BIDS_Name";

/// Datatype directory that carries Intended-For linkage.
pub const FIELDMAP_DIRECTORY: &str = "fmap";

/// Intended-For directive of a translator entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntendedFor {
    Unassigned,
    /// Target stubs, optionally prefixed by a datatype (`func/task-rest_bold`).
    Targets(Vec<String>),
}

impl IntendedFor {
    fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(s) if s == UNASSIGNED => Ok(Self::Unassigned),
            Value::String(s) => Ok(Self::Targets(vec![validate_target(s)?])),
            Value::Array(items) => {
                let mut targets = Vec::with_capacity(items.len());
                for item in items {
                    let target = item
                        .as_str()
                        .ok_or_else(|| format!("intendedFor items must be strings, found {}", item))?;
                    if target == UNASSIGNED {
                        continue;
                    }
                    targets.push(validate_target(target)?);
                }
                if targets.is_empty() {
                    Ok(Self::Unassigned)
                } else {
                    Ok(Self::Targets(targets))
                }
            }
            other => Err(format!(
                "intendedFor must be \"{}\" or a list of names, found {}",
                UNASSIGNED, other
            )),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Unassigned => Value::String(UNASSIGNED.to_string()),
            Self::Targets(targets) => {
                Value::Array(targets.iter().cloned().map(Value::String).collect())
            }
        }
    }

    /// Target stubs, empty when unassigned.
    pub fn targets(&self) -> &[String] {
        match self {
            Self::Unassigned => &[],
            Self::Targets(targets) => targets,
        }
    }
}

fn validate_target(target: &str) -> Result<String, String> {
    let (datatype, stub) = match target.split_once('/') {
        Some((dir, stub)) => (Some(dir), stub),
        None => (None, target),
    };
    if let Some(dir) = datatype {
        validate_directory(dir)?;
    }
    Stub::parse(stub).map_err(|e| format!("intendedFor target {}", e))?;
    Ok(target.to_string())
}

fn validate_directory(dir: &str) -> Result<(), String> {
    if dir.is_empty()
        || dir == "."
        || dir == ".."
        || dir.contains('/')
        || dir.contains('\\')
        || dir.chars().any(char::is_whitespace)
    {
        return Err(format!("'{}' is not a plain datatype directory name", dir));
    }
    Ok(())
}

/// One decoded translator value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatorEntry {
    directory: String,
    suffix: String,
    intended_for: IntendedFor,
    excluded: bool,
}

impl TranslatorEntry {
    /// Build and validate an entry.
    ///
    /// An entry whose directory or suffix starts with `EXCLUDE` is excluded and
    /// skips the naming checks; otherwise the directory must be a plain name and
    /// the suffix a well-formed stub.
    pub fn new(
        directory: impl Into<String>,
        suffix: impl Into<String>,
        intended_for: IntendedFor,
    ) -> Result<Self, String> {
        let directory = directory.into();
        let suffix = suffix.into();

        if directory.trim().is_empty() || suffix.trim().is_empty() {
            return Err("directory and suffix must not be empty".to_string());
        }

        let excluded = directory.starts_with(EXCLUDE_PREFIX) || suffix.starts_with(EXCLUDE_PREFIX);
        if !excluded {
            validate_directory(&directory)?;
            Stub::parse(&suffix)?;
        }

        Ok(Self {
            directory,
            suffix,
            intended_for,
            excluded,
        })
    }

    /// Placeholder written by the scaffold pass for a new protocol.
    pub fn placeholder() -> Self {
        Self {
            directory: PLACEHOLDER_DIRECTORY.to_string(),
            suffix: PLACEHOLDER_SUFFIX.to_string(),
            intended_for: IntendedFor::Unassigned,
            excluded: true,
        }
    }

    pub fn directory(&self) -> &str {
        &self.directory
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn intended_for(&self) -> &IntendedFor {
        &self.intended_for
    }

    pub fn is_excluded(&self) -> bool {
        self.excluded
    }

    /// Whether this entry is still the untouched scaffold placeholder.
    pub fn is_placeholder(&self) -> bool {
        self.directory == PLACEHOLDER_DIRECTORY
            && self.suffix == PLACEHOLDER_SUFFIX
            && self.intended_for == IntendedFor::Unassigned
    }

    pub fn is_fieldmap(&self) -> bool {
        !self.excluded && self.directory == FIELDMAP_DIRECTORY
    }

    /// Parsed suffix stub, `None` for excluded entries.
    pub fn stub(&self) -> Option<Stub> {
        if self.excluded {
            return None;
        }
        Stub::parse(&self.suffix).ok()
    }

    /// Intended-For targets that will never be used because the entry is not a fieldmap.
    pub fn has_ignored_links(&self) -> bool {
        !self.excluded && !self.is_fieldmap() && !self.intended_for.targets().is_empty()
    }

    /// Decode one JSON value. `key` is only used for error context.
    pub fn from_value(key: &str, value: &Value) -> Result<Self, CurateError> {
        let decode_err = |reason: String| CurateError::TranslatorDecode {
            key: key.to_string(),
            reason,
        };

        let items = value
            .as_array()
            .ok_or_else(|| decode_err(format!("expected a 3-element list, found {}", value)))?;
        if items.len() != 3 {
            return Err(decode_err(format!(
                "expected 3 elements, found {}",
                items.len()
            )));
        }

        let directory = items[0]
            .as_str()
            .ok_or_else(|| decode_err("directory must be a string".to_string()))?;
        let suffix = items[1]
            .as_str()
            .ok_or_else(|| decode_err("suffix must be a string".to_string()))?;
        let intended_for = IntendedFor::from_value(&items[2]).map_err(decode_err)?;

        Self::new(directory, suffix, intended_for).map_err(decode_err)
    }

    /// Encode back to the on-disk three-element list.
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::String(self.directory.clone()),
            Value::String(self.suffix.clone()),
            self.intended_for.to_value(),
        ])
    }
}

/// Decode a whole translator document.
pub fn decode_table(json: &str) -> Result<BTreeMap<String, TranslatorEntry>, CurateError> {
    let root: Value =
        serde_json::from_str(json).map_err(|e| CurateError::TranslatorFormat(e.to_string()))?;
    let object = root.as_object().ok_or_else(|| {
        CurateError::TranslatorFormat("top level must be an object keyed by protocol".to_string())
    })?;

    object
        .iter()
        .map(|(key, value)| Ok((key.clone(), TranslatorEntry::from_value(key, value)?)))
        .collect()
}

/// Encode a translator document with sorted keys and 4-space indentation.
pub fn encode_table(table: &BTreeMap<String, TranslatorEntry>) -> Result<String, CurateError> {
    let mut object = Map::new();
    for (key, entry) in table {
        object.insert(key.clone(), entry.to_value());
    }

    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    serde::Serialize::serialize(&Value::Object(object), &mut ser)
        .map_err(|e| CurateError::TranslatorFormat(e.to_string()))?;
    buf.push(b'\n');

    String::from_utf8(buf).map_err(|e| CurateError::TranslatorFormat(e.to_string()))
}
