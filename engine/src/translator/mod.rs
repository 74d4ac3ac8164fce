//! Protocol translator table
//!
//! Maps each protocol identity found in the working tree to a
//! [`TranslatorEntry`]. The table lives in `code/Protocol_Translator.json` and
//! belongs to the user: merging only ever adds placeholder (or auto-filled)
//! entries for unseen protocols, and saving skips the write when nothing changed.

use crate::placement::write_atomic;
use regex::Regex;
use sdk::entities::Stub;
use sdk::errors::CurateError;
use sdk::translator::{decode_table, encode_table, IntendedFor, TranslatorEntry};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// In-memory translator table, keyed by protocol identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Translator {
    entries: BTreeMap<String, TranslatorEntry>,
}

/// What a merge changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// New protocols given a placeholder entry
    pub added: Vec<String>,
    /// New protocols given an auto-filled entry
    pub auto_filled: Vec<String>,
    /// Discovered protocols that already had an entry
    pub existing: usize,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.auto_filled.is_empty()
    }
}

/// Entry counts for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Coverage {
    pub total: usize,
    pub excluded: usize,
    pub placeholders: usize,
    pub fieldmaps: usize,
}

impl Translator {
    pub fn new(entries: BTreeMap<String, TranslatorEntry>) -> Self {
        Self { entries }
    }

    /// Load the table, or an empty one if the file does not exist.
    ///
    /// # Errors
    ///
    /// A file that exists but does not decode is a configuration error.
    pub fn load(path: &Path) -> Result<Self, CurateError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        let entries = decode_table(&text)?;

        let translator = Self { entries };
        for key in translator.ignored_links() {
            tracing::warn!(
                "Translator entry '{}' lists intendedFor targets but is not a fieldmap; they are ignored",
                key
            );
        }
        Ok(translator)
    }

    pub fn get(&self, protocol: &str) -> Option<&TranslatorEntry> {
        self.entries.get(protocol)
    }

    pub fn entries(&self) -> &BTreeMap<String, TranslatorEntry> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add entries for discovered protocols that have none.
    ///
    /// Existing entries are never modified or removed, including entries whose
    /// protocol no longer appears. With an auto-filler, new protocols get a
    /// proposed entry instead of the placeholder.
    pub fn merge<I>(&mut self, discovered: I, auto: Option<&AutoTranslator>) -> MergeReport
    where
        I: IntoIterator<Item = String>,
    {
        let mut report = MergeReport::default();

        for protocol in discovered {
            if self.entries.contains_key(&protocol) {
                report.existing += 1;
                continue;
            }

            let entry = auto
                .map(|auto| auto.propose(&protocol))
                .unwrap_or_else(TranslatorEntry::placeholder);

            if entry.is_placeholder() {
                tracing::info!("Adding protocol '{}' to translator", protocol);
                report.added.push(protocol.clone());
            } else {
                tracing::info!(
                    "Adding protocol '{}' to translator as {}/{}",
                    protocol,
                    entry.directory(),
                    entry.suffix()
                );
                report.auto_filled.push(protocol.clone());
            }
            self.entries.insert(protocol, entry);
        }

        report
    }

    /// Write the table with sorted keys and 4-space indentation.
    ///
    /// Returns `false` without touching the file when its bytes already match.
    pub fn save(&self, path: &Path) -> Result<bool, CurateError> {
        let encoded = encode_table(&self.entries)?;

        if let Ok(current) = fs::read(path) {
            if current == encoded.as_bytes() {
                tracing::debug!("Translator unchanged: {}", path.display());
                return Ok(false);
            }
        }

        write_atomic(path, encoded.as_bytes())?;
        tracing::info!("Translator written: {}", path.display());
        Ok(true)
    }

    pub fn coverage(&self) -> Coverage {
        let mut coverage = Coverage {
            total: self.entries.len(),
            ..Coverage::default()
        };
        for entry in self.entries.values() {
            if entry.is_excluded() {
                coverage.excluded += 1;
            }
            if entry.is_placeholder() {
                coverage.placeholders += 1;
            }
            if entry.is_fieldmap() {
                coverage.fieldmaps += 1;
            }
        }
        coverage
    }

    /// Keys whose intendedFor targets will be ignored because they are not fieldmaps.
    pub fn ignored_links(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.has_ignored_links())
            .map(|(key, _)| key.as_str())
            .collect()
    }
}

/// Name-pattern heuristics that propose entries for new protocols.
///
/// Rules are tried in order and the first match wins; a protocol that matches
/// nothing keeps the placeholder. Fieldmap names are checked before the
/// functional and diffusion rules so `FieldMap_rest` stays a fieldmap.
pub struct AutoTranslator {
    reproin: Regex,
    task_label: Regex,
}

impl AutoTranslator {
    /// # Errors
    ///
    /// Returns an error if a built-in pattern fails to compile.
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            reproin: Regex::new(r"^(anat|func|dwi|fmap|perf)-([A-Za-z0-9]+)((?:_[A-Za-z]+-[A-Za-z0-9]+)*)$")?,
            task_label: Regex::new(r"(?i)task[-_]([a-z0-9]+)")?,
        })
    }

    /// Propose an entry for one protocol identity.
    pub fn propose(&self, protocol: &str) -> TranslatorEntry {
        self.try_propose(protocol)
            .unwrap_or_else(TranslatorEntry::placeholder)
    }

    fn try_propose(&self, protocol: &str) -> Option<TranslatorEntry> {
        if let Some(entry) = self.reproin(protocol) {
            return Some(entry);
        }

        let lower = protocol.to_lowercase();
        let tokens: Vec<&str> = lower
            .split(|c: char| c == '_' || c == '-' || c.is_whitespace())
            .filter(|t| !t.is_empty())
            .collect();
        let has = |t: &str| tokens.contains(&t);
        let direction = if has("ap") {
            Some("AP")
        } else if has("pa") {
            Some("PA")
        } else {
            None
        };

        if ["localizer", "localiser", "scout", "aahead"]
            .iter()
            .any(|p| lower.contains(p))
        {
            return None;
        }

        if lower.contains("fieldmap")
            || lower.contains("field_map")
            || lower.contains("gre_field")
            || lower.contains("spinecho")
            || (has("se") && direction.is_some())
        {
            let is_epi = lower.contains("spinecho") || has("se") || has("epi");
            return match (is_epi, direction) {
                (true, Some(dir)) => entry("fmap", &format!("dir-{}_epi", dir)),
                _ => {
                    let label = self.task(protocol).unwrap_or_else(|| "gre".to_string());
                    entry("fmap", &format!("acq-{}", label))
                }
            };
        }

        if lower.contains("mprage") || lower.contains("mp-rage") || has("t1w") || has("t1") {
            return entry("anat", "T1w");
        }

        if lower.contains("flair") {
            return entry("anat", "FLAIR");
        }

        if has("t2w") || has("t2") || lower.contains("t2_space") {
            return entry("anat", "T2w");
        }

        if lower.contains("sbref") {
            return entry("func", &format!("task-{}_sbref", self.task_or_default(protocol, &tokens)));
        }

        if has("bold")
            || has("fmri")
            || has("rest")
            || tokens.iter().any(|t| t.starts_with("task"))
        {
            return entry("func", &format!("task-{}_bold", self.task_or_default(protocol, &tokens)));
        }

        if tokens
            .iter()
            .any(|t| t.starts_with("dwi") || t.starts_with("dti") || t.starts_with("diff"))
        {
            return match direction {
                Some(dir) => entry("dwi", &format!("dir-{}_dwi", dir)),
                None => entry("dwi", "dwi"),
            };
        }

        None
    }

    fn reproin(&self, protocol: &str) -> Option<TranslatorEntry> {
        let caps = self.reproin.captures(protocol)?;
        let directory = caps.get(1)?.as_str();
        let suffix = caps.get(2)?.as_str();
        let rest = caps.get(3).map(|m| m.as_str()).unwrap_or_default();

        let raw = format!("{}_{}", rest.trim_start_matches('_'), suffix);
        let stub = Stub::parse(raw.trim_start_matches('_')).ok()?.without_run();
        entry(directory, &stub.to_string())
    }

    fn task(&self, protocol: &str) -> Option<String> {
        self.task_label
            .captures(protocol)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_lowercase())
    }

    fn task_or_default(&self, protocol: &str, tokens: &[&str]) -> String {
        self.task(protocol).unwrap_or_else(|| {
            if tokens.contains(&"rest") {
                "rest".to_string()
            } else {
                "unknown".to_string()
            }
        })
    }
}

fn entry(directory: &str, suffix: &str) -> Option<TranslatorEntry> {
    TranslatorEntry::new(directory, suffix, IntendedFor::Unassigned).ok()
}
