//! Error types and handling
//!
//! This module provides the error types used throughout the curation engine.
//! All errors implement the `CurateErrorExt` trait which provides user-friendly
//! hints and indicates whether processing of the remaining subjects can continue
//! after the error.
//!
//! # Error Categories
//!
//! - **Configuration**: malformed translator or config file, unreadable dataset root.
//!   Raised before any filesystem mutation.
//! - **Missing dependency**: external converter or archive tool unavailable.
//! - **Placement**: guard violations and naming collisions in the output tree.
//! - **IO**: everything else the filesystem throws at us.

use std::path::PathBuf;
use thiserror::Error;

/// Trait for curation error extensions
///
/// Provides additional context for errors, including a short hint that is safe to
/// print at the end of a run and whether the error is confined to one
/// subject/session.
pub trait CurateErrorExt {
    /// Returns a user-friendly hint for the error
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors only affect the subject/session being processed; the
    /// run carries on with the next one. Non-recoverable errors abort the run.
    fn is_recoverable(&self) -> bool;
}

/// Main curation error type
///
/// # Examples
///
/// ```
/// use sdk::errors::{CurateError, CurateErrorExt};
///
/// let error = CurateError::TranslatorDecode {
///     key: "T1_MPRAGE".to_string(),
///     reason: "expected 3 elements, found 2".to_string(),
/// };
/// println!("Hint: {}", error.user_hint());
/// assert!(!error.is_recoverable());
///
/// let collision = CurateError::NameCollision("sub-01_T1w.nii.gz".to_string());
/// assert!(collision.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum CurateError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dataset root not usable: {0:?}")]
    DatasetRoot(PathBuf),

    #[error("Translator entry '{key}' is invalid: {reason}")]
    TranslatorDecode { key: String, reason: String },

    #[error("Translator file is malformed: {0}")]
    TranslatorFormat(String),

    #[error("Invalid identifier '{0}': subject and session ids cannot contain '-' or '_'")]
    InvalidIdentifier(String),

    // Missing dependency errors
    #[error("Required program not found: {0}")]
    MissingDependency(String),

    #[error("{program} {found} is older than the required {required}")]
    DependencyTooOld {
        program: String,
        found: String,
        required: String,
    },

    #[error("Conversion failed for {0:?}: {1}")]
    ConversionFailed(PathBuf, String),

    #[error("Archive unpacking failed: {0}")]
    Unpack(String),

    // Workflow state errors
    #[error("Working tree has not been converted yet: {0:?}")]
    NotConverted(PathBuf),

    #[error("Protocol translator missing: {0:?}")]
    TranslatorMissing(PathBuf),

    // Placement errors
    #[error("Refusing to write outside the dataset: {0:?}")]
    PathOutsideDataset(PathBuf),

    #[error("Refusing to write into protected directory: {0:?}")]
    PathProtected(PathBuf),

    #[error("Name collision: {0}")]
    NameCollision(String),

    #[error("Sidecar error in {0:?}: {1}")]
    Sidecar(PathBuf, String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CurateErrorExt for CurateError {
    fn user_hint(&self) -> &str {
        match self {
            // Configuration errors
            Self::Config(_) => "Check bidsmith.toml for errors",
            Self::DatasetRoot(_) => "Point --dataset at a directory containing sourcedata/",
            Self::TranslatorDecode { .. } | Self::TranslatorFormat(_) => {
                "Fix code/Protocol_Translator.json; each value must be [directory, suffix, intendedFor]"
            }
            Self::InvalidIdentifier(_) => "Rename the folder in sourcedata/ and rerun",

            // Missing dependency errors
            Self::MissingDependency(_) => "Install the missing program and make sure it is on PATH",
            Self::DependencyTooOld { .. } => "Update the converter to a newer release",
            Self::ConversionFailed(_, _) => "Check the raw data for this session",
            Self::Unpack(_) => "Check the archive contents and the tar/unzip installation",

            // Workflow state errors
            Self::NotConverted(_) => "Run the scaffold pass first",
            Self::TranslatorMissing(_) => "Run the scaffold pass and edit the translator",

            // Placement errors
            Self::PathOutsideDataset(_) => "Translator directories must be plain names like 'anat'",
            Self::PathProtected(_) => "Translator directories cannot point at sourcedata, work or code",
            Self::NameCollision(_) => "Inspect the subject directory for stray files",
            Self::Sidecar(_, _) => "Inspect the JSON sidecar in the working tree",

            // Generic IO error
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable errors
            Self::Config(_)
            | Self::DatasetRoot(_)
            | Self::TranslatorDecode { .. }
            | Self::TranslatorFormat(_)
            | Self::MissingDependency(_)
            | Self::DependencyTooOld { .. }
            | Self::TranslatorMissing(_) => false,

            // All other errors stay confined to one subject/session
            _ => true,
        }
    }
}
