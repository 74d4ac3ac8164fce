//! Configuration management
//!
//! This module handles loading and validation of the bidsmith configuration.
//! Configuration is stored in TOML format next to the translator, at
//! `<dataset>/code/bidsmith.toml`, or at any path given with `--config`.
//! A missing file means defaults for every value.
//!
//! # Configuration Sections
//!
//! - **core**: log level
//! - **curation**: session handling, auto-fill, fieldmap binding, cleanup
//! - **keys**: optional filename entities (echo, part, rec)
//! - **converter**: external converter program and options
//!
//! # Examples
//!
//! ```no_run
//! use bidsmith_engine::config::Config;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_for_dataset(Path::new("/data/study"))?;
//! println!("Sessions: {}", config.curation.use_sessions);
//! println!("Converter: {:?}", config.converter.program);
//! # Ok(())
//! # }
//! ```

use crate::converter::ConverterVersion;
use sdk::errors::CurateError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// File name of the per-dataset configuration inside `code/`.
pub const CONFIG_FILE_NAME: &str = "bidsmith.toml";

/// Main configuration structure
///
/// Every section is optional in the file; missing values take their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Core settings
    #[serde(default)]
    pub core: CoreConfig,

    /// Curation behaviour
    #[serde(default)]
    pub curation: CurationConfig,

    /// Optional filename keys
    #[serde(default)]
    pub keys: KeysConfig,

    /// External converter
    #[serde(default)]
    pub converter: ConverterConfig,
}

/// Core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Curation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurationConfig {
    /// Treat `sourcedata/<subject>/<session>/` as sessions. When false every
    /// subject folder is a single unnamed session.
    #[serde(default = "default_true")]
    pub use_sessions: bool,

    /// Propose translator entries for new protocols from their names
    #[serde(default)]
    pub auto_translate: bool,

    /// Bind fieldmaps to bold series by acquisition time instead of the translator
    #[serde(default)]
    pub bind_fieldmaps: bool,

    /// Drop IntendedFor entries that point at missing files after curation
    #[serde(default = "default_true")]
    pub prune_intended_for: bool,

    /// Remove the working tree after a fully successful curation pass
    #[serde(default)]
    pub clean_work_dir: bool,

    /// Converter compression flag: y/o/i (gzip) or n (plain .nii)
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Create an `_events.tsv` template for every bold series
    #[serde(default = "default_true")]
    pub events_templates: bool,
}

/// Optional filename keys
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeysConfig {
    /// Add `echo-<n>` from the EchoNumber sidecar field
    #[serde(default)]
    pub echo: bool,

    /// Add `part-mag` / `part-phase` from the recon suffix
    #[serde(default)]
    pub part: bool,

    /// Add `rec-norm` / `rec-bias` from ImageType
    #[serde(default)]
    pub recon: bool,
}

/// External converter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConverterConfig {
    /// Converter executable, looked up on PATH unless it contains a separator
    #[serde(default = "default_converter_program")]
    pub program: PathBuf,

    /// Oldest accepted converter release
    #[serde(default = "default_min_version")]
    pub min_version: String,

    /// Strip identifying fields from sidecars
    #[serde(default = "default_true")]
    pub anonymize: bool,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_compression() -> String {
    "o".to_string()
}

fn default_converter_program() -> PathBuf {
    PathBuf::from("dcm2niix")
}

fn default_min_version() -> String {
    "v1.0.20220720".to_string()
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for CurationConfig {
    fn default() -> Self {
        Self {
            use_sessions: true,
            auto_translate: false,
            bind_fieldmaps: false,
            prune_intended_for: true,
            clean_work_dir: false,
            compression: default_compression(),
            events_templates: true,
        }
    }
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            program: default_converter_program(),
            min_version: default_min_version(),
            anonymize: true,
        }
    }
}

impl CurationConfig {
    /// Image extension produced by the converter under the configured compression.
    pub fn image_extension(&self) -> &'static str {
        if self.compression == "n" {
            ".nii"
        } else {
            ".nii.gz"
        }
    }
}

impl Config {
    /// Path of the per-dataset configuration file.
    pub fn default_config_path(dataset_root: &Path) -> PathBuf {
        dataset_root.join("code").join(CONFIG_FILE_NAME)
    }

    /// Load the configuration stored in a dataset, or defaults if there is none.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, parsed or validated.
    pub fn load_for_dataset(dataset_root: &Path) -> Result<Self, CurateError> {
        let config_path = Self::default_config_path(dataset_root);

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            let mut config = Self::default();
            config.validate_and_process()?;
            Ok(config)
        }
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_from_path(path: &Path) -> Result<Self, CurateError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| CurateError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| CurateError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Write the default configuration to `path` unless a file is already there.
    ///
    /// Returns whether a file was written.
    pub fn write_default_if_missing(path: &Path) -> Result<bool, CurateError> {
        if path.exists() {
            return Ok(false);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                CurateError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let toml_string = toml::to_string_pretty(&Self::default())
            .map_err(|e| CurateError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| CurateError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(true)
    }

    /// Validate and process configuration
    ///
    /// This method:
    /// - Validates the log level and compression flag
    /// - Checks the minimum converter version parses
    /// - Expands ~ in the converter path
    fn validate_and_process(&mut self) -> Result<(), CurateError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(CurateError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        let valid_compression = ["y", "o", "i", "n"];
        if !valid_compression.contains(&self.curation.compression.as_str()) {
            return Err(CurateError::Config(format!(
                "Invalid compression '{}'. Must be one of: {}",
                self.curation.compression,
                valid_compression.join(", ")
            )));
        }

        if ConverterVersion::parse(&self.converter.min_version).is_none() {
            return Err(CurateError::Config(format!(
                "Invalid converter min_version '{}'. Expected something like v1.0.20220720",
                self.converter.min_version
            )));
        }

        if self.converter.program.as_os_str().is_empty() {
            return Err(CurateError::Config(
                "converter program must not be empty".to_string(),
            ));
        }
        self.converter.program = expand_path(&self.converter.program)?;

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, CurateError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| CurateError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| CurateError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| CurateError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}
