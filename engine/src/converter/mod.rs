//! External converter and archive tools
//!
//! Raw sessions in `sourcedata/` are converted into image + sidecar pairs
//! under `work/` by an external program. Every external program goes through
//! [`ToolRunner`]: an allowlist of program names, execve-style invocation with
//! no shell, stdin closed and output captured.

use crate::dataset::{sorted_subdirs, DatasetLayout, SessionKey};
use regex::Regex;
use sdk::errors::{CurateError, CurateErrorExt};
use std::cell::Cell;
use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

/// Output name template: `<subject>--<description>--<sequence>--<series>`.
pub const FILENAME_TEMPLATE: &str = "%n--%d--%q--%s";

const VERSION_PATTERN: &str = r"v(\d+)\.(\d+)\.(\d+)";

/// Converter release such as `v1.0.20220720`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConverterVersion {
    pub major: u32,
    pub minor: u32,
    pub release: u32,
}

impl ConverterVersion {
    /// Find the first version string in `text`.
    pub fn parse(text: &str) -> Option<Self> {
        let pattern = Regex::new(VERSION_PATTERN).ok()?;
        let caps = pattern.captures(text)?;
        Some(Self {
            major: caps[1].parse().ok()?,
            minor: caps[2].parse().ok()?,
            release: caps[3].parse().ok()?,
        })
    }
}

impl fmt::Display for ConverterVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.release)
    }
}

/// Runs allowlisted external programs.
///
/// # Gates
/// 1. The program's file name must be on the allowlist
/// 2. Shells are never run, whatever the allowlist says
///
/// Programs are started directly with separate arguments, stdin set to null
/// and stdout/stderr piped.
#[derive(Debug, Clone)]
pub struct ToolRunner {
    allowlist: HashSet<String>,
}

impl Default for ToolRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRunner {
    /// Runner allowing the converter and the archive tools.
    pub fn new() -> Self {
        Self::with_allowlist(["dcm2niix", "tar", "unzip"])
    }

    pub fn with_allowlist<I, S>(programs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowlist: programs.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allow(&mut self, program: impl Into<String>) {
        self.allowlist.insert(program.into());
    }

    fn program_name(program: &Path) -> String {
        program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Check a program against the gates without running it.
    pub fn validate(&self, program: &Path) -> Result<(), CurateError> {
        let name = Self::program_name(program);
        if matches!(name.as_str(), "sh" | "bash" | "zsh" | "fish") {
            return Err(CurateError::Config(format!(
                "refusing to run shell '{}'",
                name
            )));
        }
        if !self.allowlist.contains(&name) {
            return Err(CurateError::Config(format!(
                "program '{}' is not on the tool allowlist",
                name
            )));
        }
        Ok(())
    }

    /// Run a program to completion and capture its output.
    ///
    /// # Errors
    ///
    /// `CurateError::MissingDependency` when the program cannot be found.
    pub fn run<S: AsRef<OsStr>>(&self, program: &Path, args: &[S]) -> Result<Output, CurateError> {
        self.validate(program)?;

        tracing::debug!(
            "Running {} {}",
            program.display(),
            args.iter()
                .map(|a| a.as_ref().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(" ")
        );

        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => {
                    CurateError::MissingDependency(program.display().to_string())
                }
                _ => CurateError::Io(e),
            })
    }
}

/// Converts one raw session directory into image + sidecar pairs.
pub trait Converter {
    /// Installed version of the converter.
    fn version(&self) -> Result<ConverterVersion, CurateError>;

    /// Convert everything under `source` into `output`.
    fn convert(&self, source: &Path, output: &Path) -> Result<(), CurateError>;
}

/// The `dcm2niix` converter.
///
/// With a minimum version set, the installed release is checked once, on the
/// first conversion.
#[derive(Debug, Clone)]
pub struct Dcm2niix {
    program: PathBuf,
    compression: String,
    anonymize: bool,
    minimum: Option<ConverterVersion>,
    version_checked: Cell<bool>,
    runner: ToolRunner,
}

impl Dcm2niix {
    pub fn new(program: PathBuf, compression: impl Into<String>, anonymize: bool) -> Self {
        let mut runner = ToolRunner::new();
        runner.allow(ToolRunner::program_name(&program));
        Self {
            program,
            compression: compression.into(),
            anonymize,
            minimum: None,
            version_checked: Cell::new(false),
            runner,
        }
    }

    pub fn with_minimum_version(mut self, minimum: ConverterVersion) -> Self {
        self.minimum = Some(minimum);
        self
    }

    /// Fail unless the installed converter is at least `minimum`.
    pub fn require_version(&self, minimum: ConverterVersion) -> Result<ConverterVersion, CurateError> {
        let found = self.version()?;
        if found < minimum {
            return Err(CurateError::DependencyTooOld {
                program: self.program.display().to_string(),
                found: found.to_string(),
                required: minimum.to_string(),
            });
        }
        tracing::info!("{} {} detected", self.program.display(), found);
        Ok(found)
    }

    fn arguments(&self, source: &Path, output: &Path) -> Vec<OsString> {
        vec![
            "-b".into(),
            "y".into(),
            "-ba".into(),
            (if self.anonymize { "y" } else { "n" }).into(),
            "-z".into(),
            self.compression.clone().into(),
            "-f".into(),
            FILENAME_TEMPLATE.into(),
            "-o".into(),
            output.as_os_str().to_os_string(),
            source.as_os_str().to_os_string(),
        ]
    }
}

impl Converter for Dcm2niix {
    fn version(&self) -> Result<ConverterVersion, CurateError> {
        // Run without arguments the program prints its usage, version included
        let no_args: [&str; 0] = [];
        let output = self.runner.run(&self.program, &no_args)?;
        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        ConverterVersion::parse(&text).ok_or_else(|| {
            CurateError::MissingDependency(format!(
                "{} (version not detected)",
                self.program.display()
            ))
        })
    }

    fn convert(&self, source: &Path, output: &Path) -> Result<(), CurateError> {
        if let Some(minimum) = self.minimum {
            if !self.version_checked.get() {
                self.require_version(minimum)?;
                self.version_checked.set(true);
            }
        }

        fs::create_dir_all(output)?;
        let result = self.runner.run(&self.program, &self.arguments(source, output))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let tail = stderr.lines().last().unwrap_or_default().to_string();
            if dir_is_empty(output)? {
                return Err(CurateError::ConversionFailed(source.to_path_buf(), tail));
            }
            tracing::warn!(
                "{} exited with {} for {}: {}",
                self.program.display(),
                result.status,
                source.display(),
                tail
            );
        }
        Ok(())
    }
}

fn dir_is_empty(dir: &Path) -> Result<bool, CurateError> {
    Ok(fs::read_dir(dir)?.next().is_none())
}

/// Result of [`convert_sessions`].
#[derive(Debug, Default)]
pub struct ConversionReport {
    pub converted: Vec<SessionKey>,
    /// Sessions whose working directory already held output
    pub skipped: Vec<SessionKey>,
    /// Label (subject or subject/session) and the error it hit
    pub failed: Vec<(String, CurateError)>,
}

/// Convert every raw session that has no working output yet.
///
/// Session-level failures are collected in the report; errors that would
/// affect every session (missing converter, unreadable sourcedata) are returned.
pub fn convert_sessions(
    layout: &DatasetLayout,
    converter: &dyn Converter,
    use_sessions: bool,
    subjects: Option<&[String]>,
) -> Result<ConversionReport, CurateError> {
    layout.require_sourcedata()?;
    let mut report = ConversionReport::default();

    for key in layout.source_sessions(use_sessions, subjects)? {
        let key = match key {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!("Skipping source folder: {}", e);
                report.failed.push((e.to_string(), e));
                continue;
            }
        };

        let output = layout.work_session_dir(&key);
        if output.is_dir() && !dir_is_empty(&output)? {
            tracing::debug!("{} already converted", key);
            report.skipped.push(key);
            continue;
        }

        tracing::info!("Converting {}", key);
        match converter.convert(&layout.source_session_dir(&key), &output) {
            Ok(()) => report.converted.push(key),
            Err(e) if e.is_recoverable() => {
                tracing::error!("Conversion of {} failed: {}", key, e);
                report.failed.push((key.to_string(), e));
            }
            Err(e) => return Err(e),
        }
    }

    Ok(report)
}

/// Result of [`unpack_archives`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct UnpackReport {
    pub archives: Vec<PathBuf>,
    pub subjects: Vec<String>,
    pub zips: Vec<PathBuf>,
}

/// Folder names the archive export tool nests subjects under.
const EXPORT_ROOTS: &[&str] = &["flywheel", "scitran"];

/// Unpack `flywheel_*.tar` exports in the dataset root into `sourcedata/`.
///
/// Each archive is extracted, its `<root>/<group>/<project>/<subject>`
/// folders are lifted to `sourcedata/<subject>` (existing subjects are left
/// alone), the export root is removed, and session zip files are extracted in
/// place and deleted.
pub fn unpack_archives(
    layout: &DatasetLayout,
    runner: &ToolRunner,
) -> Result<UnpackReport, CurateError> {
    let sourcedata = layout.sourcedata();
    fs::create_dir_all(&sourcedata)?;
    let mut report = UnpackReport::default();

    let mut archives: Vec<PathBuf> = fs::read_dir(layout.root())?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("flywheel_") && n.ends_with(".tar"))
        })
        .collect();
    archives.sort();

    if archives.is_empty() {
        tracing::warn!("No flywheel_*.tar archives found in {}", layout.root().display());
        return Ok(report);
    }

    for archive in archives {
        tracing::info!("Unpacking {} to {}", archive.display(), sourcedata.display());
        let args = [
            OsString::from("xf"),
            archive.as_os_str().to_os_string(),
            OsString::from("-C"),
            sourcedata.as_os_str().to_os_string(),
        ];
        check_status(runner.run(Path::new("tar"), &args)?, &archive)?;
        report.subjects.extend(lift_subjects(&sourcedata)?);
        report.archives.push(archive);

        for zip in session_zips(&sourcedata)? {
            tracing::info!("Unzipping {}", zip.display());
            let dir = zip.parent().unwrap_or(sourcedata.as_path()).to_path_buf();
            let args = [
                OsString::from("-qq"),
                zip.as_os_str().to_os_string(),
                OsString::from("-d"),
                dir.into_os_string(),
            ];
            check_status(runner.run(Path::new("unzip"), &args)?, &zip)?;
            fs::remove_file(&zip)?;
            report.zips.push(zip);
        }
    }

    Ok(report)
}

fn check_status(output: Output, input: &Path) -> Result<(), CurateError> {
    if output.status.success() {
        return Ok(());
    }
    Err(CurateError::Unpack(format!(
        "{}: {}",
        input.display(),
        String::from_utf8_lossy(&output.stderr).trim()
    )))
}

/// Move `<export root>/*/*/<subject>` folders up to `sourcedata/<subject>`
/// and delete the export root. Returns the subjects that were moved.
pub fn lift_subjects(sourcedata: &Path) -> Result<Vec<String>, CurateError> {
    let Some(export_root) = EXPORT_ROOTS
        .iter()
        .map(|name| sourcedata.join(name))
        .find(|path| path.is_dir())
    else {
        return Err(CurateError::Unpack(format!(
            "neither {} exists after extraction",
            EXPORT_ROOTS
                .iter()
                .map(|n| format!("sourcedata/{}", n))
                .collect::<Vec<_>>()
                .join(" nor ")
        )));
    };

    let mut moved = Vec::new();
    for group in sorted_subdirs(&export_root)? {
        let group_dir = export_root.join(group);
        for project in sorted_subdirs(&group_dir)? {
            let project_dir = group_dir.join(project);
            for subject in sorted_subdirs(&project_dir)? {
                let dest = sourcedata.join(&subject);
                if dest.exists() {
                    tracing::warn!("Subject folder {} already exists, skipping", dest.display());
                    continue;
                }
                fs::rename(project_dir.join(&subject), &dest)?;
                moved.push(subject);
            }
        }
    }

    fs::remove_dir_all(&export_root)?;
    Ok(moved)
}

/// `sourcedata/*/*/*/*.zip`, sorted.
fn session_zips(sourcedata: &Path) -> Result<Vec<PathBuf>, CurateError> {
    let mut zips = Vec::new();
    for entry in walkdir::WalkDir::new(sourcedata)
        .min_depth(4)
        .max_depth(4)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Error accessing entry: {}", e);
                continue;
            }
        };
        if entry.file_type().is_file()
            && entry.path().extension().is_some_and(|ext| ext == "zip")
        {
            zips.push(entry.into_path());
        }
    }
    Ok(zips)
}
