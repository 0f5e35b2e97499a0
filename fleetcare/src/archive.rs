//! Timestamped archive folders for downloaded logs.
//!
//! A run gets one folder named `YYYY-MM-DD_HH-MM-SS[-label]` under the
//! download directory, and each device gets a subfolder inside it.
//! Folders are created atomically; if the name is taken (two runs in the
//! same second) a numeric suffix is appended, so no folder is ever reused.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Local};
use log::{debug, info};
use regex::Regex;

use crate::error::PreconditionError;

/// strftime format of the timestamp part.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

static FORBIDDEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*]"#).expect("forbidden character class is valid"));

/// Strip characters that are not allowed in folder names.
///
/// Returns `None` when nothing usable is left.
pub fn sanitize_label(label: &str) -> Option<String> {
    let cleaned = FORBIDDEN.replace_all(label, "");
    let cleaned = cleaned.trim();
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

/// Creates per-run archive folders under a base directory.
#[derive(Debug, Clone)]
pub struct ArchiveNamer {
    base: PathBuf,
}

impl ArchiveNamer {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Folder name for a timestamp and optional label.
    pub fn folder_name(label: Option<&str>, at: &DateTime<Local>) -> String {
        let stamp = at.format(TIMESTAMP_FORMAT).to_string();
        match label.and_then(sanitize_label) {
            Some(label) => format!("{stamp}-{label}"),
            None => stamp,
        }
    }

    /// Create the archive folder for a run starting now.
    pub fn create(&self, label: Option<&str>) -> Result<PathBuf, PreconditionError> {
        self.create_at(label, &Local::now())
    }

    /// Create the archive folder for a run starting at `at`.
    pub fn create_at(
        &self,
        label: Option<&str>,
        at: &DateTime<Local>,
    ) -> Result<PathBuf, PreconditionError> {
        let fail = |source| PreconditionError::ArchiveFolder {
            path: self.base.clone(),
            source,
        };

        fs::create_dir_all(&self.base).map_err(fail)?;

        let folder = claim_dir(&self.base, &Self::folder_name(label, at)).map_err(fail)?;
        info!("Created archive folder {}", folder.display());
        Ok(folder)
    }
}

/// Create `parent/name`, or `parent/name_2`, `parent/name_3`, ... when taken.
fn claim_dir(parent: &Path, name: &str) -> io::Result<PathBuf> {
    let mut candidate = parent.join(name);
    let mut attempt = 1;

    loop {
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                attempt += 1;
                debug!("{} exists, trying suffix _{attempt}", candidate.display());
                candidate = parent.join(format!("{name}_{attempt}"));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Folder name for a device. Names that sanitise to nothing, or to dots
/// only, fall back to `device`.
pub fn device_folder_name(device: &str) -> String {
    match sanitize_label(device) {
        Some(name) if !name.chars().all(|c| c == '.') => name,
        _ => "device".to_string(),
    }
}

/// Create the subfolder of an archive for one device.
///
/// Devices whose names sanitise to the same folder get numbered suffixes,
/// so two devices never share a folder within one archive.
pub fn create_device_dir(archive: &Path, device: &str) -> io::Result<PathBuf> {
    claim_dir(archive, &device_folder_name(device))
}
