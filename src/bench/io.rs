//! I/O operations for benchmark records.
//!
//! This module provides functionality to read and write benchmark
//! records to the filesystem.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::bench::record::RunRecord;
use crate::error::{PeftError, Result};

/// Records read from a directory together with the files that were skipped.
#[derive(Debug, Default)]
pub struct RecordSet {
    /// Parsed records with their source path, sorted by path.
    pub records: Vec<(PathBuf, RunRecord)>,
    /// Files that could not be read or parsed, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
}

impl RecordSet {
    /// The parsed records without their paths.
    pub fn iter(&self) -> impl Iterator<Item = &RunRecord> {
        self.records.iter().map(|(_, record)| record)
    }

    /// Number of parsed records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no record was parsed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Read one record from a JSON file.
///
/// # Errors
/// Returns an error if the file cannot be read or is not a valid record.
pub fn read_record(path: impl AsRef<Path>) -> Result<RunRecord> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .map_err(|e| PeftError::Io(format!("{}: {e}", path.display())))?;
    Ok(serde_json::from_str(&content)?)
}

/// Read every `*.json` record in `dir`, non-recursively.
///
/// Files with other extensions are ignored. Files that fail to parse are
/// logged and listed in [`RecordSet::skipped`].
///
/// # Errors
/// Returns an error if the directory cannot be listed.
pub fn read_records_dir(dir: impl AsRef<Path>) -> Result<RecordSet> {
    let dir = dir.as_ref();
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| PeftError::Io(format!("{}: {e}", dir.display())))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut set = RecordSet::default();
    for path in paths {
        match read_record(&path) {
            Ok(record) => {
                debug!(path = %path.display(), name = record.name(), "read record");
                set.records.push((path, record));
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unreadable record");
                set.skipped.push((path, err.to_string()));
            }
        }
    }
    Ok(set)
}

/// Write a record as pretty JSON.
///
/// # Errors
/// Returns an error if serialization or the write fails.
pub fn write_record(record: &RunRecord, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(record)?;
    fs::write(path, json).map_err(|e| PeftError::Io(format!("{}: {e}", path.display())))
}

/// File name for a record: the experiment name with `/` replaced by `--`.
#[must_use]
pub fn record_file_name(record: &RunRecord) -> String {
    format!("{}.json", record.name().replace('/', "--"))
}
