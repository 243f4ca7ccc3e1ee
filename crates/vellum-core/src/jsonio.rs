//! Whole-file JSON persistence with write-then-rename.
//!
//! Every persisted state file in vellum (manifests, trend store, hash
//! index, cost report) is rewritten whole. Writing to a temp sibling and
//! renaming keeps the file readable at every instant, so a crash mid-write
//! never leaves a torn JSON document behind.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Reads and deserializes a JSON file.
///
/// # Errors
///
/// Filesystem failures map to [`Error::Filesystem`]; malformed JSON maps to
/// [`Error::Serialization`].
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path).map_err(|e| Error::filesystem(path, &e))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::Serialization {
        message: format!("{}: {e}", path.display()),
    })
}

/// Serializes a value and writes it atomically.
///
/// The parent directory is created when missing. The value lands in a
/// `.tmp` sibling first and is renamed into place.
///
/// # Errors
///
/// Filesystem failures map to [`Error::Filesystem`].
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::filesystem(parent, &e))?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes).map_err(|e| Error::filesystem(&tmp, &e))?;
    std::fs::rename(&tmp, path).map_err(|e| Error::filesystem(path, &e))?;
    Ok(())
}

/// Appends one JSON line to an NDJSON log file, creating it when missing.
///
/// # Errors
///
/// Filesystem failures map to [`Error::Filesystem`].
pub fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::filesystem(parent, &e))?;
    }
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::filesystem(path, &e))?;
    file.write_all(&line)
        .map_err(|e| Error::filesystem(path, &e))?;
    Ok(())
}
