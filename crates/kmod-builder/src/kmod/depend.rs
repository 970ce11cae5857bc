//! File-based change detection for compile and link steps.
//!
//! A step is described by its input files (plus optional string values such
//! as the command line) and the artifact it produces. The last successful run
//! is recorded in a small JSON state file next to the target's scratch dirs.

use std::fs;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::modules::util::write_json_pretty;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStamp {
    pub secs: i64,
    pub nanos: u32,
}

impl FileStamp {
    pub fn of(path: &Path) -> Option<Self> {
        let meta = fs::metadata(path).ok()?;
        let t = FileTime::from_last_modification_time(&meta);
        Some(Self {
            secs: t.unix_seconds(),
            nanos: t.nanoseconds(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependState {
    pub fingerprint: String,
    pub artifact_mtime: Option<FileStamp>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct DependInputs {
    pub files: Vec<PathBuf>,
    pub values: Vec<String>,
    pub artifact: PathBuf,
    pub force: bool,
}

/// sha256 over the sorted `(path, size, mtime)` of every input file, then the
/// extra values in order.
pub fn fingerprint(files: &[PathBuf], values: &[String]) -> String {
    let mut sorted: Vec<&PathBuf> = files.iter().collect();
    sorted.sort();
    sorted.dedup();

    let mut hasher = Sha256::new();
    for f in sorted {
        hasher.update(f.to_string_lossy().as_bytes());
        hasher.update(b"\0");
        match fs::metadata(f) {
            Ok(meta) => {
                let t = FileTime::from_last_modification_time(&meta);
                hasher.update(meta.len().to_le_bytes());
                hasher.update(t.unix_seconds().to_le_bytes());
                hasher.update(t.nanoseconds().to_le_bytes());
            }
            Err(_) => hasher.update(b"missing"),
        }
        hasher.update(b"\n");
    }
    for v in values {
        hasher.update(b"value\0");
        hasher.update(v.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

pub fn load_state(dep_file: &Path) -> Option<DependState> {
    let raw = fs::read_to_string(dep_file).ok()?;
    match serde_json::from_str(&raw) {
        Ok(state) => Some(state),
        Err(e) => {
            tracing::warn!(file = %dep_file.display(), error = %e, "ignoring unreadable dependency state");
            None
        }
    }
}

/// Why `f` has to run, or `None` when the artifact is up to date.
pub fn stale_reason(
    state: Option<&DependState>,
    fingerprint: &str,
    inputs: &DependInputs,
) -> Option<&'static str> {
    if inputs.force {
        return Some("forced");
    }
    let Some(state) = state else {
        return Some("no previous state");
    };
    if state.fingerprint != fingerprint {
        return Some("inputs changed");
    }
    let Some(current) = FileStamp::of(&inputs.artifact) else {
        return Some("artifact missing");
    };
    if state.artifact_mtime != Some(current) {
        return Some("artifact modified");
    }
    None
}

/// Run `f` only when the artifact is out of date. Returns whether `f` ran.
///
/// The new state is recorded only after `f` succeeds.
pub fn on_changed<F>(dep_file: &Path, inputs: &DependInputs, f: F) -> Result<bool>
where
    F: FnOnce() -> Result<()>,
{
    let fp = fingerprint(&inputs.files, &inputs.values);
    let previous = load_state(dep_file);
    let Some(reason) = stale_reason(previous.as_ref(), &fp, inputs) else {
        tracing::debug!(artifact = %inputs.artifact.display(), "up to date");
        return Ok(false);
    };
    tracing::debug!(artifact = %inputs.artifact.display(), reason, "out of date");

    f()?;

    let state = DependState {
        fingerprint: fp,
        artifact_mtime: FileStamp::of(&inputs.artifact),
        updated_at: chrono::Utc::now().to_rfc3339(),
    };
    let v = serde_json::to_value(&state)
        .map_err(|e| Error::msg(format!("dependency state encode failed: {e}")))?;
    write_json_pretty(dep_file, &v)?;
    Ok(true)
}
