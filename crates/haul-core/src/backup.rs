//! Pre-migration backup of the source snapshot.
//!
//! A failed backup never stops the run; the outcome records what happened
//! and the run log carries a warning.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::log::Logger;

/// What the backup stage did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackupOutcome {
    pub created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// The copy hashes identically to the source.
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Filesystem-safe timestamp: RFC 3339 with milliseconds, `:` and `.`
/// replaced by `-`.
#[must_use]
pub fn file_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

/// `<source-stem>-<timestamp>.json`
#[must_use]
pub fn backup_file_name(source: &Path, at: DateTime<Utc>) -> String {
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("source");
    format!("{stem}-{}.json", file_timestamp(at))
}

fn copy_and_hash(source: &Path, dest: &Path) -> io::Result<(u64, String, String)> {
    let bytes = fs::read(source)?;
    let source_hash = blake3::hash(&bytes).to_hex().to_string();
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(dest, &bytes)?;
    let copy_hash = blake3::hash(&fs::read(dest)?).to_hex().to_string();
    Ok((
        u64::try_from(bytes.len()).unwrap_or(u64::MAX),
        source_hash,
        copy_hash,
    ))
}

/// Copy `source` into `backup_dir` under a timestamped name.
///
/// A missing source is not reported here: the loader fails fatally right
/// after.
pub fn create_backup(
    source: &Path,
    backup_dir: &Path,
    at: DateTime<Utc>,
    log: &mut dyn Logger,
) -> BackupOutcome {
    if !source.exists() {
        log.debug(&format!("no source at {}; backup skipped", source.display()));
        return BackupOutcome {
            error: Some("source file does not exist".into()),
            ..BackupOutcome::default()
        };
    }

    let dest = backup_dir.join(backup_file_name(source, at));
    match copy_and_hash(source, &dest) {
        Ok((bytes, source_hash, copy_hash)) => {
            let verified = source_hash == copy_hash;
            if verified {
                log.info(&format!("backup created: {} ({bytes} bytes)", dest.display()));
            } else {
                log.warn(&format!(
                    "backup {} does not match source checksum (source {source_hash}, copy {copy_hash})",
                    dest.display()
                ));
            }
            BackupOutcome {
                created: true,
                path: Some(dest),
                bytes,
                hash: Some(source_hash),
                verified,
                error: None,
            }
        }
        Err(err) => {
            log.warn(&format!(
                "could not back up {} to {}: {err}; continuing without backup",
                source.display(),
                dest.display()
            ));
            BackupOutcome {
                error: Some(err.to_string()),
                ..BackupOutcome::default()
            }
        }
    }
}
