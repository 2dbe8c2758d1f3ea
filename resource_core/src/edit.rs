//! Ordered batches of property edits.
//!
//! A batch is applied front to back. Each mutating operation consumes the
//! next tick; a failed operation is skipped and reported while the rest of
//! the batch continues. Once the tick range is exhausted every remaining
//! mutating operation is skipped.

use crate::error::{Error, Result};
use crate::hash::{Hash, KeyHash};
use crate::platform::Platform;
use crate::source::{ResourceSource, Tick};
use crate::store::Store;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// A single requested edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Set `key` to an inline value.
    Set { key: String, value: String },
    /// Remove the value of `key`.
    Unset { key: String },
    /// Set `key` to the content of a file, stored as a blob.
    Blob { key: String, file: PathBuf },
    /// Switch the platform used by subsequent operations.
    Platform(Platform),
}

/// An operation that was not applied.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedOperation {
    /// Position in the batch.
    pub index: usize,
    pub key: String,
    pub reason: String,
}

/// Outcome of applying a batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EditReport {
    pub applied: usize,
    pub skipped: Vec<SkippedOperation>,
    /// Tick of the last appended statement.
    pub last_tick: Option<Tick>,
}

/// Apply `operations` to `source`, starting at `platform` and `first_tick`.
///
/// Ticks are bumped past the log's last tick so appends never regress.
pub fn apply(
    store: &Store,
    source: &mut ResourceSource,
    operations: &[Operation],
    platform: Platform,
    first_tick: Tick,
) -> EditReport {
    let mut report = EditReport::default();
    let mut platform = platform;
    let mut next_tick = match source.last_tick() {
        Some(last) if last >= first_tick => last.checked_add(1),
        _ => Some(first_tick),
    };

    for (index, operation) in operations.iter().enumerate() {
        let result = match (operation, next_tick) {
            (Operation::Platform(next), _) => {
                platform = *next;
                continue;
            }
            (_, None) => Err(Error::invalid_argument(
                "No tick left after the last statement",
            )),
            (Operation::Set { key, value }, Some(tick)) => {
                source.set(tick, KeyHash::of(key), platform, value.as_bytes())
            }
            (Operation::Unset { key }, Some(tick)) => {
                source.unset(tick, KeyHash::of(key), platform)
            }
            (Operation::Blob { key, file }, Some(tick)) => {
                apply_blob(store, source, tick, key, file, platform)
            }
        };

        match result {
            Ok(()) => {
                report.applied += 1;
                report.last_tick = next_tick;
            }
            Err(err) => {
                let key = match operation {
                    Operation::Set { key, .. }
                    | Operation::Unset { key }
                    | Operation::Blob { key, .. } => key.clone(),
                    Operation::Platform(_) => String::new(),
                };
                tracing::warn!(index, %key, error = %err, "skipped operation");
                report.skipped.push(SkippedOperation {
                    index,
                    key,
                    reason: err.to_string(),
                });
            }
        }
        next_tick = next_tick.and_then(|tick| tick.checked_add(1));
    }

    report
}

/// Store the file as a blob, then record the reference.
fn apply_blob(
    store: &Store,
    source: &mut ResourceSource,
    tick: Tick,
    key: &str,
    file: &Path,
    platform: Platform,
) -> Result<()> {
    let key_hash = KeyHash::of(key);
    let unreadable = |e: &dyn std::fmt::Display| {
        Error::blob_write_failure(key, format!("cannot read {}: {}", file.display(), e))
    };
    let checksum = Hash::hash_file(file).map_err(|e| unreadable(&e))?;

    let blobs = store.blobs();
    let size = if blobs.contains(source.id(), key_hash, platform, &checksum) {
        tracing::debug!(%key_hash, %checksum, "blob already stored");
        fs::metadata(file).map_err(|e| unreadable(&e))?.len()
    } else {
        let bytes = fs::read(file).map_err(|e| unreadable(&e))?;
        blobs
            .write(source.id(), key_hash, platform, &checksum, &bytes)
            .map_err(|e| Error::blob_write_failure(key, e.to_string()))?;
        bytes.len() as u64
    };

    source.set_blob(tick, key_hash, platform, checksum, size)
}
