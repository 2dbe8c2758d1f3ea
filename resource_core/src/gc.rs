//! Blob garbage collection.

use crate::blob::StoredBlob;
use crate::error::Result;
use crate::hash::KeyHash;
use crate::platform::Platform;
use crate::source::ResourceSource;
use crate::store::Store;
use serde::Serialize;
use std::collections::BTreeMap;

/// Statistics from a blob collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    /// Number of blobs deleted.
    pub blobs_deleted: usize,
    /// Bytes freed.
    pub bytes_freed: u64,
}

impl Store {
    /// Delete stored blobs of a resource that the log no longer references.
    ///
    /// Call after [`ResourceSource::collapse_history`] when the collapsed log
    /// is about to be persisted. Blobs are kept if their checksum is
    /// referenced by any surviving `SetBlob` statement. If `dry_run` is true,
    /// reports what would be deleted without actually deleting.
    pub fn clear_blob_history(&self, source: &ResourceSource, dry_run: bool) -> Result<GcStats> {
        // Mark phase: checksums still referenced
        let referenced = source.referenced_blobs();

        // Sweep phase: group stored revisions by slot, then drop the whole
        // slot when none of its revisions is marked
        let mut slots: BTreeMap<(KeyHash, Platform), Vec<StoredBlob>> = BTreeMap::new();
        for blob in self.blobs().list(source.id())? {
            slots.entry((blob.key, blob.platform)).or_default().push(blob);
        }

        let mut stats = GcStats::default();
        for ((key, platform), revisions) in slots {
            let unreferenced: Vec<&StoredBlob> = revisions
                .iter()
                .filter(|blob| !referenced.contains(&blob.checksum))
                .collect();
            if unreferenced.is_empty() {
                continue;
            }

            let mut size = 0;
            for blob in &unreferenced {
                size += std::fs::metadata(&blob.path)?.len();
                tracing::debug!(
                    id = %source.id(),
                    %key,
                    %platform,
                    checksum = %blob.checksum,
                    dry_run,
                    "unreferenced blob"
                );
            }
            if !dry_run {
                if unreferenced.len() == revisions.len() {
                    self.blobs().delete(source.id(), key, platform)?;
                } else {
                    for blob in &unreferenced {
                        self.blobs()
                            .remove(source.id(), key, platform, &blob.checksum)?;
                    }
                }
            }
            stats.blobs_deleted += unreferenced.len();
            stats.bytes_freed += size;
        }

        tracing::info!(
            id = %source.id(),
            deleted = stats.blobs_deleted,
            freed = stats.bytes_freed,
            dry_run,
            "cleared blob history"
        );
        Ok(stats)
    }
}
