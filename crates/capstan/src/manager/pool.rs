//! Index lock counting.
//!
//! Every consumer of an index snapshot (views, background jobs, the
//! manager's own base reference) holds a lock on each index it may read.
//! When the last lock on an index drops — typically after it was merged
//! away — its file is deleted. Both operations run only on the manager
//! actor.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use streamidx::index::IndexFile;

#[derive(Default)]
pub(crate) struct ReleasePool {
    counts: HashMap<PathBuf, (Arc<IndexFile>, usize)>,
}

impl ReleasePool {
    /// Increments the lock count of every index and returns the releaser
    /// list to hand back via [`release`](Self::release).
    pub fn lock(&mut self, indexes: &[Arc<IndexFile>]) -> Vec<Arc<IndexFile>> {
        for index in indexes {
            self.counts
                .entry(index.filename().to_path_buf())
                .or_insert_with(|| (index.clone(), 0))
                .1 += 1;
        }
        indexes.to_vec()
    }

    /// Decrements lock counts; an index reaching zero is removed from
    /// disk.
    pub fn release(&mut self, indexes: Vec<Arc<IndexFile>>) {
        for index in indexes {
            let path = index.filename().to_path_buf();
            let Some((_, count)) = self.counts.get_mut(&path) else {
                warn!(index = %path.display(), "released an index that was never locked");
                continue;
            };
            *count -= 1;
            if *count == 0 {
                self.counts.remove(&path);
                debug!(index = %path.display(), "last lock dropped, deleting index");
                if let Err(e) = fs::remove_file(&path) {
                    warn!(index = %path.display(), error = %e, "failed to delete index file");
                }
            }
        }
    }

    /// Sum of all outstanding locks.
    pub fn total_locks(&self) -> usize {
        self.counts.values().map(|(_, count)| count).sum()
    }
}
