//! On-disk store-and-forward queue.
//!
//! One JSON file per batch under a configurable directory, named
//! `batch_<YYYYMMDD_HHMMSS>_<32-hex>.json` so that lexicographic order
//! equals chronological order. Files are written to a temp name and
//! renamed into place; a partial write never surfaces as a corrupt batch.
//! A single async mutex serializes writers within the process; the sink's
//! drain path holds it across the whole drain via [`Spool::begin`].
//! Cross-process access is not supported.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::model::{Sample, StoredBatch};

const BATCH_PREFIX: &str = "batch_";
const BATCH_SUFFIX: &str = ".json";

/// Fraction of the record cap retained after a cleanup pass.
const CLEANUP_RETAIN_RATIO: f64 = 0.8;

/// Filesystem errors in the spool. Logged by the sink and bubbled up; the
/// caller decides whether to drop or retry the batch.
#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("spool I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("spool encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Durable batch spool used while the primary sink is unhealthy.
pub struct Spool {
    dir: PathBuf,
    max_records: usize,
    lock: Mutex<()>,
}

impl std::fmt::Debug for Spool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spool")
            .field("dir", &self.dir)
            .field("max_records", &self.max_records)
            .finish_non_exhaustive()
    }
}

/// Exclusive multi-operation view of the spool, held by the sink's drain
/// path so appends are fenced for the whole drain.
pub struct SpoolGuard<'a> {
    spool: &'a Spool,
    _guard: MutexGuard<'a, ()>,
}

impl Spool {
    /// Open the spool, creating the directory if absent.
    pub fn new(dir: impl AsRef<Path>, max_records: usize) -> Result<Self, SpoolError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            max_records,
            lock: Mutex::new(()),
        })
    }

    /// Spool directory path.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one batch, returning its id. Runs the cleanup pass first so
    /// the spool stays under its record cap.
    pub async fn append(&self, samples: Vec<Sample>) -> Result<String, SpoolError> {
        let _guard = self.lock.lock().await;
        self.cleanup_if_needed_inner()?;
        self.append_inner(samples)
    }

    /// All batches in ascending filename order. Corrupt files are logged
    /// and skipped, never fatal.
    pub async fn list_batches(&self) -> Result<Vec<StoredBatch>, SpoolError> {
        let _guard = self.lock.lock().await;
        self.list_batches_inner()
    }

    /// Delete any file whose name contains the batch id.
    pub async fn delete_batch(&self, batch_id: &str) -> Result<(), SpoolError> {
        let _guard = self.lock.lock().await;
        for path in self.batch_files_sorted()? {
            if file_name(&path).contains(batch_id) {
                fs::remove_file(&path)?;
                tracing::debug!(batch_id, "Spooled batch deleted");
            }
        }
        Ok(())
    }

    /// Total number of spooled samples across all batch files.
    pub async fn total_records(&self) -> Result<usize, SpoolError> {
        let _guard = self.lock.lock().await;
        self.total_records_inner()
    }

    /// Delete every batch file.
    pub async fn clear_all(&self) -> Result<(), SpoolError> {
        let _guard = self.lock.lock().await;
        self.clear_all_inner()
    }

    /// Run the record-cap cleanup pass. Also invoked before every append.
    pub async fn cleanup_if_needed(&self) -> Result<(), SpoolError> {
        let _guard = self.lock.lock().await;
        self.cleanup_if_needed_inner()
    }

    /// Take the spool lock for a multi-operation sequence (the drain path).
    pub async fn begin(&self) -> SpoolGuard<'_> {
        SpoolGuard {
            spool: self,
            _guard: self.lock.lock().await,
        }
    }

    // --- Lock-free inner operations ---

    fn append_inner(&self, samples: Vec<Sample>) -> Result<String, SpoolError> {
        let timestamp = Utc::now();
        let batch = StoredBatch {
            batch_id: Uuid::new_v4().simple().to_string(),
            timestamp,
            tag_values: samples,
        };

        let file_name = format!(
            "{BATCH_PREFIX}{}_{}{BATCH_SUFFIX}",
            timestamp.format("%Y%m%d_%H%M%S"),
            batch.batch_id
        );
        let final_path = self.dir.join(&file_name);
        let tmp_path = self.dir.join(format!("{file_name}.tmp"));

        let encoded = serde_json::to_vec_pretty(&batch)?;
        fs::write(&tmp_path, encoded)?;
        fs::rename(&tmp_path, &final_path)?;

        tracing::info!(
            batch_id = %batch.batch_id,
            records = batch.tag_values.len(),
            file = %file_name,
            "Batch spooled"
        );
        Ok(batch.batch_id)
    }

    fn list_batches_inner(&self) -> Result<Vec<StoredBatch>, SpoolError> {
        let mut batches = Vec::new();
        for path in self.batch_files_sorted()? {
            if let Some(batch) = read_batch(&path) {
                batches.push(batch);
            }
        }
        Ok(batches)
    }

    fn total_records_inner(&self) -> Result<usize, SpoolError> {
        let mut total = 0;
        for path in self.batch_files_sorted()? {
            if let Some(batch) = read_batch(&path) {
                total += batch.tag_values.len();
            }
        }
        Ok(total)
    }

    fn clear_all_inner(&self) -> Result<(), SpoolError> {
        let mut deleted = 0;
        for path in self.batch_files_sorted()? {
            fs::remove_file(&path)?;
            deleted += 1;
        }
        if deleted > 0 {
            tracing::info!(deleted, "Spool cleared");
        }
        Ok(())
    }

    /// Enforce the record cap: when the total reaches `max_records`, delete
    /// oldest batches (filename order equals creation order) until the
    /// residual count drops to the retain ratio. Per-file granularity; the
    /// target is approximate.
    fn cleanup_if_needed_inner(&self) -> Result<(), SpoolError> {
        let files = self.batch_files_sorted()?;
        let counts: Vec<(PathBuf, usize)> = files
            .into_iter()
            .map(|p| {
                let count = read_batch(&p).map(|b| b.tag_values.len()).unwrap_or(0);
                (p, count)
            })
            .collect();

        let mut total: usize = counts.iter().map(|(_, c)| c).sum();
        if total < self.max_records {
            return Ok(());
        }

        let target = (self.max_records as f64 * CLEANUP_RETAIN_RATIO) as usize;
        let mut deleted = 0;
        for (path, count) in counts {
            if total <= target {
                break;
            }
            fs::remove_file(&path)?;
            total = total.saturating_sub(count);
            deleted += 1;
        }

        tracing::warn!(
            deleted,
            remaining_records = total,
            max_records = self.max_records,
            "Spool over capacity, oldest batches dropped"
        );
        Ok(())
    }

    fn batch_files_sorted(&self) -> Result<Vec<PathBuf>, SpoolError> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                let name = file_name(p);
                name.starts_with(BATCH_PREFIX) && name.ends_with(BATCH_SUFFIX)
            })
            .collect();
        files.sort_by_key(|p| file_name(p).to_string());
        Ok(files)
    }
}

impl SpoolGuard<'_> {
    pub fn list_batches(&self) -> Result<Vec<StoredBatch>, SpoolError> {
        self.spool.list_batches_inner()
    }

    pub fn clear_all(&self) -> Result<(), SpoolError> {
        self.spool.clear_all_inner()
    }

    pub fn total_records(&self) -> Result<usize, SpoolError> {
        self.spool.total_records_inner()
    }
}

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

fn read_batch(path: &Path) -> Option<StoredBatch> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(file = %path.display(), error = %e, "Unreadable batch file, skipping");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(batch) => Some(batch),
        Err(e) => {
            tracing::warn!(file = %path.display(), error = %e, "Corrupt batch file, skipping");
            None
        }
    }
}
