//! Master dataset persistence: CSV encoding, timestamped backups, atomic swap and a
//! single-writer lock per category.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use fedao_core::{DiagnosticRecord, OperationCategory, OperationRecord, TargetSchema};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::{content_digest, write_atomic};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{path} does not match the {category} schema: expected [{expected}], found [{found}]")]
    SchemaMismatch {
        path: PathBuf,
        category: OperationCategory,
        expected: String,
        found: String,
    },
    #[error("master dataset {path} is locked by another writer")]
    Locked { path: PathBuf },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn csv(path: &Path, source: csv::Error) -> Self {
        Self::Csv {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PersistOutcome {
    pub master_path: PathBuf,
    pub backup_path: Option<PathBuf>,
    pub rows: usize,
    pub bytes: usize,
}

/// Held while a category's master dataset is being merged and rewritten.
/// Dropping the guard releases the lock.
#[derive(Debug)]
pub struct WriterLock {
    path: PathBuf,
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to release writer lock");
        }
    }
}

/// Well-known on-disk layout:
///
/// ```text
/// <data_dir>/master/FEDAO_<CAT>_MASTER.csv
/// <data_dir>/master/.FEDAO_<CAT>_MASTER.csv.lock
/// <data_dir>/backups/FEDAO_<CAT>_MASTER_<YYYYmmdd_HHMMSS>_<hash8>.csv
/// <data_dir>/diagnostics/<CAT>_<YYYYmmdd_HHMMSS>.csv
/// ```
#[derive(Debug, Clone)]
pub struct MasterStore {
    data_dir: PathBuf,
    stale_lock_after: Duration,
}

impl MasterStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            stale_lock_after: Duration::from_secs(30 * 60),
        }
    }

    pub fn with_stale_lock_after(mut self, stale_lock_after: Duration) -> Self {
        self.stale_lock_after = stale_lock_after;
        self
    }

    pub fn master_path(&self, schema: &TargetSchema) -> PathBuf {
        self.data_dir.join("master").join(schema.master_file_name)
    }

    fn backup_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    fn diagnostics_dir(&self) -> PathBuf {
        self.data_dir.join("diagnostics")
    }

    fn lock_path(&self, schema: &TargetSchema) -> PathBuf {
        self.data_dir
            .join("master")
            .join(format!(".{}.lock", schema.master_file_name))
    }

    /// Takes the category's single-writer lock. A lock older than the stale
    /// threshold is assumed abandoned by a crashed run and is broken once.
    pub async fn acquire_writer_lock(&self, schema: &TargetSchema) -> Result<WriterLock, StoreError> {
        let path = self.lock_path(schema);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }

        for attempt in 0..2 {
            match create_exclusive(&path).await {
                Ok(mut file) => {
                    let stamp = format!("pid={} at={}\n", std::process::id(), Utc::now().to_rfc3339());
                    file.write_all(stamp.as_bytes())
                        .await
                        .map_err(|e| StoreError::io(&path, e))?;
                    debug!(path = %path.display(), "writer lock acquired");
                    return Ok(WriterLock { path });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if attempt == 0 && self.break_stale_lock(&path).await? {
                        continue;
                    }
                    return Err(StoreError::Locked { path });
                }
                Err(err) => return Err(StoreError::io(&path, err)),
            }
        }
        Err(StoreError::Locked { path })
    }

    /// Removes the lock at `path` if it is still stale. Writers breaking a lock take
    /// turns through a sibling `.break` file, and staleness is re-read while it is
    /// held, so a lock that another writer has just re-created is never removed.
    async fn break_stale_lock(&self, path: &Path) -> Result<bool, StoreError> {
        if !is_older_than(path, self.stale_lock_after).await {
            return Ok(false);
        }

        let breaker = breaker_path(path);
        if is_older_than(&breaker, ABANDONED_BREAKER_AFTER).await {
            warn!(path = %breaker.display(), "removing abandoned lock breaker");
            remove_if_present(&breaker).await?;
        }
        match create_exclusive(&breaker).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(err) => return Err(StoreError::io(&breaker, err)),
        }

        let broken = if is_older_than(path, self.stale_lock_after).await {
            warn!(path = %path.display(), "breaking stale writer lock");
            remove_if_present(path).await.map(|_| true)
        } else {
            Ok(false)
        };
        remove_if_present(&breaker).await?;
        broken
    }

    /// Reads the category's master dataset. A missing file is an empty dataset.
    pub async fn load(&self, schema: &TargetSchema) -> Result<Vec<OperationRecord>, StoreError> {
        let path = self.master_path(schema);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::io(&path, err)),
        };
        let records = decode_master(schema, &path, &bytes)?;
        debug!(path = %path.display(), rows = records.len(), "loaded master dataset");
        Ok(records)
    }

    /// Backs up the current master (if any) and atomically replaces it with `records`.
    /// On error the previous master is left untouched.
    pub async fn persist(
        &self,
        schema: &TargetSchema,
        records: &[OperationRecord],
        now: DateTime<Utc>,
    ) -> Result<PersistOutcome, StoreError> {
        let master_path = self.master_path(schema);
        let encoded = encode_rows(schema, &master_path, records.iter().map(|r| r.to_row(schema)))?;
        let backup_path = self.backup_current(schema, &master_path, now).await?;

        write_atomic(&master_path, &encoded)
            .await
            .map_err(|e| StoreError::io(&master_path, e))?;

        info!(
            category = %schema.category,
            path = %master_path.display(),
            rows = records.len(),
            "master dataset written"
        );
        Ok(PersistOutcome {
            master_path,
            backup_path,
            rows: records.len(),
            bytes: encoded.len(),
        })
    }

    async fn backup_current(
        &self,
        schema: &TargetSchema,
        master_path: &Path,
        now: DateTime<Utc>,
    ) -> Result<Option<PathBuf>, StoreError> {
        let current = match fs::read(master_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io(master_path, err)),
        };

        let stem = schema.master_file_name.trim_end_matches(".csv");
        let hash = content_digest(&current);
        let backup_path = self.backup_dir().join(format!(
            "{stem}_{}_{}.csv",
            now.format("%Y%m%d_%H%M%S"),
            &hash[..8]
        ));
        if fs::try_exists(&backup_path)
            .await
            .map_err(|e| StoreError::io(&backup_path, e))?
        {
            return Ok(Some(backup_path));
        }
        write_atomic(&backup_path, &current)
            .await
            .map_err(|e| StoreError::io(&backup_path, e))?;
        debug!(path = %backup_path.display(), "master backup written");
        Ok(Some(backup_path))
    }

    /// Writes placeholder rows for diagnostics that replace a category's data.
    pub async fn write_diagnostics(
        &self,
        schema: &TargetSchema,
        diagnostics: &[DiagnosticRecord],
        now: DateTime<Utc>,
    ) -> Result<PathBuf, StoreError> {
        let path = self.diagnostics_dir().join(format!(
            "{}_{}.csv",
            schema.category,
            now.format("%Y%m%d_%H%M%S")
        ));
        let encoded = encode_rows(
            schema,
            &path,
            diagnostics.iter().map(|d| d.placeholder_row(schema)),
        )?;
        write_atomic(&path, &encoded)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        Ok(path)
    }
}

/// A breaker is held only between two metadata reads and a remove.
const ABANDONED_BREAKER_AFTER: Duration = Duration::from_secs(60);

fn breaker_path(lock: &Path) -> PathBuf {
    let mut name = lock.file_name().unwrap_or_default().to_os_string();
    name.push(".break");
    lock.with_file_name(name)
}

async fn create_exclusive(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
}

async fn remove_if_present(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

/// False for missing files and for clocks that cannot be compared.
async fn is_older_than(path: &Path, age: Duration) -> bool {
    let Ok(meta) = fs::metadata(path).await else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|elapsed| elapsed >= age)
        .unwrap_or(false)
}

fn encode_rows(
    schema: &TargetSchema,
    path: &Path,
    rows: impl Iterator<Item = Vec<String>>,
) -> Result<Vec<u8>, StoreError> {
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    writer
        .write_record(schema.column_names())
        .map_err(|e| StoreError::csv(path, e))?;
    for row in rows {
        writer
            .write_record(&row)
            .map_err(|e| StoreError::csv(path, e))?;
    }
    writer
        .into_inner()
        .map_err(|e| StoreError::io(path, e.into_error()))
}

fn decode_master(
    schema: &TargetSchema,
    path: &Path,
    bytes: &[u8],
) -> Result<Vec<OperationRecord>, StoreError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(|e| StoreError::csv(path, e))?
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    let expected = schema.column_names();
    if headers.iter().map(String::as_str).ne(expected.iter().copied()) {
        return Err(StoreError::SchemaMismatch {
            path: path.to_path_buf(),
            category: schema.category,
            expected: expected.join(", "),
            found: headers.join(", "),
        });
    }

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| StoreError::csv(path, e))?;
        let values = row.iter().map(ToString::to_string).collect::<Vec<_>>();
        if DiagnosticRecord::is_placeholder_row(schema, &values) {
            warn!(path = %path.display(), "skipping diagnostic placeholder found in master");
            continue;
        }
        records.push(OperationRecord::from_row(schema, &values));
    }
    Ok(records)
}
