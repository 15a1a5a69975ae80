//! Durable storage for FEDAO: raw input archive, master datasets, HTTP retry policy.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use fedao_core::OperationCategory;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

mod http;
mod master;

pub use http::{build_http_client, HttpClientConfig, RetryDisposition, RetryPolicy};
pub use master::{MasterStore, PersistOutcome, StoreError, WriterLock};

pub const CRATE_NAME: &str = "fedao-storage";

/// Hex SHA-256 of `bytes`.
pub fn content_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Where a raw input bundle was archived.
#[derive(Debug, Clone)]
pub struct ArchivedInput {
    /// Path under the archive root.
    pub relative_path: PathBuf,
    pub digest: String,
}

/// Archive of the raw bundles each run consumed:
///
/// ```text
/// <root>/<CAT>/<YYYY-MM-DD>/<HHMMSS>_<digest16>.<ext>
/// ```
///
/// Files are grouped by category and fetch date and never rewritten.
#[derive(Debug, Clone)]
pub struct InputArchive {
    root: PathBuf,
}

impl InputArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entry_path(
        category: OperationCategory,
        fetched_at: DateTime<Utc>,
        digest: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = match extension.trim().trim_start_matches('.') {
            "" => "bin".to_string(),
            ext => ext.to_ascii_lowercase(),
        };
        PathBuf::from(category.as_str())
            .join(fetched_at.format("%Y-%m-%d").to_string())
            .join(format!("{}_{}.{ext}", fetched_at.format("%H%M%S"), &digest[..16]))
    }

    pub async fn archive(
        &self,
        category: OperationCategory,
        fetched_at: DateTime<Utc>,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedInput> {
        let digest = content_digest(bytes);
        let relative_path = Self::entry_path(category, fetched_at, &digest, extension);
        let path = self.root.join(&relative_path);

        let exists = fs::try_exists(&path)
            .await
            .with_context(|| format!("checking archive entry {}", path.display()))?;
        let reused = exists
            || !write_atomic(&path, bytes)
                .await
                .with_context(|| format!("archiving {category} input to {}", path.display()))?;

        if reused {
            debug!(%category, path = %relative_path.display(), "input already archived");
        } else {
            info!(%category, path = %relative_path.display(), bytes = bytes.len(), "input archived");
        }
        Ok(ArchivedInput {
            relative_path,
            digest,
        })
    }
}

/// Writes `bytes` to a sibling temp file, syncs it, then renames it over `path`.
///
/// Returns `false` when a concurrent writer created `path` first and the rename lost
/// the race on a filesystem that refuses to replace existing files.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<bool> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(&temp_path).await;
            Ok(false)
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err)
        }
    }
}
