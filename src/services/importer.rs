use crate::error::{AppError, Result};
use crate::models::{ImportResult, ImportStats, Listen};
use crate::services::archive::ImportArchive;
use crate::services::converter::{convert_and_validate, parse_entry, EntryOutcome};
use crate::services::listen_store::{ListenCountCache, ListenStore};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// An uploaded archive written to the upload folder. The file is removed
/// when this value is dropped, whatever the import outcome.
pub struct StagedUpload {
    file: NamedTempFile,
    writer: tokio::fs::File,
    written: usize,
    limit: usize,
}

impl StagedUpload {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        if self.written + chunk.len() > self.limit {
            return Err(AppError::SizeLimitExceeded { limit: self.limit });
        }
        self.writer.write_all(chunk).await?;
        self.written += chunk.len();
        Ok(())
    }

    /// Wait until every written chunk has reached the file.
    async fn finish(&mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn len(&self) -> usize {
        self.written
    }
}

/// What became of one archive entry once it was read and decoded.
enum DecodedEntry {
    Listens(Vec<Listen>),
    Skipped(String),
}

struct UserLockEntry {
    lock: Arc<tokio::sync::Mutex<()>>,
    /// Imports holding or waiting on `lock`.
    users: usize,
}

type UserLocks = Mutex<HashMap<String, UserLockEntry>>;

/// Registration of one import against a user's lock. Dropping it (also when
/// the import future is cancelled) removes the map entry once unused.
struct UserLockLease<'a> {
    locks: &'a UserLocks,
    user_name: String,
}

impl Drop for UserLockLease<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = locks.get_mut(&self.user_name) {
            entry.users -= 1;
            if entry.users == 0 {
                locks.remove(&self.user_name);
            }
        }
    }
}

pub struct ImportService {
    store: Arc<dyn ListenStore>,
    cache: Arc<dyn ListenCountCache>,
    upload_folder: Option<PathBuf>,
    max_content_length: usize,
    /// One lock per user so overlapping uploads from the same account run one at a time
    user_locks: UserLocks,
}

impl ImportService {
    pub fn new(
        store: Arc<dyn ListenStore>,
        cache: Arc<dyn ListenCountCache>,
        upload_folder: Option<PathBuf>,
        max_content_length: usize,
    ) -> Self {
        Self {
            store,
            cache,
            upload_folder,
            max_content_length,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_content_length(&self) -> usize {
        self.max_content_length
    }

    /// Create an empty staging file under `<upload folder>/<user>/`.
    pub async fn stage_upload(&self, user_name: &str) -> Result<StagedUpload> {
        let folder = self.upload_folder.as_ref().ok_or_else(|| {
            AppError::ConfigurationMissing("Upload folder not specified".to_string())
        })?;

        let dir = folder.join(upload_dir_name(user_name));
        tokio::fs::create_dir_all(&dir).await?;

        let file = tempfile::Builder::new()
            .prefix("upload-")
            .suffix(".zip")
            .tempfile_in(&dir)?;
        let writer = tokio::fs::File::from_std(file.reopen()?);

        Ok(StagedUpload {
            file,
            writer,
            written: 0,
            limit: self.max_content_length,
        })
    }

    /// Import a staged archive for `user_name`, consuming (and deleting) it.
    ///
    /// Entries that are not JSON lists are counted as failures and skipped.
    /// An invalid record, a storage error, or a non-zip upload aborts the
    /// run; the listen count cache is only reset when the run completes.
    pub async fn import_upload(
        &self,
        user_name: &str,
        mut upload: StagedUpload,
    ) -> Result<ImportResult> {
        let (_lease, lock) = self.lease_user_lock(user_name);
        let _guard = lock.lock_owned().await;

        let outcome = match upload.finish().await {
            Ok(()) => self.import_archive(user_name, upload.path()).await,
            Err(e) => Err(e),
        };
        drop(upload);

        let result = match outcome {
            Ok(result) => {
                self.cache.reset_listen_count(user_name).await?;
                result
            }
            Err(e) => {
                warn!("Import for {} aborted: {}", user_name, e);
                return Err(e);
            }
        };

        info!(
            "Imported listens for {}: {} files succeeded, {} failed",
            user_name, result.success, result.failure
        );
        Ok(result)
    }

    async fn import_archive(&self, user_name: &str, path: &Path) -> Result<ImportResult> {
        let path = path.to_path_buf();
        let mut archive = tokio::task::spawn_blocking(move || ImportArchive::open(&path))
            .await
            .map_err(|e| anyhow::anyhow!("Archive open task panicked: {}", e))??;

        let entries = archive.select_backup_entries();
        tracing::debug!(
            "Archive for {} has {} entries, {} scrobble pages",
            user_name,
            archive.entry_names().len(),
            entries.len()
        );
        let mut stats = ImportStats::default();

        for name in entries {
            let owner = user_name.to_string();
            let (returned, decoded) = tokio::task::spawn_blocking(move || {
                let decoded = decode_entry(&mut archive, &name, &owner);
                (archive, decoded)
            })
            .await
            .map_err(|e| anyhow::anyhow!("Entry decode task panicked: {}", e))?;
            archive = returned;

            match decoded? {
                DecodedEntry::Skipped(reason) => {
                    warn!("Skipping entry for {}: {}", user_name, reason);
                    stats.record_failure();
                }
                DecodedEntry::Listens(listens) => {
                    self.store.insert_listens(user_name, &listens).await?;
                    stats.record_success();
                }
            }
        }

        Ok(stats.into_result())
    }

    /// Register against the user's lock, creating it on first use.
    fn lease_user_lock(
        &self,
        user_name: &str,
    ) -> (UserLockLease<'_>, Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.user_locks.lock().unwrap_or_else(|e| e.into_inner());
        let entry = locks
            .entry(user_name.to_string())
            .or_insert_with(|| UserLockEntry {
                lock: Arc::new(tokio::sync::Mutex::new(())),
                users: 0,
            });
        entry.users += 1;

        let lease = UserLockLease {
            locks: &self.user_locks,
            user_name: user_name.to_string(),
        };
        (lease, entry.lock.clone())
    }
}

/// Read, parse and convert one entry. Runs on the blocking pool.
///
/// Unreadable and unparsable entries are skipped; an invalid record is an error.
fn decode_entry(archive: &mut ImportArchive, name: &str, user_name: &str) -> Result<DecodedEntry> {
    let bytes = match archive.read_entry(name) {
        Ok(bytes) => bytes,
        Err(e) => return Ok(DecodedEntry::Skipped(e.to_string())),
    };

    match parse_entry(&bytes) {
        EntryOutcome::ParseFailed(reason) => {
            Ok(DecodedEntry::Skipped(format!("{}: {}", name, reason)))
        }
        EntryOutcome::Parsed(records) => {
            let listens = convert_and_validate(records, user_name)?;
            Ok(DecodedEntry::Listens(listens))
        }
    }
}

/// Directory name for a user's staged uploads, restricted to a safe charset.
fn upload_dir_name(user_name: &str) -> String {
    let name: String = user_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if name.trim_matches('.').is_empty() {
        "_".to_string()
    } else {
        name
    }
}
