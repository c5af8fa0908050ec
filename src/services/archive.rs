use crate::error::{AppError, Result};
use regex::Regex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::OnceLock;
use zip::ZipArchive;

/// Entries of a Last.fm backup that hold scrobble lists.
const BACKUP_ENTRY_PATTERN: &str = r"^json/scrobbles/scrobbles-*";

/// Decompressed size ceiling for a single entry.
pub const MAX_ENTRY_BYTES: u64 = 64 * 1024 * 1024;

const LOCAL_FILE_HEADER: [u8; 4] = *b"PK\x03\x04";
const EMPTY_ARCHIVE_END: [u8; 4] = *b"PK\x05\x06";

fn backup_entry_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(BACKUP_ENTRY_PATTERN).expect("static pattern compiles"))
}

/// Why a single entry could not be read. Never fatal for the archive.
#[derive(Debug, thiserror::Error)]
pub enum EntryReadError {
    #[error("entry {0} could not be read: {1}")]
    Corrupt(String, String),

    #[error("entry {0} exceeds {1} bytes")]
    TooLarge(String, u64),
}

/// An uploaded zip archive opened for reading.
pub struct ImportArchive {
    archive: ZipArchive<File>,
}

impl ImportArchive {
    /// Open `path`, refusing anything without a zip signature before any
    /// entry is looked at.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;

        let mut signature = [0u8; 4];
        if file.read_exact(&mut signature).is_err() {
            return Err(AppError::InvalidArchive);
        }
        if signature != LOCAL_FILE_HEADER && signature != EMPTY_ARCHIVE_END {
            return Err(AppError::InvalidArchive);
        }
        file.seek(SeekFrom::Start(0))?;

        let archive = ZipArchive::new(file).map_err(|e| {
            tracing::debug!("Rejecting upload {}: {}", path.display(), e);
            AppError::InvalidArchive
        })?;

        Ok(Self { archive })
    }

    pub fn entry_names(&self) -> Vec<String> {
        self.archive.file_names().map(str::to_string).collect()
    }

    /// File entries following the `json/scrobbles/scrobbles-*` convention,
    /// sorted by path.
    pub fn select_backup_entries(&self) -> Vec<String> {
        let regex = backup_entry_regex();
        let mut selected: Vec<String> = self
            .archive
            .file_names()
            .filter(|name| !name.ends_with('/') && regex.is_match(name))
            .map(str::to_string)
            .collect();
        selected.sort();
        selected
    }

    pub fn read_entry(&mut self, name: &str) -> std::result::Result<Vec<u8>, EntryReadError> {
        let entry = self
            .archive
            .by_name(name)
            .map_err(|e| EntryReadError::Corrupt(name.to_string(), e.to_string()))?;

        let mut bytes = Vec::new();
        entry
            .take(MAX_ENTRY_BYTES + 1)
            .read_to_end(&mut bytes)
            .map_err(|e| EntryReadError::Corrupt(name.to_string(), e.to_string()))?;

        if bytes.len() as u64 > MAX_ENTRY_BYTES {
            return Err(EntryReadError::TooLarge(name.to_string(), MAX_ENTRY_BYTES));
        }

        Ok(bytes)
    }
}
