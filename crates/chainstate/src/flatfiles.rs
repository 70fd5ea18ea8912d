//! Segmented append-only storage for block bodies and undo records.
//!
//! Two parallel logs live in one directory: `<block>_<N><ext>` and
//! `<undo>_<N><ext>`, each written append-only and rotated once the next
//! record would cross the configured size. Segments are never rewritten, so
//! reads need no lock; the two write cursors share one.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use crate::config::Config;

#[derive(Debug)]
pub enum FlatFileError {
    Io(std::io::Error),
    RecordTooLarge(usize),
    BadLocation(&'static str),
}

impl std::fmt::Display for FlatFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlatFileError::Io(err) => write!(f, "{err}"),
            FlatFileError::RecordTooLarge(len) => {
                write!(f, "record of {len} bytes does not fit a segment")
            }
            FlatFileError::BadLocation(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for FlatFileError {}

impl From<std::io::Error> for FlatFileError {
    fn from(err: std::io::Error) -> Self {
        FlatFileError::Io(err)
    }
}

/// Where a record landed. Immutable once returned; byte ranges of distinct
/// writes never overlap.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileLocation {
    pub file_id: u32,
    pub start: u32,
    pub end: u32,
}

impl FileLocation {
    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

struct LogCursor {
    file_id: u32,
    offset: u32,
}

struct Cursors {
    blocks: LogCursor,
    undo: LogCursor,
}

pub struct FlatFileStore {
    directory: PathBuf,
    block_prefix: String,
    undo_prefix: String,
    extension: String,
    max_block_file_size: u32,
    max_undo_file_size: u32,
    cursors: Mutex<Cursors>,
}

impl FlatFileStore {
    pub fn open(config: &Config) -> Result<Self, FlatFileError> {
        fs::create_dir_all(&config.chain_writer_path)?;
        let store = Self {
            directory: config.chain_writer_path.clone(),
            block_prefix: config.block_file_name.clone(),
            undo_prefix: config.undo_file_name.clone(),
            extension: config.file_extension.clone(),
            max_block_file_size: config.max_block_file_size,
            max_undo_file_size: config.max_undo_file_size,
            cursors: Mutex::new(Cursors {
                blocks: LogCursor {
                    file_id: 0,
                    offset: 0,
                },
                undo: LogCursor {
                    file_id: 0,
                    offset: 0,
                },
            }),
        };
        {
            let mut cursors = store.lock();
            cursors.blocks = store.recover_cursor(&store.block_prefix)?;
            cursors.undo = store.recover_cursor(&store.undo_prefix)?;
        }
        Ok(store)
    }

    pub fn write_block(&self, bytes: &[u8]) -> Result<FileLocation, FlatFileError> {
        let mut cursors = self.lock();
        let max = self.max_block_file_size;
        self.append(&self.block_prefix, &mut cursors.blocks, max, bytes)
    }

    pub fn write_undo(&self, bytes: &[u8]) -> Result<FileLocation, FlatFileError> {
        let mut cursors = self.lock();
        let max = self.max_undo_file_size;
        self.append(&self.undo_prefix, &mut cursors.undo, max, bytes)
    }

    pub fn read_block(&self, location: FileLocation) -> Result<Vec<u8>, FlatFileError> {
        self.read(&self.block_prefix, location)
    }

    pub fn read_undo(&self, location: FileLocation) -> Result<Vec<u8>, FlatFileError> {
        self.read(&self.undo_prefix, location)
    }

    fn lock(&self) -> MutexGuard<'_, Cursors> {
        self.cursors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn append(
        &self,
        prefix: &str,
        cursor: &mut LogCursor,
        max_size: u32,
        bytes: &[u8],
    ) -> Result<FileLocation, FlatFileError> {
        let len =
            u32::try_from(bytes.len()).map_err(|_| FlatFileError::RecordTooLarge(bytes.len()))?;
        if cursor.offset.saturating_add(len) >= max_size {
            cursor.file_id += 1;
            cursor.offset = 0;
        }
        let path = self.segment_path(prefix, cursor.file_id);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(bytes)?;
        // the locator is handed out only once the bytes are durable, so the
        // index never points at an unwritten range
        file.sync_data()?;
        let location = FileLocation {
            file_id: cursor.file_id,
            start: cursor.offset,
            end: cursor.offset + len,
        };
        cursor.offset += len;
        Ok(location)
    }

    fn read(&self, prefix: &str, location: FileLocation) -> Result<Vec<u8>, FlatFileError> {
        if location.end < location.start {
            return Err(FlatFileError::BadLocation("locator end precedes start"));
        }
        let mut file = File::open(self.segment_path(prefix, location.file_id))?;
        file.seek(SeekFrom::Start(u64::from(location.start)))?;
        let mut buf = vec![0u8; location.len() as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Picks the write cursor back up at the end of the newest existing
    /// segment, so reopening a directory never hands out overlapping
    /// locators.
    fn recover_cursor(&self, prefix: &str) -> Result<LogCursor, FlatFileError> {
        let mut newest: Option<u32> = None;
        let lead = format!("{prefix}_");
        for entry in fs::read_dir(&self.directory)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name.strip_prefix(&lead) else {
                continue;
            };
            let Some(stem) = rest.strip_suffix(&self.extension) else {
                continue;
            };
            let Ok(file_id) = stem.parse::<u32>() else {
                continue;
            };
            newest = Some(newest.map_or(file_id, |current| current.max(file_id)));
        }
        let Some(file_id) = newest else {
            return Ok(LogCursor {
                file_id: 0,
                offset: 0,
            });
        };
        let len = fs::metadata(self.segment_path(prefix, file_id))?.len();
        let offset =
            u32::try_from(len).map_err(|_| FlatFileError::BadLocation("oversized segment"))?;
        Ok(LogCursor { file_id, offset })
    }

    fn segment_path(&self, prefix: &str, file_id: u32) -> PathBuf {
        self.directory
            .join(format!("{prefix}_{file_id}{}", self.extension))
    }
}
