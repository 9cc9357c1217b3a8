//! File-based storage backend for persistent logs.

use crate::backend::{copy_from, IteratorOptions, Storage, StorageStream};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use fs2::FileExt;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const TAG_PUT: u8 = 1;
const TAG_DEL: u8 = 2;
/// tag (1) + key length (4) + value length (4)
const HEADER_SIZE: u64 = 9;

/// Location of a live value inside the record file.
#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: u64,
    len: u32,
}

#[derive(Debug)]
struct Inner {
    file: File,
    size: u64,
    index: BTreeMap<String, Slot>,
    closed: bool,
}

/// A file-based storage backend.
///
/// Pairs are appended to a single record file; deletes append a tombstone.
/// An in-memory index of live keys is rebuilt by scanning the file on open,
/// so data survives process restarts.
///
/// # Record Format
///
/// ```text
/// | tag: u8 | key_len: u32 LE | value_len: u32 LE | key | value |
/// ```
///
/// A torn record at the end of the file (crash during append) is truncated
/// away on open.
///
/// # Ownership
///
/// The file is locked exclusively while open; a second `open` of the same
/// path fails with [`StorageError::Locked`].
///
/// # Example
///
/// ```no_run
/// use peerlog_storage::{FileStorage, Storage};
/// use std::path::Path;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let storage = FileStorage::open(Path::new("entries.log")).unwrap();
/// storage.put("hash", b"entry".to_vec()).await.unwrap();
/// storage.close().await.unwrap();
/// # }
/// ```
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl FileStorage {
    /// Opens or creates a file storage at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, is locked by another
    /// owner, or contains an invalid record.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        file.try_lock_exclusive()
            .map_err(|e| StorageError::Locked(format!("{}: {}", path.display(), e)))?;

        let (index, size) = Self::scan(&mut file)?;

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner {
                file,
                size,
                index,
                closed: false,
            }),
        })
    }

    /// Opens or creates a file storage, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file cannot be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// Returns true if no live keys are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().index.is_empty()
    }

    /// Rebuilds the live-key index from the record file.
    fn scan(file: &mut File) -> StorageResult<(BTreeMap<String, Slot>, u64)> {
        let file_len = file.metadata()?.len();
        let mut bytes = Vec::with_capacity(file_len as usize);
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut bytes)?;

        let mut index = BTreeMap::new();
        let mut pos: u64 = 0;

        while pos + HEADER_SIZE <= file_len {
            let at = pos as usize;
            let tag = bytes[at];
            let key_len = read_u32(&bytes[at + 1..at + 5]) as u64;
            let value_len = read_u32(&bytes[at + 5..at + 9]);
            let end = pos + HEADER_SIZE + key_len + u64::from(value_len);
            if end > file_len {
                break;
            }

            let key_start = (pos + HEADER_SIZE) as usize;
            let key_end = key_start + key_len as usize;
            let key = String::from_utf8(bytes[key_start..key_end].to_vec())
                .map_err(|_| StorageError::corrupted(format!("non UTF-8 key at offset {pos}")))?;

            match tag {
                TAG_PUT => {
                    index.insert(
                        key,
                        Slot {
                            offset: key_end as u64,
                            len: value_len,
                        },
                    );
                }
                TAG_DEL => {
                    index.remove(&key);
                }
                other => {
                    return Err(StorageError::corrupted(format!(
                        "unknown record tag {other} at offset {pos}"
                    )));
                }
            }
            pos = end;
        }

        if pos < file_len {
            tracing::warn!(
                valid = pos,
                len = file_len,
                "truncating torn record at end of storage file"
            );
            file.set_len(pos)?;
        }

        Ok((index, pos))
    }

    /// Appends one record and returns the offset of its value bytes.
    fn append_record(inner: &mut Inner, tag: u8, key: &str, value: &[u8]) -> StorageResult<u64> {
        let key_len = u32::try_from(key.len())
            .map_err(|_| StorageError::backend("key longer than u32::MAX bytes"))?;
        let value_len = u32::try_from(value.len())
            .map_err(|_| StorageError::backend("value longer than u32::MAX bytes"))?;

        let mut record = Vec::with_capacity(HEADER_SIZE as usize + key.len() + value.len());
        record.push(tag);
        record.extend_from_slice(&key_len.to_le_bytes());
        record.extend_from_slice(&value_len.to_le_bytes());
        record.extend_from_slice(key.as_bytes());
        record.extend_from_slice(value);

        let value_offset = inner.size + HEADER_SIZE + u64::from(key_len);
        inner.file.seek(SeekFrom::Start(inner.size))?;
        if let Err(e) = inner.file.write_all(&record) {
            // Records end at `size`; drop whatever part of this one landed.
            if let Err(truncate) = inner.file.set_len(inner.size) {
                tracing::warn!(error = %truncate, "could not truncate partial record");
            }
            return Err(e.into());
        }
        inner.size += record.len() as u64;
        Ok(value_offset)
    }

    fn read_slot(inner: &mut Inner, slot: Slot) -> StorageResult<Vec<u8>> {
        let end = slot.offset.saturating_add(u64::from(slot.len));
        if end > inner.size {
            return Err(StorageError::corrupted(format!(
                "value at offset {} extends past end of file ({})",
                slot.offset, inner.size
            )));
        }

        let mut buffer = vec![0u8; slot.len as usize];
        if !buffer.is_empty() {
            inner.file.seek(SeekFrom::Start(slot.offset))?;
            inner.file.read_exact(&mut buffer)?;
        }
        Ok(buffer)
    }

    fn ensure_open(inner: &Inner) -> StorageResult<()> {
        if inner.closed {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

#[async_trait]
impl Storage for FileStorage {
    async fn put(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;

        let offset = Self::append_record(&mut inner, TAG_PUT, key, &value)?;
        inner.index.insert(
            key.to_string(),
            Slot {
                offset,
                len: value.len() as u32,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;

        match inner.index.get(key).copied() {
            Some(slot) => Self::read_slot(&mut inner, slot).map(Some),
            None => Ok(None),
        }
    }

    async fn del(&self, key: &str) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;

        if inner.index.contains_key(key) {
            Self::append_record(&mut inner, TAG_DEL, key, &[])?;
            inner.index.remove(key);
        }
        Ok(())
    }

    fn iterator(&self, options: IteratorOptions) -> StorageStream<'_> {
        let snapshot = {
            let mut inner = self.inner.lock();
            if let Err(e) = Self::ensure_open(&inner) {
                return stream::iter(vec![Err(e)]).boxed();
            }

            let slots: Vec<(String, Slot)> =
                inner.index.iter().map(|(k, s)| (k.clone(), *s)).collect();
            let mut pairs = Vec::with_capacity(slots.len());
            for (key, slot) in slots {
                match Self::read_slot(&mut inner, slot) {
                    Ok(value) => pairs.push((key, value)),
                    Err(e) => return stream::iter(vec![Err(e)]).boxed(),
                }
            }
            pairs
        };
        stream::iter(options.apply(snapshot).into_iter().map(Ok)).boxed()
    }

    async fn merge(&self, other: &dyn Storage) -> StorageResult<()> {
        copy_from(self, other).await
    }

    async fn clear(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;

        inner.file.set_len(0)?;
        inner.file.sync_all()?;
        inner.size = 0;
        inner.index.clear();
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }

        inner.file.flush()?;
        inner.file.sync_all()?;
        FileExt::unlock(&inner.file)?;
        inner.closed = true;
        Ok(())
    }
}
