//! File-backed substrate
//!
//! Layout: `<data_dir>/substrate.log`, an append-only sequence of frames.
//!
//! - Every commit appends one frame and fsyncs before returning
//! - Acknowledgment before fsync is forbidden
//! - On open, frames are replayed in order into the in-memory tables
//! - A torn final frame is truncated away (it was never acknowledged)
//! - A checksum failure anywhere before the tail is FATAL corruption
//!
//! Deletes and overwrites only append, so the log keeps growing until
//! `rewrite_log` folds it down to one frame per table through a temporary
//! file and an atomic rename. `log_usage` tells callers when that pays off.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use super::errors::{StoreError, StoreResult};
use super::frame::{decode_frame, encode_frame, FrameRead};
use super::table::{Table, Tables, WriteBatch};
use super::{KvBackend, LogUsage};
use crate::observability::Logger;

const LOG_FILE: &str = "substrate.log";
const LOG_TMP_FILE: &str = "substrate.log.tmp";

/// Statistics gathered while replaying the log on open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Frames applied
    pub frames: u64,
    /// Bytes discarded from a torn tail
    pub truncated_bytes: u64,
}

/// Durable substrate backend.
#[derive(Debug)]
pub struct FileBackend {
    dir: PathBuf,
    log: Mutex<File>,
    tables: RwLock<Tables>,
    replay: ReplayStats,
    /// Current log length; written under the log lock
    log_len: AtomicU64,
}

impl FileBackend {
    /// Opens or creates the substrate under `dir`, replaying the log.
    pub fn open(dir: &Path) -> StoreResult<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            StoreError::io(format!("create substrate dir {}", dir.display()), e)
        })?;

        let path = dir.join(LOG_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(format!("open {}", path.display()), e))?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| StoreError::io(format!("read {}", path.display()), e))?;

        let (tables, replay, valid_len) = Self::replay(&data)?;

        if replay.truncated_bytes > 0 {
            Logger::warn(
                "SUBSTRATE_TORN_TAIL",
                &[
                    ("path", &path.display().to_string()),
                    ("truncated_bytes", &replay.truncated_bytes.to_string()),
                ],
            );
            file.set_len(valid_len as u64)
                .map_err(|e| StoreError::io("truncate torn tail", e))?;
            file.sync_all()
                .map_err(|e| StoreError::io("fsync after truncation", e))?;
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            log: Mutex::new(file),
            tables: RwLock::new(tables),
            replay,
            log_len: AtomicU64::new(valid_len as u64),
        })
    }

    fn replay(data: &[u8]) -> StoreResult<(Tables, ReplayStats, usize)> {
        let mut tables = Tables::new();
        let mut stats = ReplayStats::default();
        let mut offset = 0usize;

        while offset < data.len() {
            match decode_frame(&data[offset..]) {
                FrameRead::Complete(batch, used) => {
                    tables.apply(&batch);
                    stats.frames += 1;
                    offset += used;
                }
                FrameRead::Torn => {
                    stats.truncated_bytes = (data.len() - offset) as u64;
                    return Ok((tables, stats, offset));
                }
                FrameRead::Corrupt(reason) => {
                    // The last frame may have been partially overwritten by a
                    // crash; anything before it was acknowledged.
                    let declared = frame_extent(&data[offset..]);
                    if offset + declared == data.len() {
                        stats.truncated_bytes = declared as u64;
                        return Ok((tables, stats, offset));
                    }
                    return Err(StoreError::Corruption {
                        offset: offset as u64,
                        reason,
                    });
                }
            }
        }
        Ok((tables, stats, offset))
    }

    /// Replay statistics from open.
    pub fn replay_stats(&self) -> ReplayStats {
        self.replay
    }

    /// Path of the active log.
    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }
}

/// Declared length of the frame at the head of `data`, clamped to the buffer.
fn frame_extent(data: &[u8]) -> usize {
    if data.len() < 4 {
        return data.len();
    }
    let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    (super::frame::FRAME_HEADER_LEN + len).min(data.len())
}

/// fsync a directory so a rename is durable.
fn fsync_dir(path: &Path) -> StoreResult<()> {
    let dir = File::open(path)
        .map_err(|e| StoreError::io(format!("open dir {}", path.display()), e))?;
    dir.sync_all()
        .map_err(|e| StoreError::io(format!("fsync dir {}", path.display()), e))
}

impl KvBackend for FileBackend {
    fn get(&self, table: Table, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let tables = self.tables.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(tables.get(table, key))
    }

    fn range(
        &self,
        table: Table,
        start: &[u8],
        end: Option<&[u8]>,
    ) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let tables = self.tables.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(tables.range(table, start, end))
    }

    fn last_in_range(
        &self,
        table: Table,
        start: &[u8],
        end: &[u8],
    ) -> StoreResult<Option<(Vec<u8>, Vec<u8>)>> {
        let tables = self.tables.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(tables.last_in_range(table, start, end))
    }

    fn commit(&self, batch: &WriteBatch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let frame = encode_frame(batch);

        let mut log = self.log.lock().map_err(|_| StoreError::LockPoisoned)?;
        log.write_all(&frame)
            .map_err(|e| StoreError::io("append substrate frame", e))?;
        // fsync is mandatory before the batch becomes visible
        log.sync_data()
            .map_err(|e| StoreError::io("fsync substrate frame", e))?;
        self.log_len.fetch_add(frame.len() as u64, Ordering::SeqCst);

        let mut tables = self.tables.write().map_err(|_| StoreError::LockPoisoned)?;
        tables.apply(batch);
        Ok(())
    }

    fn count(&self, table: Table) -> StoreResult<usize> {
        let tables = self.tables.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(tables.count(table))
    }

    fn log_usage(&self) -> StoreResult<Option<LogUsage>> {
        let _log = self.log.lock().map_err(|_| StoreError::LockPoisoned)?;
        let tables = self.tables.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(Some(LogUsage {
            log_bytes: self.log_len.load(Ordering::SeqCst),
            live_bytes: tables.encoded_size(),
        }))
    }

    /// Rewrite the log so it holds exactly the current table contents.
    fn rewrite_log(&self) -> StoreResult<()> {
        let mut log = self.log.lock().map_err(|_| StoreError::LockPoisoned)?;
        let tables = self.tables.read().map_err(|_| StoreError::LockPoisoned)?;

        let live = tables.encoded_size();
        let tmp_path = self.dir.join(LOG_TMP_FILE);
        let final_path = self.dir.join(LOG_FILE);

        let mut tmp = File::create(&tmp_path)
            .map_err(|e| StoreError::io(format!("create {}", tmp_path.display()), e))?;
        for table in Table::ALL {
            let mut batch = WriteBatch::new();
            for (t, k, v) in tables.iter_all() {
                if t == table {
                    batch.put(t, k.clone(), v.clone());
                }
            }
            if !batch.is_empty() {
                tmp.write_all(&encode_frame(&batch))
                    .map_err(|e| StoreError::io("write rewritten log", e))?;
            }
        }
        tmp.sync_all()
            .map_err(|e| StoreError::io("fsync rewritten log", e))?;
        drop(tmp);

        fs::rename(&tmp_path, &final_path)
            .map_err(|e| StoreError::io("rename rewritten log", e))?;
        fsync_dir(&self.dir)?;

        *log = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&final_path)
            .map_err(|e| StoreError::io(format!("reopen {}", final_path.display()), e))?;
        self.log_len.store(live, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn put(table: Table, key: &[u8], value: &[u8]) -> WriteBatch {
        let mut batch = WriteBatch::new();
        batch.put(table, key.to_vec(), value.to_vec());
        batch
    }

    #[test]
    fn test_commit_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let backend = FileBackend::open(dir.path()).unwrap();
            backend.commit(&put(Table::Meta, b"a", b"1")).unwrap();
            backend.commit(&put(Table::Meta, b"b", b"2")).unwrap();
        }
        let backend = FileBackend::open(dir.path()).unwrap();
        assert_eq!(backend.replay_stats().frames, 2);
        assert_eq!(backend.get(Table::Meta, b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        {
            let backend = FileBackend::open(dir.path()).unwrap();
            backend.commit(&put(Table::Meta, b"a", b"1")).unwrap();
        }
        // Simulate a crash halfway through the next append
        let frame = encode_frame(&put(Table::Meta, b"b", b"2"));
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(LOG_FILE))
            .unwrap();
        file.write_all(&frame[..frame.len() / 2]).unwrap();
        drop(file);

        let backend = FileBackend::open(dir.path()).unwrap();
        assert!(backend.replay_stats().truncated_bytes > 0);
        assert_eq!(backend.get(Table::Meta, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(backend.get(Table::Meta, b"b").unwrap(), None);

        // The log accepts new frames after truncation
        backend.commit(&put(Table::Meta, b"c", b"3")).unwrap();
        drop(backend);
        let backend = FileBackend::open(dir.path()).unwrap();
        assert_eq!(backend.replay_stats().truncated_bytes, 0);
        assert_eq!(backend.get(Table::Meta, b"c").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn test_mid_log_corruption_is_fatal() {
        let dir = TempDir::new().unwrap();
        {
            let backend = FileBackend::open(dir.path()).unwrap();
            backend.commit(&put(Table::Meta, b"a", b"1")).unwrap();
            backend.commit(&put(Table::Meta, b"b", b"2")).unwrap();
        }
        let path = dir.path().join(LOG_FILE);
        let mut data = fs::read(&path).unwrap();
        data[10] ^= 0xFF;
        fs::write(&path, data).unwrap();

        let err = FileBackend::open(dir.path()).unwrap_err();
        assert!(matches!(err, StoreError::Corruption { .. }));
    }

    #[test]
    fn test_rewrite_log_preserves_contents() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        for i in 0..10u8 {
            backend.commit(&put(Table::KeyHistory, &[i], &[i])).unwrap();
        }
        let mut batch = WriteBatch::new();
        batch.delete(Table::KeyHistory, vec![0u8]);
        backend.commit(&batch).unwrap();

        let before = backend.log_usage().unwrap().unwrap();
        assert!(before.dead_bytes() > 0);
        backend.rewrite_log().unwrap();
        let after = backend.log_usage().unwrap().unwrap();
        assert_eq!(after.log_bytes, after.live_bytes);
        assert_eq!(fs::metadata(backend.log_path()).unwrap().len(), after.log_bytes);
        assert!(after.log_bytes < before.log_bytes);

        backend.commit(&put(Table::Meta, b"after", b"rewrite")).unwrap();
        drop(backend);

        let backend = FileBackend::open(dir.path()).unwrap();
        assert_eq!(backend.count(Table::KeyHistory).unwrap(), 9);
        assert_eq!(backend.get(Table::Meta, b"after").unwrap(), Some(b"rewrite".to_vec()));
    }
}
