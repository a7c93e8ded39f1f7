//! Durable record of the current version.
//!
//! The manifest file holds the live table set plus the next file id and the
//! next sequence number. Every install rewrites it to a temp file which is
//! fsynced and renamed over the old one, so readers of the directory see
//! either the previous complete manifest or the new one, never a partial
//! write. Payload layout (little-endian):
//!
//! ```text
//! magic u64 | next_file_id u64 | next_seq u64 | table_count u32
//! per table: file_id u64 | level u32 | min_len u32 | min_key | max_len u32 | max_key
//! crc32 of everything above
//! ```

use crate::db::key_types::{SeqNum, UserKey};
use crate::error::Error;
use crate::ioutils::{read_bytes_exact, read_u32, read_u64};
use crate::sstable::table_handle::TableReadHandle;
use crate::sstable::TableId;
use crate::version::{Version, MAX_LEVEL};
use crate::Result;
use arc_swap::ArcSwap;
use std::fs;
use std::fs::File;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const MANIFEST_FILE_NAME: &str = "MANIFEST";
const MANIFEST_TMP_NAME: &str = "MANIFEST_tmp";
const MANIFEST_MAGIC_NUMBER: u64 = 0xdb99_1122_4d41_4e49;

struct ManifestEntry {
    file_id: TableId,
    level: usize,
    min_key: UserKey,
    max_key: UserKey,
}

/// Tables added to and removed from the current version by one flush or
/// compaction. Applied atomically.
pub struct VersionEdit {
    pub added: Vec<Arc<TableReadHandle>>,
    pub removed: Vec<Arc<TableReadHandle>>,
}

/// Owner of the current [`Version`] and the manifest file.
///
/// Installs are serialized among themselves; readers grab a snapshot from
/// the atomically swapped pointer without blocking.
pub struct VersionSet {
    db_path: PathBuf,
    current: ArcSwap<Version>,
    next_file_id: AtomicU64,
    install_lock: Mutex<()>,
}

impl VersionSet {
    /// Rebuild the version state from the manifest, opening every listed
    /// table, and delete files a crash left behind: temp files and tables
    /// never installed.
    pub fn recover(db_path: &Path) -> Result<(Arc<VersionSet>, SeqNum)> {
        for level in 0..=MAX_LEVEL {
            fs::create_dir_all(db_path.join(level.to_string()))?;
        }
        let tmp_path = db_path.join(MANIFEST_TMP_NAME);
        if tmp_path.exists() {
            fs::remove_file(&tmp_path)?;
        }

        let manifest_path = db_path.join(MANIFEST_FILE_NAME);
        let (next_file_id, next_seq, entries) = if manifest_path.exists() {
            read_manifest(&manifest_path)?
        } else {
            (1, 1, Vec::new())
        };
        // ids handed out but not yet persisted must never be reissued
        let next_file_id = entries
            .iter()
            .map(|e| e.file_id + 1)
            .max()
            .unwrap_or(1)
            .max(next_file_id);

        let mut levels = vec![Vec::new(); MAX_LEVEL + 1];
        for entry in &entries {
            let handle = TableReadHandle::open_table(db_path, entry.level, entry.file_id)?;
            if handle.min_key() != &entry.min_key || handle.max_key() != &entry.max_key {
                return Err(Error::Corruption(format!(
                    "key range of table {} differs from its manifest record",
                    entry.file_id
                )));
            }
            levels[entry.level].push(Arc::new(handle));
        }
        levels[0].sort_by_key(|t: &Arc<TableReadHandle>| t.table_id());
        for level in levels.iter_mut().skip(1) {
            level.sort_by(|a, b| a.min_key().cmp(b.min_key()));
        }

        Self::remove_unreferenced_files(db_path, &entries)?;

        let version_set = Arc::new(VersionSet {
            db_path: db_path.to_path_buf(),
            current: ArcSwap::from_pointee(Version::new(levels)),
            next_file_id: AtomicU64::new(next_file_id),
            install_lock: Mutex::new(()),
        });
        Ok((version_set, next_seq))
    }

    fn remove_unreferenced_files(db_path: &Path, entries: &[ManifestEntry]) -> Result<()> {
        for level in 0..=MAX_LEVEL {
            for dir_entry in fs::read_dir(db_path.join(level.to_string()))? {
                let path = dir_entry?.path();
                let live = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.parse::<u64>().ok())
                    .map_or(false, |id| {
                        entries.iter().any(|e| e.level == level && e.file_id == id)
                    });
                if !live {
                    warn!("removing unreferenced file {:?}", path);
                    fs::remove_file(path)?;
                }
            }
        }
        Ok(())
    }

    #[inline]
    pub fn current(&self) -> Arc<Version> {
        self.current.load_full()
    }

    #[inline]
    pub fn allocate_file_id(&self) -> TableId {
        self.next_file_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Apply `edit`, persist the manifest, and swap the current version.
    ///
    /// The swap is all-or-nothing: if persisting fails, the previous
    /// version stays authoritative and nothing observable changed. Removed
    /// tables are marked for deletion; their files disappear when the last
    /// reference (old version snapshots, in-flight readers) is dropped.
    pub fn install(&self, edit: VersionEdit, next_seq: SeqNum) -> Result<Arc<Version>> {
        let _guard = self.install_lock.lock().unwrap();
        let base = self.current.load_full();

        let mut levels = base.levels().clone();
        for removed in &edit.removed {
            levels[removed.level()].retain(|t| t.table_id() != removed.table_id());
        }
        for added in &edit.added {
            levels[added.level()].push(added.clone());
        }
        levels[0].sort_by_key(|t| t.table_id());
        for level in levels.iter_mut().skip(1) {
            level.sort_by(|a, b| a.min_key().cmp(b.min_key()));
        }

        let version = Version::new(levels);
        self.write_manifest(&version, next_seq)?;

        let version = Arc::new(version);
        self.current.store(version.clone());
        for removed in &edit.removed {
            removed.ready_to_delete();
        }
        Ok(version)
    }

    fn write_manifest(&self, version: &Version, next_seq: SeqNum) -> Result<()> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MANIFEST_MAGIC_NUMBER.to_le_bytes());
        buf.extend_from_slice(&self.next_file_id.load(Ordering::SeqCst).to_le_bytes());
        buf.extend_from_slice(&next_seq.to_le_bytes());

        let table_count: u32 = version.levels().iter().map(|l| l.len() as u32).sum();
        buf.extend_from_slice(&table_count.to_le_bytes());
        for (level, tables) in version.levels().iter().enumerate() {
            for table in tables {
                buf.extend_from_slice(&table.table_id().to_le_bytes());
                buf.extend_from_slice(&(level as u32).to_le_bytes());
                buf.extend_from_slice(&(table.min_key().len() as u32).to_le_bytes());
                buf.extend_from_slice(table.min_key());
                buf.extend_from_slice(&(table.max_key().len() as u32).to_le_bytes());
                buf.extend_from_slice(table.max_key());
            }
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());

        let tmp_path = self.db_path.join(MANIFEST_TMP_NAME);
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&buf)?;
        tmp.sync_all()?;
        drop(tmp);
        fs::rename(&tmp_path, self.db_path.join(MANIFEST_FILE_NAME))?;
        Ok(())
    }
}

fn read_manifest(path: &Path) -> Result<(u64, SeqNum, Vec<ManifestEntry>)> {
    let data = fs::read(path)?;
    if data.len() < 32 {
        return Err(Error::Corruption("manifest too short".into()));
    }

    let (payload, crc_bytes) = data.split_at(data.len() - 4);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    if hasher.finalize() != u32::from_le_bytes(crc_bytes.try_into().unwrap()) {
        return Err(Error::Corruption("manifest checksum mismatch".into()));
    }

    let mut cursor = Cursor::new(payload);
    if read_u64(&mut cursor)? != MANIFEST_MAGIC_NUMBER {
        return Err(Error::Corruption("invalid manifest magic number".into()));
    }
    let next_file_id = read_u64(&mut cursor)?;
    let next_seq = read_u64(&mut cursor)?;
    let table_count = read_u32(&mut cursor)?;

    let mut entries = Vec::with_capacity(table_count as usize);
    for _ in 0..table_count {
        let file_id = read_u64(&mut cursor)?;
        let level = read_u32(&mut cursor)? as usize;
        if level > MAX_LEVEL {
            return Err(Error::Corruption(format!("invalid manifest level {}", level)));
        }
        let min_key_len = read_u32(&mut cursor)?;
        let min_key = read_bytes_exact(&mut cursor, min_key_len as u64)?;
        let max_key_len = read_u32(&mut cursor)?;
        let max_key = read_bytes_exact(&mut cursor, max_key_len as u64)?;
        entries.push(ManifestEntry {
            file_id,
            level,
            min_key,
            max_key,
        });
    }
    if cursor.position() != payload.len() as u64 {
        return Err(Error::Corruption("trailing bytes in manifest".into()));
    }
    Ok((next_file_id, next_seq, entries))
}
