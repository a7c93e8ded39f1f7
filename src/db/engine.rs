use crate::compact::{start_compaction_task, CompactionContext};
use crate::db::db_iter::Scan;
use crate::db::key_types::{SeqNum, UserKey, Value};
use crate::db::options::Options;
use crate::error::Error;
use crate::memory::{BTreeMemTable, MemTable};
use crate::sstable::table_handle::TableReadHandle;
use crate::version::{VersionEdit, VersionSet};
use crate::wal::WriteAheadLog;
use crate::Result;
use crossbeam_channel::{Receiver, Sender};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Recovering = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl EngineState {
    fn from_u8(value: u8) -> EngineState {
        match value {
            0 => EngineState::Recovering,
            1 => EngineState::Active,
            2 => EngineState::Closing,
            _ => EngineState::Closed,
        }
    }
}

/// Single-writer LSM engine: WAL for durability, a mutable write buffer
/// for visibility, sorted tables behind a version snapshot for everything
/// flushed, background tasks for flush and compaction.
pub struct LsmKV<M: MemTable = BTreeMemTable> {
    db_path: PathBuf,
    opts: Arc<Options>,
    state: AtomicU8,
    /// Monotonic over the whole engine lifetime, recovered on open as
    /// `max(manifest.next_seq, max replayed seq + 1)`.
    next_seq: Arc<AtomicU64>,
    pub(crate) wal: Arc<Mutex<WriteAheadLog>>,
    pub(crate) mut_mem: RwLock<M>,
    pub(crate) imm_mem: Arc<RwLock<Option<M>>>,
    pub(crate) versions: Arc<VersionSet>,
    flush_running: Arc<AtomicBool>,
    flush_sender: Option<Sender<u64>>,
    flush_handle: Option<JoinHandle<()>>,
    compact_sender: Option<Sender<bool>>,
    compact_handle: Option<JoinHandle<()>>,
}

impl<M: MemTable + 'static> LsmKV<M> {
    pub fn open(db_path: impl AsRef<Path>) -> Result<LsmKV<M>> {
        Self::open_with_options(db_path, Options::default())
    }

    pub fn open_with_options(db_path: impl AsRef<Path>, opts: Options) -> Result<LsmKV<M>> {
        let db_path = db_path.as_ref().to_path_buf();
        fs::create_dir_all(&db_path)?;

        let (versions, manifest_next_seq) = VersionSet::recover(&db_path)?;
        let (wal, records) = WriteAheadLog::open(&db_path)?;

        let mut mem = M::default();
        let mut max_seq = 0;
        let record_count = records.len();
        for record in records {
            max_seq = max_seq.max(record.seq);
            match record.value {
                Some(value) => mem.put(record.key, record.seq, value),
                None => mem.delete(record.key, record.seq),
            }
        }
        let next_seq = Arc::new(AtomicU64::new(manifest_next_seq.max(max_seq + 1)));
        info!(
            "recovered {} wal records, next sequence number {}",
            record_count,
            next_seq.load(Ordering::SeqCst)
        );

        let opts = Arc::new(opts);
        let wal = Arc::new(Mutex::new(wal));
        let imm_mem: Arc<RwLock<Option<M>>> = Arc::new(RwLock::new(None));
        let flush_running = Arc::new(AtomicBool::new(false));

        let (compact_sender, compact_receiver) = crossbeam_channel::unbounded();
        let compact_handle = start_compaction_task(
            CompactionContext {
                db_path: db_path.clone(),
                opts: opts.clone(),
                versions: versions.clone(),
                next_seq: next_seq.clone(),
            },
            compact_receiver,
        );

        let (flush_sender, flush_receiver) = crossbeam_channel::unbounded();
        let flush_handle = Self::start_flush_task(
            db_path.clone(),
            opts.clone(),
            versions.clone(),
            wal.clone(),
            imm_mem.clone(),
            flush_running.clone(),
            next_seq.clone(),
            compact_sender.clone(),
            flush_receiver,
        );

        // recovered levels may already be over a threshold
        let _ = compact_sender.send(true);

        Ok(LsmKV {
            db_path,
            opts,
            state: AtomicU8::new(EngineState::Active as u8),
            next_seq,
            wal,
            mut_mem: RwLock::new(mem),
            imm_mem,
            versions,
            flush_running,
            flush_sender: Some(flush_sender),
            flush_handle: Some(flush_handle),
            compact_sender: Some(compact_sender),
            compact_handle: Some(compact_handle),
        })
    }

    pub fn put(&self, key: UserKey, value: Value) -> Result<()> {
        self.write(key, Some(value))
    }

    pub fn delete(&self, key: UserKey) -> Result<()> {
        self.write(key, None)
    }

    fn write(&self, key: UserKey, value: Option<Value>) -> Result<()> {
        self.check_active()?;

        // The WAL lock is the single-writer point. It is held across the
        // buffer insert so a concurrent freeze cannot rotate the log
        // between the append and the insert, which would strand an
        // acknowledged record in a deletable generation.
        let mut wal_guard = self.wal.lock().unwrap();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        wal_guard.append(seq, &key, value.as_deref(), self.opts.sync_writes)?;

        let mut mem_guard = self.mut_mem.write().unwrap();
        match value {
            Some(value) => mem_guard.put(key, seq, value),
            None => mem_guard.delete(key, seq),
        }

        if mem_guard.is_full(self.opts.write_buffer_size_bytes)
            && !self.flush_running.load(Ordering::Acquire)
        {
            self.freeze(&mut wal_guard, mem_guard)?;
        }
        Ok(())
    }

    /// Rotate the WAL and move the full buffer into the immutable slot,
    /// then hand it to the flush task. The caller holds the WAL lock and
    /// the buffer write lock.
    fn freeze(&self, wal: &mut WriteAheadLog, mut mem_guard: RwLockWriteGuard<M>) -> Result<()> {
        self.flush_running.store(true, Ordering::Release);
        let frozen_gen = wal.rotate()?;
        let imm = std::mem::take(&mut *mem_guard);
        // publish to the immutable slot before releasing the buffer lock,
        // so no reader can observe the records in neither place
        *self.imm_mem.write().unwrap() = Some(imm);
        drop(mem_guard);
        if let Some(sender) = &self.flush_sender {
            if sender.send(frozen_gen).is_err() {
                warn!("flush task is gone; the buffer will be recovered from its log");
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &UserKey) -> Result<Option<Value>> {
        self.check_active()?;

        // query the mutable memory table
        {
            let mem_guard = self.mut_mem.read().unwrap();
            if let Some(value) = mem_guard.get(key) {
                return Ok(value);
            }
        }
        // query the immutable memory table
        {
            let imm_guard = self.imm_mem.read().unwrap();
            if let Some(imm) = imm_guard.as_ref() {
                if let Some(value) = imm.get(key) {
                    return Ok(value);
                }
            }
        }
        // query the tables of the current version
        match self.versions.current().get(key)? {
            Some(value) => Ok(value),
            None => Ok(None),
        }
    }

    /// Lazy ascending scan over `[start, end)`. The returned iterator owns
    /// a version snapshot, so concurrent flushes and compactions never
    /// invalidate it.
    pub fn scan(&self, start: &UserKey, end: &UserKey) -> Result<Scan> {
        self.check_active()?;
        Scan::new(self, start, end)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn close(&mut self) -> Result<()> {
        self.shutdown();
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn start_flush_task(
        db_path: PathBuf,
        opts: Arc<Options>,
        versions: Arc<VersionSet>,
        wal: Arc<Mutex<WriteAheadLog>>,
        imm_mem: Arc<RwLock<Option<M>>>,
        flush_running: Arc<AtomicBool>,
        next_seq: Arc<AtomicU64>,
        compact_sender: Sender<bool>,
        receiver: Receiver<u64>,
    ) -> JoinHandle<()> {
        thread::Builder::new()
            .name("level0 flush".to_owned())
            .spawn(move || {
                info!("flush task start");
                while let Ok(frozen_gen) = receiver.recv() {
                    // a started flush must complete: its log is deleted
                    // only on success
                    let mut attempt = 0;
                    loop {
                        match Self::flush_imm(
                            &db_path, &opts, &versions, &wal, &imm_mem, &next_seq, frozen_gen,
                        ) {
                            Ok(()) => {
                                flush_running.store(false, Ordering::Release);
                                let _ = compact_sender.send(true);
                                break;
                            }
                            Err(e) => {
                                attempt += 1;
                                if attempt >= 3 {
                                    // nothing acknowledged is lost: the log
                                    // generation stays on disk and replays
                                    // on the next open
                                    error!("flush failed after {} attempts: {}", attempt, e);
                                    break;
                                }
                                warn!("flush failed (attempt {}): {}", attempt, e);
                                thread::sleep(Duration::from_millis(100));
                            }
                        }
                    }
                }
                info!("flush task exit");
            })
            .unwrap()
    }

    /// Write the immutable buffer as one level-0 table, record it in the
    /// manifest, then delete the log generations it came from.
    fn flush_imm(
        db_path: &Path,
        opts: &Options,
        versions: &VersionSet,
        wal: &Mutex<WriteAheadLog>,
        imm_mem: &RwLock<Option<M>>,
        next_seq: &AtomicU64,
        frozen_gen: u64,
    ) -> Result<()> {
        {
            let imm_guard = imm_mem.read().unwrap();
            let imm = match imm_guard.as_ref() {
                Some(imm) => imm,
                None => return Ok(()),
            };
            if !imm.is_empty() {
                let table = Self::write_level0_table(db_path, opts, versions, imm)?;
                let table_id = table.table_id();
                let installed = versions.install(
                    VersionEdit {
                        added: vec![table.clone()],
                        removed: vec![],
                    },
                    next_seq.load(Ordering::SeqCst),
                );
                if let Err(e) = installed {
                    // not in the manifest: remove the file instead of
                    // leaving an orphan for the next recovery
                    table.ready_to_delete();
                    return Err(e);
                }
                info!("flushed write buffer to level-0 table {}", table_id);
            }
        }
        {
            let wal_guard = wal.lock().unwrap();
            wal_guard.remove_logs_upto(frozen_gen)?;
        }
        *imm_mem.write().unwrap() = None;
        Ok(())
    }

    fn write_level0_table(
        db_path: &Path,
        opts: &Options,
        versions: &VersionSet,
        imm: &M,
    ) -> Result<Arc<TableReadHandle>> {
        use crate::sstable::table_handle::TableWriteHandle;

        let table_id = versions.allocate_file_id();
        let mut handle = TableWriteHandle::new(db_path, 0, table_id, imm.len(), opts)?;

        // ascending (key, seq): the last version in each run is the newest
        // and the only one anything outside the buffer could have observed
        let mut pending: Option<(UserKey, SeqNum, Option<Value>)> = None;
        for (ikey, value) in imm.iter() {
            match &mut pending {
                Some((key, seq, pending_value)) if *key == ikey.user_key => {
                    *seq = ikey.seq;
                    *pending_value = value.clone();
                }
                _ => {
                    if let Some((key, seq, value)) = pending.take() {
                        handle.add(key, seq, value)?;
                    }
                    pending = Some((ikey.user_key.clone(), ikey.seq, value.clone()));
                }
            }
        }
        if let Some((key, seq, value)) = pending {
            handle.add(key, seq, value)?;
        }
        handle.finish()?;
        Ok(Arc::new(TableReadHandle::from_table_write_handle(handle)?))
    }
}

impl<M: MemTable> LsmKV<M> {
    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn check_active(&self) -> Result<()> {
        match self.state() {
            EngineState::Active => Ok(()),
            _ => Err(Error::Closed),
        }
    }

    fn shutdown(&mut self) {
        if self.state() == EngineState::Closed {
            return;
        }
        self.state.store(EngineState::Closing as u8, Ordering::SeqCst);

        // dropping the sender lets the flush task drain its queue and exit
        drop(self.flush_sender.take());
        if let Some(handle) = self.flush_handle.take() {
            let _ = handle.join();
        }
        // pending compaction checks are processed before the stop sentinel
        if let Some(sender) = self.compact_sender.take() {
            let _ = sender.send(false);
        }
        if let Some(handle) = self.compact_handle.take() {
            let _ = handle.join();
        }
        if let Ok(mut wal_guard) = self.wal.lock() {
            if let Err(e) = wal_guard.sync() {
                error!("wal sync on close failed: {}", e);
            }
        }
        self.state.store(EngineState::Closed as u8, Ordering::SeqCst);
        info!("engine closed");
    }
}

impl<M: MemTable> Drop for LsmKV<M> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use crate::db::engine::{EngineState, LsmKV};
    use crate::db::options::Options;
    use crate::memory::BTreeMemTable;
    use crate::version::MAX_LEVEL;

    fn small_options() -> Options {
        Options {
            write_buffer_size_bytes: 4096,
            table_size_bytes: 8192,
            sync_writes: false,
            ..Options::default()
        }
    }

    #[test]
    fn test_put_get_delete() {
        let _ = env_logger::try_init();
        let temp_dir = tempfile::TempDir::new().unwrap();

        let db = LsmKV::<BTreeMemTable>::open(temp_dir.path()).unwrap();
        assert_eq!(db.state(), EngineState::Active);

        db.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        db.put(b"a".to_vec(), b"2".to_vec()).unwrap();
        assert_eq!(db.get(&b"a".to_vec()).unwrap(), Some(b"2".to_vec()));

        db.delete(b"a".to_vec()).unwrap();
        assert_eq!(db.get(&b"a".to_vec()).unwrap(), None);
        assert_eq!(db.get(&b"never".to_vec()).unwrap(), None);
    }

    #[test]
    fn test_recover_from_log_without_flush() {
        let _ = env_logger::try_init();
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path();

        {
            // default buffer size: nothing flushes, everything stays in
            // the log and the write buffer
            let db = LsmKV::<BTreeMemTable>::open(path).unwrap();
            for i in 0..100 {
                db.put(
                    format!("key{}", i).into_bytes(),
                    format!("value{}", i).into_bytes(),
                )
                .unwrap();
            }
            db.delete(b"key7".to_vec()).unwrap();
        }

        let db = LsmKV::<BTreeMemTable>::open(path).unwrap();
        for i in 0..100 {
            let expected = if i == 7 {
                None
            } else {
                Some(format!("value{}", i).into_bytes())
            };
            assert_eq!(db.get(&format!("key{}", i).into_bytes()).unwrap(), expected);
        }
    }

    #[test]
    fn test_tombstone_survives_flush_and_restart() {
        let _ = env_logger::try_init();
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path();

        {
            let db = LsmKV::<BTreeMemTable>::open_with_options(path, small_options()).unwrap();
            db.put(b"a".to_vec(), b"1".to_vec()).unwrap();
            db.delete(b"a".to_vec()).unwrap();
            // force flushes past the tiny buffer threshold
            for i in 0..500 {
                db.put(
                    format!("filler{:04}", i).into_bytes(),
                    vec![b'x'; 64],
                )
                .unwrap();
            }
            assert_eq!(db.get(&b"a".to_vec()).unwrap(), None);
        }

        let db = LsmKV::<BTreeMemTable>::open_with_options(path, small_options()).unwrap();
        assert_eq!(db.get(&b"a".to_vec()).unwrap(), None);
        assert_eq!(
            db.get(&b"filler0499".to_vec()).unwrap(),
            Some(vec![b'x'; 64])
        );
    }

    #[test]
    fn test_closed_engine_rejects_operations() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let mut db = LsmKV::<BTreeMemTable>::open(temp_dir.path()).unwrap();
        db.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        db.close().unwrap();
        assert_eq!(db.state(), EngineState::Closed);
        assert!(db.put(b"b".to_vec(), b"2".to_vec()).is_err());
        assert!(db.get(&b"a".to_vec()).is_err());
    }

    #[test]
    fn test_scan_merges_buffer_and_tables() {
        let _ = env_logger::try_init();
        let temp_dir = tempfile::TempDir::new().unwrap();

        let db =
            LsmKV::<BTreeMemTable>::open_with_options(temp_dir.path(), small_options()).unwrap();
        for i in 0..300 {
            db.put(
                format!("key{:04}", i).into_bytes(),
                format!("value{}", i).into_bytes(),
            )
            .unwrap();
        }
        // overwrite and delete after some data has been flushed
        db.put(b"key0010".to_vec(), b"fresh".to_vec()).unwrap();
        db.delete(b"key0011".to_vec()).unwrap();

        let items: Vec<_> = db
            .scan(&b"key0010".to_vec(), &b"key0015".to_vec())
            .unwrap()
            .collect::<crate::Result<Vec<_>>>()
            .unwrap();
        assert_eq!(
            items,
            vec![
                (b"key0010".to_vec(), b"fresh".to_vec()),
                (b"key0012".to_vec(), b"value12".to_vec()),
                (b"key0013".to_vec(), b"value13".to_vec()),
                (b"key0014".to_vec(), b"value14".to_vec()),
            ]
        );

        // empty and inverted ranges
        assert_eq!(db.scan(&b"x".to_vec(), &b"x".to_vec()).unwrap().count(), 0);
        assert_eq!(db.scan(&b"z".to_vec(), &b"a".to_vec()).unwrap().count(), 0);
    }

    #[test]
    fn test_compaction_keeps_levels_in_shape() {
        let _ = env_logger::try_init();
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path();

        {
            let db = LsmKV::<BTreeMemTable>::open_with_options(path, small_options()).unwrap();
            for i in 0..10000 {
                db.put(
                    format!("key{:05}", i).into_bytes(),
                    format!("value{}", i).into_bytes(),
                )
                .unwrap();
            }
            // close drains pending flushes and compaction triggers
        }

        let db = LsmKV::<BTreeMemTable>::open_with_options(path, small_options()).unwrap();
        let version = db.versions.current();
        assert!(version.level0_count() <= small_options().level0_compaction_trigger_count);
        let mut table_count = 0;
        for level in 1..=MAX_LEVEL {
            let tables = version.level_tables(level);
            table_count += tables.len();
            for pair in tables.windows(2) {
                assert!(
                    pair[0].max_key() < pair[1].min_key(),
                    "overlap in level {}",
                    level
                );
            }
        }
        assert!(table_count > 0, "compaction never ran");

        for i in (0..10000).step_by(97) {
            assert_eq!(
                db.get(&format!("key{:05}", i).into_bytes()).unwrap(),
                Some(format!("value{}", i).into_bytes()),
                "key{:05}",
                i
            );
        }
    }
}
