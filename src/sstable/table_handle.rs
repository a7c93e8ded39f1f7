use crate::bloom::BloomFilter;
use crate::db::key_types::{InternalKey, SeqNum, UserKey, Value};
use crate::db::options::Options;
use crate::error::Error;
use crate::ioutils::{BufReaderWithPos, BufWriterWithPos};
use crate::sstable::data_block::DataBlock;
use crate::sstable::filter_block::{load_filter_block, write_filter_block};
use crate::sstable::footer::Footer;
use crate::sstable::index_block::IndexBlock;
use crate::sstable::{sstable_path, temp_file_name, TableId};
use crate::Result;
use std::fs;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum TableStatus {
    /// Normally store in disk.
    Store,
    /// The table is merging to the next level.
    Compacting,
    /// Remove file when the last handle reference is dropped.
    ToDelete,
}

/// Handle of new sstable for single-thread writing.
///
/// Writes go to `<file>_write`; the file only becomes visible under its
/// final name through [`TableReadHandle::from_table_write_handle`]. An
/// unrenamed handle removes its temp file on drop, so an aborted write
/// leaves nothing the manifest could reference.
pub struct TableWriteHandle {
    pub(crate) file_path: PathBuf,
    level: usize,
    table_id: TableId,
    renamed: bool,
    pub(crate) writer: TableWriter,
}

impl TableWriteHandle {
    pub fn new(
        db_path: &Path,
        level: usize,
        table_id: TableId,
        kv_estimate: usize,
        opts: &Options,
    ) -> Result<TableWriteHandle> {
        let file_path = sstable_path(db_path, level, table_id);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(temp_file_name(&file_path))?;
        let writer = TableWriter::new(BufWriterWithPos::new(file)?, kv_estimate, opts);

        Ok(TableWriteHandle {
            file_path,
            level,
            table_id,
            renamed: false,
            writer,
        })
    }

    /// Append one entry. Input must be strictly ascending by user key
    /// (tables hold one version per key); a violation is a contract defect.
    pub fn add(&mut self, key: UserKey, seq: SeqNum, value: Option<Value>) -> Result<()> {
        self.writer.add(key, seq, value)
    }

    /// Flush the last data block, write index, filter and footer, and fsync.
    pub fn finish(&mut self) -> Result<()> {
        self.writer.finish()
    }

    /// Bytes written so far plus the buffered partial block; used to split
    /// compaction output.
    pub fn approx_file_size(&self) -> u64 {
        self.writer.writer.pos + self.writer.data.len() as u64
    }

    fn rename(&mut self) -> Result<()> {
        fs::rename(temp_file_name(&self.file_path), &self.file_path)?;
        self.renamed = true;
        Ok(())
    }

    #[inline]
    pub fn level(&self) -> usize {
        self.level
    }

    #[inline]
    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    #[inline]
    pub fn kv_count(&self) -> u64 {
        self.writer.kv_count
    }
}

impl Drop for TableWriteHandle {
    fn drop(&mut self) {
        if !self.renamed {
            let _ = fs::remove_file(temp_file_name(&self.file_path));
        }
    }
}

pub(crate) struct TableWriter {
    data: Vec<u8>,
    index_block: IndexBlock,
    pub(crate) writer: BufWriterWithPos<File>,
    filter: BloomFilter,
    kv_count: u64,
    last_key: UserKey,
    block_size: usize,
}

impl TableWriter {
    fn new(writer: BufWriterWithPos<File>, kv_estimate: usize, opts: &Options) -> TableWriter {
        TableWriter {
            data: Vec::with_capacity(opts.data_block_size_bytes + 256),
            index_block: IndexBlock::default(),
            writer,
            filter: BloomFilter::create_filter(kv_estimate.max(1), opts.bloom_bits_per_key),
            kv_count: 0,
            last_key: UserKey::default(),
            block_size: opts.data_block_size_bytes,
        }
    }

    fn add(&mut self, key: UserKey, seq: SeqNum, value: Option<Value>) -> Result<()> {
        if self.kv_count > 0 && key <= self.last_key {
            return Err(Error::Format(format!(
                "table input not strictly ascending: {:?} after {:?}",
                key, self.last_key
            )));
        }
        self.filter.add(&key);
        if self.kv_count == 0 {
            self.index_block.min_key = key.clone();
        }
        DataBlock::encode_into(&mut self.data, &key, seq, value.as_ref());
        self.kv_count += 1;
        self.last_key = key;
        if self.data.len() >= self.block_size {
            self.flush_data()?;
        }
        Ok(())
    }

    fn flush_data(&mut self) -> Result<()> {
        let offset = self.writer.pos;
        self.writer.write_all(&self.data)?;
        self.index_block
            .add_index(offset, self.data.len() as u64, self.last_key.clone());
        self.data.clear();
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if !self.data.is_empty() {
            self.flush_data()?;
        }
        if self.kv_count == 0 {
            return Err(Error::Format("attempt to finish an empty table".into()));
        }

        let index_block_offset = self.writer.pos;
        self.index_block.write_to_file(&mut self.writer)?;
        let index_block_length = self.writer.pos - index_block_offset;

        let filter_offset = self.writer.pos;
        write_filter_block(&self.filter, &mut self.writer)?;

        let footer = Footer {
            index_block_offset,
            index_block_length,
            filter_offset,
            filter_length: self.filter.block_len(),
            kv_total: self.kv_count,
        };
        footer.write_to_file(&mut self.writer)?;
        self.writer.flush()?;
        self.writer.sync_data()?;
        Ok(())
    }
}

/// Shared, immutable handle to one on-disk table.
///
/// The file is unlinked in `Drop` once the status is `ToDelete`, so a table
/// removed from the current version survives until every in-flight reader
/// and old version snapshot has released its reference.
pub struct TableReadHandle {
    file_path: PathBuf,
    level: usize,
    table_id: TableId,
    status: RwLock<TableStatus>,
    corrupt: AtomicBool,
    min_key: UserKey,
    max_key: UserKey,
    kv_total: u64,
    file_size: u64,
}

impl TableReadHandle {
    /// Create a table handle for an existing sstable.
    pub fn open_table(db_path: &Path, level: usize, table_id: TableId) -> Result<TableReadHandle> {
        let file_path = sstable_path(db_path, level, table_id);
        let file = File::open(&file_path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReaderWithPos::new(file)?;

        let footer = Footer::load_footer(&mut reader)?;
        let index_block = IndexBlock::load_index(&mut reader, &footer)?;
        if index_block.indexes.is_empty() {
            return Err(Error::Corruption("table has an empty index block".into()));
        }

        Ok(TableReadHandle {
            file_path,
            level,
            table_id,
            status: RwLock::new(TableStatus::Store),
            corrupt: AtomicBool::new(false),
            max_key: index_block.max_key().clone(),
            min_key: index_block.min_key,
            kv_total: footer.kv_total,
            file_size,
        })
    }

    /// Create a handle from a finished write handle, renaming the temp file
    /// to its final name.
    pub(crate) fn from_table_write_handle(mut handle: TableWriteHandle) -> Result<TableReadHandle> {
        let file_size = handle.writer.writer.pos;
        debug_assert!(file_size > 0);
        handle.rename()?;

        Ok(TableReadHandle {
            file_path: handle.file_path.clone(),
            level: handle.level,
            table_id: handle.table_id,
            status: RwLock::new(TableStatus::Store),
            corrupt: AtomicBool::new(false),
            min_key: handle.writer.index_block.min_key.clone(),
            max_key: handle.writer.index_block.max_key().clone(),
            kv_total: handle.writer.kv_count,
            file_size,
        })
    }

    fn new_reader(&self) -> Result<BufReaderWithPos<File>> {
        BufReaderWithPos::new(File::open(&self.file_path)?)
    }

    /// Point lookup: bloom filter first, then the index, then one data
    /// block. A corruption error marks the table so later reads skip it.
    pub fn query(&self, key: &UserKey) -> Result<Option<(SeqNum, Option<Value>)>> {
        let result = self.query_inner(key);
        if let Err(e) = &result {
            self.note_corruption(e);
        }
        result
    }

    fn query_inner(&self, key: &UserKey) -> Result<Option<(SeqNum, Option<Value>)>> {
        let mut reader = self.new_reader()?;
        let footer = Footer::load_footer(&mut reader)?;
        let filter = load_filter_block(footer.filter_offset, footer.filter_length, &mut reader)?;
        if !filter.may_contain(key) {
            return Ok(None);
        }
        let index_block = IndexBlock::load_index(&mut reader, &footer)?;
        match index_block.may_contain_key(key) {
            Some((offset, length)) => {
                let block = DataBlock::from_reader(&mut reader, offset, length)?;
                Ok(block.get(key))
            }
            None => Ok(None),
        }
    }

    fn note_corruption(&self, e: &Error) {
        if matches!(e, Error::Corruption(_)) {
            self.corrupt.store(true, Ordering::Release);
            error!(
                "table {}/{} is corrupt and will be excluded from reads: {}",
                self.level, self.table_id, e
            );
        }
    }

    #[inline]
    pub fn is_corrupt(&self) -> bool {
        self.corrupt.load(Ordering::Acquire)
    }

    #[inline]
    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    #[inline]
    pub fn level(&self) -> usize {
        self.level
    }

    #[inline]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    #[inline]
    pub fn kv_total(&self) -> u64 {
        self.kv_total
    }

    pub fn status(&self) -> TableStatus {
        let guard = self.status.read().unwrap();
        *guard.deref()
    }

    /// Check whether the status is `Store`; if it is, change it to
    /// `Compacting` and return true, or else return false.
    pub fn test_and_set_compacting(&self) -> bool {
        let mut guard = self.status.write().unwrap();
        if *guard.deref() == TableStatus::Store {
            *guard = TableStatus::Compacting;
            true
        } else {
            false
        }
    }

    /// Revert `Compacting` to `Store` after an aborted compaction.
    pub(crate) fn abandon_compacting(&self) {
        let mut guard = self.status.write().unwrap();
        debug_assert_eq!(*guard, TableStatus::Compacting, "invalid table status");
        *guard = TableStatus::Store;
    }

    pub(crate) fn ready_to_delete(&self) {
        let mut guard = self.status.write().unwrap();
        *guard = TableStatus::ToDelete;
    }

    #[inline]
    pub fn min_max_key(&self) -> (&UserKey, &UserKey) {
        (&self.min_key, &self.max_key)
    }

    #[inline]
    pub fn min_key(&self) -> &UserKey {
        &self.min_key
    }

    #[inline]
    pub fn max_key(&self) -> &UserKey {
        &self.max_key
    }

    #[inline]
    pub fn key_in_range(&self, key: &UserKey) -> bool {
        self.min_key.le(key) && key.le(&self.max_key)
    }

    ///```text
    /// ----         ------      -----    ----
    ///   |---|       |--|     |---|    |------|
    ///```
    pub fn is_overlapping(&self, min_key: &UserKey, max_key: &UserKey) -> bool {
        self.min_key.le(min_key) && min_key.le(&self.max_key)
            || self.min_key.le(max_key) && max_key.le(&self.max_key)
            || min_key.le(&self.min_key) && self.max_key.le(max_key)
    }
}

impl Drop for TableReadHandle {
    fn drop(&mut self) {
        if let TableStatus::ToDelete = self.status() {
            if let Err(e) = fs::remove_file(&self.file_path) {
                error!("removing table file {:?} failed: {}", self.file_path, e);
            }
        }
    }
}

/// Restartable cursor over one table: current block index plus position
/// within the decoded block. Independent iterators over the same file do
/// not share state.
pub struct TableIterator {
    handle: Arc<TableReadHandle>,
    reader: BufReaderWithPos<File>,
    index: IndexBlock,
    next_block: usize,
    entries: std::vec::IntoIter<(UserKey, SeqNum, Option<Value>)>,
    done: bool,
}

impl TableIterator {
    pub fn new(handle: Arc<TableReadHandle>) -> Result<TableIterator> {
        let mut reader = handle.new_reader()?;
        let footer = Footer::load_footer(&mut reader)?;
        let index = IndexBlock::load_index(&mut reader, &footer)?;
        Ok(TableIterator {
            handle,
            reader,
            index,
            next_block: 0,
            entries: Vec::new().into_iter(),
            done: false,
        })
    }

    /// Position the cursor at the first entry with user key `>= start`.
    pub fn seek(&mut self, start: &UserKey) -> Result<()> {
        match self.index.find_first_ge(start) {
            None => self.done = true,
            Some(i) => {
                self.next_block = i;
                self.load_next_block()?;
                while self
                    .entries
                    .as_slice()
                    .first()
                    .map_or(false, |e| e.0.lt(start))
                {
                    self.entries.next();
                }
            }
        }
        Ok(())
    }

    fn load_next_block(&mut self) -> Result<bool> {
        if self.next_block >= self.index.indexes.len() {
            return Ok(false);
        }
        let (offset, length, _) = &self.index.indexes[self.next_block];
        let block = DataBlock::from_reader(&mut self.reader, *offset, *length)?;
        self.entries = block.into_iter();
        self.next_block += 1;
        Ok(true)
    }
}

impl Iterator for TableIterator {
    type Item = Result<(InternalKey, Option<Value>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Some((key, seq, value)) = self.entries.next() {
                return Some(Ok((InternalKey::new(key, seq), value)));
            }
            match self.load_next_block() {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    self.handle.note_corruption(&e);
                    return Some(Err(e));
                }
            }
        }
    }
}
