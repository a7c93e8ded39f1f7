//! Memory table

mod btree_mem_table;

pub use btree_mem_table::BTreeMemTable;

use crate::db::key_types::{InternalKey, SeqNum, UserKey, Value};

/// Bookkeeping bytes charged to the write buffer for each entry on top of
/// the raw key and value bytes.
pub(crate) const ENTRY_OVERHEAD: usize = 16;

/// Mutable in-memory write buffer.
///
/// Entries are versioned: `put` and `delete` insert a new `(key, seq)`
/// record and never overwrite an older one, so the buffer can hold several
/// versions of the same key. Iteration order is ascending `(key, seq)`;
/// for a fixed key, versions surface in increasing sequence order.
pub trait MemTable: Default + Send + Sync {
    fn put(&mut self, key: UserKey, seq: SeqNum, value: Value);

    /// Insert a tombstone for `key`.
    fn delete(&mut self, key: UserKey, seq: SeqNum);

    /// Newest version of `key`: `None` if the buffer holds no version,
    /// `Some(None)` if the newest version is a tombstone.
    fn get(&self, key: &UserKey) -> Option<Option<Value>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tracked byte size: key bytes + value bytes + [`ENTRY_OVERHEAD`] per entry.
    fn approximate_size(&self) -> usize;

    fn is_full(&self, threshold: usize) -> bool {
        self.approximate_size() >= threshold
    }

    fn iter(&self) -> Box<dyn Iterator<Item = (&InternalKey, &Option<Value>)> + '_>;

    /// Clone every entry whose user key falls in `[start, end)`.
    fn range_clone(&self, start: &UserKey, end: &UserKey) -> Vec<(InternalKey, Option<Value>)>;
}
