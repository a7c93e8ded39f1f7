use crate::db::key_types::{InternalKey, SeqNum, UserKey, Value};
use crate::memory::{MemTable, ENTRY_OVERHEAD};
use std::collections::BTreeMap;

/// Write buffer backed by `BTreeMap<InternalKey, Option<Value>>`.
///
/// The map key carries the sequence number, so repeated writes to the same
/// user key occupy distinct slots and the multi-version ordering needed by
/// flush and compaction is preserved.
#[derive(Default)]
pub struct BTreeMemTable {
    inner: BTreeMap<InternalKey, Option<Value>>,
    size: usize,
}

impl BTreeMemTable {
    fn insert(&mut self, key: UserKey, seq: SeqNum, value: Option<Value>) {
        self.size += key.len() + value.as_ref().map_or(0, Vec::len) + ENTRY_OVERHEAD;
        self.inner.insert(InternalKey::new(key, seq), value);
    }
}

impl MemTable for BTreeMemTable {
    fn put(&mut self, key: UserKey, seq: SeqNum, value: Value) {
        self.insert(key, seq, Some(value));
    }

    fn delete(&mut self, key: UserKey, seq: SeqNum) {
        self.insert(key, seq, None);
    }

    fn get(&self, key: &UserKey) -> Option<Option<Value>> {
        let start = InternalKey::new(key.clone(), 0);
        let end = InternalKey::new(key.clone(), SeqNum::MAX);
        self.inner
            .range(start..=end)
            .next_back()
            .map(|(_, v)| v.clone())
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn approximate_size(&self) -> usize {
        self.size
    }

    fn iter(&self) -> Box<dyn Iterator<Item = (&InternalKey, &Option<Value>)> + '_> {
        Box::new(self.inner.iter())
    }

    fn range_clone(&self, start: &UserKey, end: &UserKey) -> Vec<(InternalKey, Option<Value>)> {
        let start = InternalKey::new(start.clone(), 0);
        let end = InternalKey::new(end.clone(), 0);
        self.inner
            .range(start..end)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
