use crate::db::key_types::{InternalKey, UserKey, Value};
use crate::error::Error;
use crate::Result;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// One input stream of a k-way merge, ascending by `(user_key, seq)` or
/// `(user_key)` with unique keys (table iterators).
pub(crate) type RecordIter = Box<dyn Iterator<Item = Result<(InternalKey, Option<Value>)>> + Send>;

struct HeapItem {
    key: InternalKey,
    value: Option<Value>,
    source: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    /// Smaller user key is larger; among equal keys, larger seq is larger;
    /// then higher source index (the newer input). [`BinaryHeap`] returns
    /// the greatest item, so the merge pops ascending keys, newest version
    /// first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .user_key
            .cmp(&self.key.user_key)
            .then(self.key.seq.cmp(&other.key.seq))
            .then(self.source.cmp(&other.source))
    }
}

/// k-way merge over sorted record streams.
///
/// Yields `(user_key asc, seq desc)`. A record whose `(key, seq)` equals
/// the previously yielded one is a crash-replay duplicate when the payload
/// matches byte for byte, and is silently coalesced; a diverging payload
/// under the same sequence number can only be a defect and is rejected.
pub(crate) struct MergingIterator {
    sources: Vec<RecordIter>,
    heap: BinaryHeap<HeapItem>,
    last: Option<(InternalKey, Option<Value>)>,
    cur_user_key: Option<UserKey>,
}

impl MergingIterator {
    pub(crate) fn new(sources: Vec<RecordIter>) -> Result<MergingIterator> {
        let mut iter = MergingIterator {
            sources,
            heap: BinaryHeap::new(),
            last: None,
            cur_user_key: None,
        };
        for source in 0..iter.sources.len() {
            iter.fill_from(source)?;
        }
        Ok(iter)
    }

    fn fill_from(&mut self, source: usize) -> Result<()> {
        if let Some(record) = self.sources[source].next() {
            let (key, value) = record?;
            self.heap.push(HeapItem { key, value, source });
        }
        Ok(())
    }

    /// Next surviving version in `(user_key asc, seq desc)` order.
    pub(crate) fn next_version(&mut self) -> Result<Option<(InternalKey, Option<Value>)>> {
        loop {
            let item = match self.heap.pop() {
                None => return Ok(None),
                Some(item) => item,
            };
            self.fill_from(item.source)?;

            if let Some((last_key, last_value)) = &self.last {
                if *last_key == item.key {
                    if *last_value != item.value {
                        return Err(Error::Corruption(format!(
                            "diverging payloads under sequence number {} of key {:?}",
                            item.key.seq, item.key.user_key
                        )));
                    }
                    continue;
                }
            }
            self.last = Some((item.key.clone(), item.value.clone()));
            return Ok(Some((item.key, item.value)));
        }
    }

    /// Next distinct user key with its newest version.
    pub(crate) fn next_newest(&mut self) -> Result<Option<(InternalKey, Option<Value>)>> {
        loop {
            match self.next_version()? {
                None => return Ok(None),
                Some((key, value)) => {
                    if self.cur_user_key.as_ref() == Some(&key.user_key) {
                        continue;
                    }
                    self.cur_user_key = Some(key.user_key.clone());
                    return Ok(Some((key, value)));
                }
            }
        }
    }
}
