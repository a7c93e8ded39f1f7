//! Live table set and its durable manifest.

pub mod manifest;

pub use manifest::{VersionEdit, VersionSet};

use crate::db::key_types::{InternalKey, UserKey, Value};
use crate::sstable::table_handle::{TableIterator, TableReadHandle};
use crate::Result;
use std::sync::Arc;

pub const MAX_LEVEL: usize = 7;

/// Immutable snapshot of the tables that must be consulted for reads.
///
/// Level 0 tables may overlap and are kept in ascending file-id order;
/// lookups walk them newest-first. Tables in levels >= 1 have disjoint key
/// ranges and are kept sorted by min key, so a lookup binary-searches for
/// the single candidate table. A reader holding an `Arc<Version>` keeps
/// every referenced table file alive until it finishes.
pub struct Version {
    levels: Vec<Vec<Arc<TableReadHandle>>>,
}

impl Version {
    pub(crate) fn empty() -> Version {
        Version {
            levels: vec![Vec::new(); MAX_LEVEL + 1],
        }
    }

    pub(crate) fn new(levels: Vec<Vec<Arc<TableReadHandle>>>) -> Version {
        debug_assert_eq!(levels.len(), MAX_LEVEL + 1);
        Version { levels }
    }

    pub(crate) fn levels(&self) -> &Vec<Vec<Arc<TableReadHandle>>> {
        &self.levels
    }

    pub(crate) fn level_tables(&self, level: usize) -> &[Arc<TableReadHandle>] {
        &self.levels[level]
    }

    /// Newest version of `key` across all levels: `None` if no table holds
    /// it, `Some(None)` if the newest version is a tombstone.
    pub fn get(&self, key: &UserKey) -> Result<Option<Option<Value>>> {
        // level 0 newest-first; sibling tables may overlap
        for table in self.levels[0].iter().rev() {
            if table.is_corrupt() || !table.key_in_range(key) {
                continue;
            }
            if let Some((_seq, value)) = table.query(key)? {
                return Ok(Some(value));
            }
        }
        for level in 1..self.levels.len() {
            if let Some(table) = self.find_table(level, key) {
                if table.is_corrupt() {
                    continue;
                }
                if let Some((_seq, value)) = table.query(key)? {
                    return Ok(Some(value));
                }
            }
        }
        Ok(None)
    }

    /// The single table in `level >= 1` whose range may contain `key`.
    fn find_table(&self, level: usize, key: &UserKey) -> Option<&Arc<TableReadHandle>> {
        let tables = &self.levels[level];
        let i = tables.partition_point(|t| t.max_key().lt(key));
        tables.get(i).filter(|t| t.key_in_range(key))
    }

    pub(crate) fn level0_count(&self) -> usize {
        self.levels[0].len()
    }

    pub(crate) fn level_size(&self, level: usize) -> u64 {
        self.levels[level].iter().map(|t| t.file_size()).sum()
    }

    /// Tables in `level` intersecting `[min_key, max_key]`.
    pub(crate) fn overlapping_tables(
        &self,
        level: usize,
        min_key: &UserKey,
        max_key: &UserKey,
    ) -> Vec<Arc<TableReadHandle>> {
        self.levels[level]
            .iter()
            .filter(|t| t.is_overlapping(min_key, max_key))
            .cloned()
            .collect()
    }

    /// Whether any table below `level` has a key range containing `key`.
    /// Governs tombstone collection: a tombstone written to `level` may be
    /// dropped only when this is false.
    pub(crate) fn has_key_below(&self, level: usize, key: &UserKey) -> bool {
        for deeper in level + 1..self.levels.len() {
            if self.find_table(deeper, key).is_some() {
                return true;
            }
        }
        false
    }
}

/// Ascending iterator over the non-overlapping tables of one level >= 1,
/// chaining per-table cursors in min-key order.
pub(crate) struct LevelIterator {
    tables: Vec<Arc<TableReadHandle>>,
    next_table: usize,
    cur: Option<TableIterator>,
}

impl LevelIterator {
    pub(crate) fn new(
        tables: Vec<Arc<TableReadHandle>>,
        start: Option<&UserKey>,
    ) -> Result<LevelIterator> {
        let mut iter = LevelIterator {
            tables,
            next_table: 0,
            cur: None,
        };
        if let Some(start) = start {
            iter.next_table = iter.tables.partition_point(|t| t.max_key().lt(start));
            if iter.advance_table()? {
                if let Some(cur) = &mut iter.cur {
                    cur.seek(start)?;
                }
            }
        }
        Ok(iter)
    }

    fn advance_table(&mut self) -> Result<bool> {
        if self.next_table >= self.tables.len() {
            self.cur = None;
            return Ok(false);
        }
        self.cur = Some(TableIterator::new(self.tables[self.next_table].clone())?);
        self.next_table += 1;
        Ok(true)
    }
}

impl Iterator for LevelIterator {
    type Item = Result<(InternalKey, Option<Value>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(cur) = &mut self.cur {
                if let Some(item) = cur.next() {
                    return Some(item);
                }
            }
            match self.advance_table() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => {
                    self.next_table = self.tables.len();
                    self.cur = None;
                    return Some(Err(e));
                }
            }
        }
    }
}
