//! Background compaction.
//!
//! A single task drains a trigger channel: the engine sends a check signal
//! after every manifest install, and the task keeps compacting until no
//! level is over its threshold. Level 0 compacts on table count, levels
//! >= 1 on cumulative byte size growing geometrically per level. A failed
//! attempt never mutates the manifest; the old version stays authoritative
//! and the next trigger retries.

pub(crate) mod level_0;
pub(crate) mod level_n;
pub(crate) mod merge;

use crate::compact::merge::{MergingIterator, RecordIter};
use crate::db::key_types::SeqNum;
use crate::db::options::Options;
use crate::sstable::table_handle::{TableIterator, TableReadHandle, TableWriteHandle};
use crate::version::{Version, VersionEdit, VersionSet, MAX_LEVEL};
use crate::Result;
use crossbeam_channel::Receiver;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

pub(crate) struct CompactionContext {
    pub(crate) db_path: PathBuf,
    pub(crate) opts: Arc<Options>,
    pub(crate) versions: Arc<VersionSet>,
    pub(crate) next_seq: Arc<AtomicU64>,
}

pub(crate) fn start_compaction_task(
    ctx: CompactionContext,
    receiver: Receiver<bool>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("compaction".to_owned())
        .spawn(move || {
            info!("compaction task start");
            while let Ok(true) = receiver.recv() {
                loop {
                    let result = match pick_compaction(&ctx) {
                        None => break,
                        Some(0) => level_0::compact_level0(&ctx),
                        Some(level) => level_n::compact_level_n(&ctx, level),
                    };
                    if let Err(e) = result {
                        error!("compaction failed, will retry on next trigger: {}", e);
                        break;
                    }
                }
            }
            info!("compaction task exit");
        })
        .unwrap()
}

fn pick_compaction(ctx: &CompactionContext) -> Option<usize> {
    let version = ctx.versions.current();
    if version.level0_count() > ctx.opts.level0_compaction_trigger_count {
        return Some(0);
    }
    for level in 1..MAX_LEVEL {
        if version.level_size(level) > ctx.opts.level_max_size_bytes(level) {
            return Some(level);
        }
    }
    None
}

/// Merge `inputs` into new tables at `target_level`, splitting the output
/// at the configured table size. Emits the newest version per distinct key.
/// A tombstone is dropped when no level below the target could still hold
/// an older copy of its key; otherwise it is carried forward so deeper
/// copies stay shadowed.
///
/// On error every already-written output file is removed; nothing has been
/// installed yet, so the attempt leaves no trace.
pub(crate) fn merge_to_level(
    ctx: &CompactionContext,
    version: &Version,
    inputs: &[Arc<TableReadHandle>],
    target_level: usize,
) -> Result<Vec<Arc<TableReadHandle>>> {
    let mut sources: Vec<RecordIter> = Vec::with_capacity(inputs.len());
    for table in inputs {
        sources.push(Box::new(TableIterator::new(table.clone())?));
    }
    let mut merger = MergingIterator::new(sources)?;

    let kv_estimate: usize = inputs.iter().map(|t| t.kv_total() as usize).sum();
    let mut outputs: Vec<Arc<TableReadHandle>> = Vec::new();
    let mut cur: Option<TableWriteHandle> = None;

    let result = (|| -> Result<()> {
        while let Some((key, value)) = merger.next_newest()? {
            if value.is_none() && !version.has_key_below(target_level, &key.user_key) {
                continue; // tombstone garbage collection
            }
            if cur
                .as_ref()
                .map_or(false, |t| t.approx_file_size() >= ctx.opts.table_size_bytes)
            {
                let mut table = cur.take().unwrap();
                table.finish()?;
                outputs.push(Arc::new(TableReadHandle::from_table_write_handle(table)?));
            }
            if cur.is_none() {
                cur = Some(TableWriteHandle::new(
                    &ctx.db_path,
                    target_level,
                    ctx.versions.allocate_file_id(),
                    kv_estimate,
                    &ctx.opts,
                )?);
            }
            cur.as_mut().unwrap().add(key.user_key, key.seq, value)?;
        }
        if let Some(mut table) = cur.take() {
            table.finish()?;
            outputs.push(Arc::new(TableReadHandle::from_table_write_handle(table)?));
        }
        Ok(())
    })();

    match result {
        Ok(()) => Ok(outputs),
        Err(e) => {
            for table in outputs.drain(..) {
                table.ready_to_delete();
            }
            Err(e)
        }
    }
}

/// Install `new_tables` in place of `inputs`; on any failure the inputs are
/// released for a later retry and the orphaned outputs are removed.
pub(crate) fn install_or_abandon(
    ctx: &CompactionContext,
    new_tables: Vec<Arc<TableReadHandle>>,
    inputs: Vec<Arc<TableReadHandle>>,
) -> Result<()> {
    let added = new_tables.len();
    let edit = VersionEdit {
        added: new_tables.clone(),
        removed: inputs.clone(),
    };
    let next_seq: SeqNum = ctx.next_seq.load(Ordering::SeqCst);
    match ctx.versions.install(edit, next_seq) {
        Ok(_) => {
            info!(
                "compaction installed {} tables, removed {} inputs",
                added,
                inputs.len()
            );
            Ok(())
        }
        Err(e) => {
            for table in new_tables {
                table.ready_to_delete();
            }
            for table in &inputs {
                table.abandon_compacting();
            }
            Err(e)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::compact::CompactionContext;
    use crate::db::options::Options;
    use crate::version::VersionSet;
    use std::path::Path;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    pub(crate) fn create_context(db_path: &Path, opts: Options) -> CompactionContext {
        let (versions, next_seq) = VersionSet::recover(db_path).unwrap();
        CompactionContext {
            db_path: db_path.to_path_buf(),
            opts: Arc::new(opts),
            versions,
            next_seq: Arc::new(AtomicU64::new(next_seq)),
        }
    }
}
