use crate::compact::{install_or_abandon, merge_to_level, CompactionContext};
use crate::sstable::table_handle::TableReadHandle;
use crate::Result;
use rand::Rng;
use std::sync::Arc;

/// Merge one table from `level` with the overlapping tables of `level + 1`.
/// Tables within a level >= 1 are disjoint, so a single victim plus its
/// overlapping targets is a complete input set for its key range.
pub(crate) fn compact_level_n(ctx: &CompactionContext, level: usize) -> Result<()> {
    let version = ctx.versions.current();

    let victim = match random_victim(version.level_tables(level)) {
        None => return Ok(()),
        Some(victim) => victim,
    };
    let (min_key, max_key) = victim.min_max_key();
    let (min_key, max_key) = (min_key.clone(), max_key.clone());

    let mut target_tables = version.overlapping_tables(level + 1, &min_key, &max_key);
    target_tables.retain(|t| t.test_and_set_compacting());

    // inputs ordered oldest to newest: the source level shadows the target
    let mut inputs = target_tables;
    inputs.push(victim);

    match merge_to_level(ctx, &version, &inputs, level + 1) {
        Ok(new_tables) => install_or_abandon(ctx, new_tables, inputs),
        Err(e) => {
            for table in &inputs {
                table.abandon_compacting();
            }
            Err(e)
        }
    }
}

fn random_victim(tables: &[Arc<TableReadHandle>]) -> Option<Arc<TableReadHandle>> {
    if tables.is_empty() {
        return None;
    }
    let mut rng = rand::thread_rng();
    for _ in 0..10 {
        let i = rng.gen_range(0..tables.len());
        if tables[i].test_and_set_compacting() {
            return Some(tables[i].clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use crate::compact::level_n::compact_level_n;
    use crate::compact::tests::create_context;
    use crate::db::options::Options;
    use crate::sstable::table_handle::{TableReadHandle, TableWriteHandle};
    use crate::version::VersionEdit;
    use std::sync::Arc;

    #[test]
    fn test_merge_into_next_level() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let ctx = create_context(temp_dir.path(), Options::default());

        let mut added = Vec::new();
        for (level, range, seq) in [(1usize, 0..40, 10u64), (2, 20..60, 1)] {
            let table_id = ctx.versions.allocate_file_id();
            let mut handle = TableWriteHandle::new(
                &ctx.db_path,
                level,
                table_id,
                range.len(),
                &Options::default(),
            )
            .unwrap();
            for i in range {
                handle
                    .add(
                        format!("key{:02}", i).into_bytes(),
                        seq,
                        Some(format!("value{}_{}", i, level).into_bytes()),
                    )
                    .unwrap();
            }
            handle.finish().unwrap();
            added.push(Arc::new(
                TableReadHandle::from_table_write_handle(handle).unwrap(),
            ));
        }
        ctx.versions
            .install(
                VersionEdit {
                    added,
                    removed: vec![],
                },
                100,
            )
            .unwrap();

        compact_level_n(&ctx, 1).unwrap();

        let version = ctx.versions.current();
        assert!(version.level_tables(1).is_empty());
        assert!(!version.level_tables(2).is_empty());

        // the level-1 version wins in the overlap
        assert_eq!(
            version.get(&b"key25".to_vec()).unwrap(),
            Some(Some(b"value25_1".to_vec()))
        );
        // outside the overlap both sides survive
        assert_eq!(
            version.get(&b"key05".to_vec()).unwrap(),
            Some(Some(b"value5_1".to_vec()))
        );
        assert_eq!(
            version.get(&b"key55".to_vec()).unwrap(),
            Some(Some(b"value55_2".to_vec()))
        );
    }
}
