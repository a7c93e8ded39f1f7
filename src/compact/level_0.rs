use crate::compact::{install_or_abandon, merge_to_level, CompactionContext};
use crate::sstable::table_handle::TableReadHandle;
use crate::Result;
use std::sync::Arc;

/// Merge every level-0 table, together with the level-1 tables their union
/// range overlaps, into level 1. Level-0 siblings may overlap each other,
/// so leaving any of them out would break newest-first resolution.
pub(crate) fn compact_level0(ctx: &CompactionContext) -> Result<()> {
    let version = ctx.versions.current();

    // ascending file id: the newest flush output merges with the highest
    // priority
    let mut level0_tables: Vec<Arc<TableReadHandle>> = Vec::new();
    for table in version.level_tables(0) {
        if table.test_and_set_compacting() {
            level0_tables.push(table.clone());
        }
    }
    if level0_tables.is_empty() {
        return Ok(());
    }

    let min_key = level0_tables
        .iter()
        .map(|t| t.min_key())
        .min()
        .unwrap()
        .clone();
    let max_key = level0_tables
        .iter()
        .map(|t| t.max_key())
        .max()
        .unwrap()
        .clone();

    let mut level1_tables = version.overlapping_tables(1, &min_key, &max_key);
    level1_tables.retain(|t| t.test_and_set_compacting());

    // inputs ordered oldest to newest: level 1 first, then level 0
    let mut inputs = level1_tables;
    inputs.extend(level0_tables);

    match merge_to_level(ctx, &version, &inputs, 1) {
        Ok(new_tables) => install_or_abandon(ctx, new_tables, inputs),
        Err(e) => {
            for table in &inputs {
                table.abandon_compacting();
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::compact::level_0::compact_level0;
    use crate::compact::tests::create_context;
    use crate::db::options::Options;
    use crate::sstable::table_handle::{TableReadHandle, TableWriteHandle};
    use crate::version::{VersionEdit, VersionSet};
    use std::sync::Arc;

    fn install_table(
        versions: &VersionSet,
        db_path: &std::path::Path,
        level: usize,
        entries: Vec<(&str, u64, Option<&str>)>,
    ) -> Arc<TableReadHandle> {
        let table_id = versions.allocate_file_id();
        let mut handle =
            TableWriteHandle::new(db_path, level, table_id, entries.len(), &Options::default())
                .unwrap();
        for (key, seq, value) in entries {
            handle
                .add(
                    key.as_bytes().to_vec(),
                    seq,
                    value.map(|v| v.as_bytes().to_vec()),
                )
                .unwrap();
        }
        handle.finish().unwrap();
        let handle = Arc::new(TableReadHandle::from_table_write_handle(handle).unwrap());
        versions
            .install(
                VersionEdit {
                    added: vec![handle.clone()],
                    removed: vec![],
                },
                100,
            )
            .unwrap();
        handle
    }

    #[test]
    fn test_newest_version_survives() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let ctx = create_context(temp_dir.path(), Options::default());

        install_table(
            &ctx.versions,
            &ctx.db_path,
            0,
            vec![("a", 1, Some("a1")), ("b", 2, Some("b1"))],
        );
        install_table(
            &ctx.versions,
            &ctx.db_path,
            0,
            vec![("a", 3, Some("a2")), ("c", 4, Some("c1"))],
        );
        let old_l1 = install_table(
            &ctx.versions,
            &ctx.db_path,
            1,
            vec![("b", 0, Some("b0")), ("d", 0, Some("d0"))],
        );
        let old_l1_path = temp_dir.path().join("1").join(old_l1.table_id().to_string());
        drop(old_l1);

        compact_level0(&ctx).unwrap();

        let version = ctx.versions.current();
        assert_eq!(version.level_tables(0).len(), 0);
        assert!(!version.level_tables(1).is_empty());

        // newest-first resolution across the merged inputs
        assert_eq!(
            version.get(&b"a".to_vec()).unwrap(),
            Some(Some(b"a2".to_vec()))
        );
        assert_eq!(
            version.get(&b"b".to_vec()).unwrap(),
            Some(Some(b"b1".to_vec()))
        );
        assert_eq!(
            version.get(&b"c".to_vec()).unwrap(),
            Some(Some(b"c1".to_vec()))
        );
        assert_eq!(
            version.get(&b"d".to_vec()).unwrap(),
            Some(Some(b"d0".to_vec()))
        );

        // replaced input files are gone once their last reference dropped
        assert!(!old_l1_path.exists());
    }

    #[test]
    fn test_tombstone_dropped_at_deepest_level() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let ctx = create_context(temp_dir.path(), Options::default());

        install_table(
            &ctx.versions,
            &ctx.db_path,
            0,
            vec![("a", 5, None), ("b", 6, Some("b1"))],
        );

        compact_level0(&ctx).unwrap();

        let version = ctx.versions.current();
        assert_eq!(version.get(&b"a".to_vec()).unwrap(), None);

        // no older copy of "a" exists below level 1: the tombstone is
        // physically gone from the merged table
        let tables = version.level_tables(1);
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].kv_total(), 1);
        assert!(tables[0].query(&b"a".to_vec()).unwrap().is_none());
    }

    #[test]
    fn test_tombstone_carried_when_deeper_copy_exists() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let ctx = create_context(temp_dir.path(), Options::default());

        install_table(&ctx.versions, &ctx.db_path, 2, vec![("a", 1, Some("a0"))]);
        install_table(&ctx.versions, &ctx.db_path, 0, vec![("a", 5, None)]);

        compact_level0(&ctx).unwrap();

        let version = ctx.versions.current();
        // the level-2 copy must stay shadowed
        assert_eq!(version.get(&b"a".to_vec()).unwrap(), Some(None));
        let tables = version.level_tables(1);
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].query(&b"a".to_vec()).unwrap(), Some((5, None)));
    }

    #[test]
    fn test_level1_outputs_do_not_overlap() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let mut opts = Options::default();
        // tiny output tables force a split
        opts.table_size_bytes = 256;
        let ctx = create_context(temp_dir.path(), opts);

        let first: Vec<String> = (0..50).map(|i| format!("key{:03}", i * 2)).collect();
        let second: Vec<String> = (0..50).map(|i| format!("key{:03}", i * 2 + 1)).collect();
        install_table(
            &ctx.versions,
            &ctx.db_path,
            0,
            first.iter().map(|k| (k.as_str(), 1, Some("v"))).collect(),
        );
        install_table(
            &ctx.versions,
            &ctx.db_path,
            0,
            second.iter().map(|k| (k.as_str(), 2, Some("v"))).collect(),
        );

        compact_level0(&ctx).unwrap();

        let version = ctx.versions.current();
        let tables = version.level_tables(1);
        assert!(tables.len() > 1);
        for pair in tables.windows(2) {
            assert!(pair[0].max_key() < pair[1].min_key());
        }
        let total: u64 = tables.iter().map(|t| t.kv_total()).sum();
        assert_eq!(total, 100);
    }
}
