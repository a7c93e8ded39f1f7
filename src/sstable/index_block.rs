use crate::db::key_types::UserKey;
use crate::error::Error;
use crate::ioutils::{read_bytes_exact, read_u32, read_u64};
use crate::sstable::footer::Footer;
use crate::Result;
use std::io::{Read, Seek, SeekFrom, Write};

/// Sparse index over the data blocks of one table.
///
/// Serialized layout: the table's minimum user key, then one entry per data
/// block holding the block's file offset, byte length and maximum user key.
#[derive(Default)]
pub(crate) struct IndexBlock {
    pub(crate) min_key: UserKey,
    /// block offset, block length, max user key per data block
    pub(crate) indexes: Vec<(u64, u64, UserKey)>,
}

impl IndexBlock {
    pub(crate) fn add_index(&mut self, offset: u64, length: u64, max_key: UserKey) {
        self.indexes.push((offset, length, max_key));
    }

    pub(crate) fn write_to_file(&self, writer: &mut (impl Write + Seek)) -> Result<()> {
        writer.write_all(&(self.min_key.len() as u32).to_le_bytes())?;
        writer.write_all(&self.min_key)?;
        for index in &self.indexes {
            writer.write_all(&index.0.to_le_bytes())?;
            writer.write_all(&index.1.to_le_bytes())?;
            writer.write_all(&(index.2.len() as u32).to_le_bytes())?;
            writer.write_all(&index.2)?;
        }
        Ok(())
    }

    pub(crate) fn load_index(
        reader: &mut (impl Read + Seek),
        footer: &Footer,
    ) -> Result<IndexBlock> {
        reader.seek(SeekFrom::Start(footer.index_block_offset))?;

        let min_key_length = read_u32(reader)?;
        let min_key = read_bytes_exact(reader, min_key_length as u64)?;

        let mut index_block = IndexBlock {
            min_key,
            indexes: Vec::new(),
        };

        let mut index_offset = 4 + min_key_length as u64;
        while index_offset < footer.index_block_length {
            let block_offset = read_u64(reader)?;
            let block_length = read_u64(reader)?;
            let max_key_length = read_u32(reader)?;
            let max_key = read_bytes_exact(reader, max_key_length as u64)?;
            index_block.indexes.push((block_offset, block_length, max_key));
            index_offset += 20 + max_key_length as u64;
        }
        if index_offset != footer.index_block_length {
            return Err(Error::Corruption("index block length mismatch".into()));
        }
        Ok(index_block)
    }

    /// Returns `(offset, length)` of the block that may contain `key`.
    pub(crate) fn may_contain_key(&self, key: &UserKey) -> Option<(u64, u64)> {
        self.find_first_ge(key).map(|i| {
            let entry = &self.indexes[i];
            (entry.0, entry.1)
        })
    }

    /// Index of the first data block whose max key is `>= key`.
    pub(crate) fn find_first_ge(&self, key: &UserKey) -> Option<usize> {
        let i = self.indexes.partition_point(|probe| probe.2.lt(key));
        (i < self.indexes.len()).then(|| i)
    }

    pub(crate) fn max_key(&self) -> &UserKey {
        &self.indexes.last().expect("empty index block").2
    }
}

#[cfg(test)]
mod tests {
    use crate::sstable::index_block::IndexBlock;

    fn block() -> IndexBlock {
        let mut index = IndexBlock {
            min_key: b"key00".to_vec(),
            indexes: Vec::new(),
        };
        index.add_index(0, 100, b"key10".to_vec());
        index.add_index(100, 100, b"key20".to_vec());
        index.add_index(200, 50, b"key30".to_vec());
        index
    }

    #[test]
    fn test_may_contain_key() {
        let index = block();
        assert_eq!(index.may_contain_key(&b"key00".to_vec()), Some((0, 100)));
        assert_eq!(index.may_contain_key(&b"key10".to_vec()), Some((0, 100)));
        assert_eq!(index.may_contain_key(&b"key11".to_vec()), Some((100, 100)));
        assert_eq!(index.may_contain_key(&b"key30".to_vec()), Some((200, 50)));
        assert_eq!(index.may_contain_key(&b"key31".to_vec()), None);
    }

    #[test]
    fn test_max_key() {
        assert_eq!(block().max_key(), &b"key30".to_vec());
    }
}
