use crate::db::key_types::{SeqNum, UserKey, Value, TOMBSTONE_LEN};
use crate::error::Error;
use crate::ioutils::{read_bytes_exact, read_u32, read_u64};
use crate::Result;
use std::io::{Read, Seek, SeekFrom};

/// One data block, decoded into memory.
///
/// Entry layout on disk (little-endian):
///
/// ```text
/// +---------+-----------+-----+-----+-------+
/// | key_len | value_len | seq | key | value |
/// +---------+-----------+-----+-----+-------+
/// \--------/\-----------/\----/\----/\------/
///    u32         u32      u64  var-len var-len
/// ```
///
/// `value_len == u32::MAX` flags a tombstone and no value bytes follow.
/// Keys are unique within a table and ascending within a block.
pub(crate) struct DataBlock {
    pub(crate) entries: Vec<(UserKey, SeqNum, Option<Value>)>,
}

impl DataBlock {
    pub(crate) fn from_reader(
        reader: &mut (impl Read + Seek),
        offset: u64,
        length: u64,
    ) -> Result<DataBlock> {
        reader.seek(SeekFrom::Start(offset))?;

        let mut entries = Vec::new();
        let mut consumed = 0u64;
        while consumed < length {
            let key_length = read_u32(reader)?;
            let value_length = read_u32(reader)?;
            let seq = read_u64(reader)?;
            let value_bytes = if value_length == TOMBSTONE_LEN {
                0
            } else {
                value_length as u64
            };
            if consumed + 16 + key_length as u64 + value_bytes > length {
                return Err(Error::Corruption("data block entry overruns block".into()));
            }
            let key = read_bytes_exact(reader, key_length as u64)?;
            let value = if value_length == TOMBSTONE_LEN {
                None
            } else {
                Some(read_bytes_exact(reader, value_bytes)?)
            };
            entries.push((key, seq, value));
            consumed += 16 + key_length as u64 + value_bytes;
        }
        Ok(DataBlock { entries })
    }

    /// Exact-match lookup within the block.
    pub(crate) fn get(&self, key: &UserKey) -> Option<(SeqNum, Option<Value>)> {
        self.entries
            .binary_search_by(|probe| probe.0.cmp(key))
            .ok()
            .map(|i| (self.entries[i].1, self.entries[i].2.clone()))
    }

    pub(crate) fn encode_into(
        buf: &mut Vec<u8>,
        key: &[u8],
        seq: SeqNum,
        value: Option<&Value>,
    ) {
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        let value_len = value.map_or(TOMBSTONE_LEN, |v| v.len() as u32);
        buf.extend_from_slice(&value_len.to_le_bytes());
        buf.extend_from_slice(&seq.to_le_bytes());
        buf.extend_from_slice(key);
        if let Some(v) = value {
            buf.extend_from_slice(v);
        }
    }
}

impl IntoIterator for DataBlock {
    type Item = (UserKey, SeqNum, Option<Value>);
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use crate::ioutils::BufReaderWithPos;
    use crate::sstable::data_block::DataBlock;
    use std::io::{Seek, SeekFrom, Write};

    #[test]
    fn test_encode_decode() {
        let mut buf = Vec::new();
        DataBlock::encode_into(&mut buf, b"alpha", 3, Some(&b"one".to_vec()));
        DataBlock::encode_into(&mut buf, b"beta", 7, None);
        DataBlock::encode_into(&mut buf, b"gamma", 9, Some(&b"".to_vec()));

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&buf).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut reader = BufReaderWithPos::new(file).unwrap();

        let block = DataBlock::from_reader(&mut reader, 0, buf.len() as u64).unwrap();
        assert_eq!(block.entries.len(), 3);

        assert_eq!(
            block.get(&b"alpha".to_vec()),
            Some((3, Some(b"one".to_vec())))
        );
        // tombstone is present, distinct from an empty value
        assert_eq!(block.get(&b"beta".to_vec()), Some((7, None)));
        assert_eq!(block.get(&b"gamma".to_vec()), Some((9, Some(vec![]))));
        assert_eq!(block.get(&b"delta".to_vec()), None);
    }

    #[test]
    fn test_overrun_is_corruption() {
        let mut buf = Vec::new();
        DataBlock::encode_into(&mut buf, b"alpha", 3, Some(&b"one".to_vec()));

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&buf).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut reader = BufReaderWithPos::new(file).unwrap();

        // lie about the block length: the entry no longer fits
        assert!(DataBlock::from_reader(&mut reader, 0, buf.len() as u64 - 1).is_err());
    }
}
