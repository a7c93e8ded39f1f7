use crate::error::Error;
use crate::Result;
use std::io::{Read, Seek, SeekFrom, Write};

pub(crate) const FOOTER_MAGIC_NUMBER: u64 = 0xdb99_1122_4c53_4d31;
pub(crate) const FOOTER_BYTE_SIZE: i64 = 48;

/// Fixed-layout table footer. All fields are little-endian u64:
/// index offset, index length, filter offset, filter length, entry count,
/// magic number.
pub(crate) struct Footer {
    pub index_block_offset: u64,
    pub index_block_length: u64,
    pub filter_offset: u64,
    pub filter_length: u64,
    pub kv_total: u64,
}

impl Footer {
    pub(crate) fn write_to_file(&self, writer: &mut (impl Write + Seek)) -> Result<()> {
        writer.write_all(&self.index_block_offset.to_le_bytes())?;
        writer.write_all(&self.index_block_length.to_le_bytes())?;
        writer.write_all(&self.filter_offset.to_le_bytes())?;
        writer.write_all(&self.filter_length.to_le_bytes())?;
        writer.write_all(&self.kv_total.to_le_bytes())?;
        writer.write_all(&FOOTER_MAGIC_NUMBER.to_le_bytes())?;
        Ok(())
    }

    pub(crate) fn load_footer(reader: &mut (impl Read + Seek)) -> Result<Footer> {
        reader
            .seek(SeekFrom::End(-FOOTER_BYTE_SIZE))
            .map_err(|_| Error::Corruption("file shorter than footer".into()))?;

        let mut fields = [0u64; 6];
        for field in fields.iter_mut() {
            let mut buf = [0u8; 8];
            reader.read_exact(&mut buf)?;
            *field = u64::from_le_bytes(buf);
        }

        if fields[5] != FOOTER_MAGIC_NUMBER {
            return Err(Error::Corruption("invalid footer magic number".into()));
        }

        Ok(Footer {
            index_block_offset: fields[0],
            index_block_length: fields[1],
            filter_offset: fields[2],
            filter_length: fields[3],
            kv_total: fields[4],
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::ioutils::{BufReaderWithPos, BufWriterWithPos};
    use crate::sstable::footer::Footer;
    use std::io::{Seek, SeekFrom, Write};

    #[test]
    fn test_round_trip() {
        let file = tempfile::tempfile().unwrap();
        let mut writer = BufWriterWithPos::new(file.try_clone().unwrap()).unwrap();
        let footer = Footer {
            index_block_offset: 1000,
            index_block_length: 64,
            filter_offset: 1064,
            filter_length: 129,
            kv_total: 77,
        };
        footer.write_to_file(&mut writer).unwrap();
        writer.flush().unwrap();

        let mut reader = BufReaderWithPos::new(file).unwrap();
        let loaded = Footer::load_footer(&mut reader).unwrap();
        assert_eq!(loaded.index_block_offset, 1000);
        assert_eq!(loaded.index_block_length, 64);
        assert_eq!(loaded.filter_offset, 1064);
        assert_eq!(loaded.filter_length, 129);
        assert_eq!(loaded.kv_total, 77);
    }

    #[test]
    fn test_bad_magic() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[0u8; 48]).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut reader = BufReaderWithPos::new(file).unwrap();
        match Footer::load_footer(&mut reader) {
            Err(Error::Corruption(_)) => {}
            other => panic!("expected corruption error, got {:?}", other.is_ok()),
        }
    }
}
