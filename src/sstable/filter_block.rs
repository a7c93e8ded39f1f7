use crate::bloom::BloomFilter;
use crate::ioutils::read_bytes_exact;
use crate::Result;
use std::io::{Read, Seek, SeekFrom, Write};

pub(super) fn write_filter_block(
    filter: &BloomFilter,
    writer: &mut (impl Write + Seek),
) -> Result<()> {
    writer.write_all(&filter.bits)?;
    writer.write_all(&[filter.k])?;
    Ok(())
}

pub(super) fn load_filter_block(
    offset: u64,
    length: u64,
    reader: &mut (impl Read + Seek),
) -> Result<BloomFilter> {
    reader.seek(SeekFrom::Start(offset))?;
    let block = read_bytes_exact(reader, length)?;
    BloomFilter::from_block(block)
}
