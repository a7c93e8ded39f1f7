//! Write-ahead log.
//!
//! One log file per write-buffer generation, named `<gen>.log` under
//! `<db_path>/log/`. Record layout (all integers little-endian):
//!
//! ```text
//! +-----+---------+-----------+-----+-------+----------+
//! | seq | key_len | value_len | key | value | crc32    |
//! +-----+---------+-----------+-----+-------+----------+
//! \-----/\--------/\----------/\----/\------/\---------/
//!   u64      u32       u32    var-len var-len    u32
//! ```
//!
//! `value_len == u32::MAX` flags a tombstone and no value bytes follow. The
//! checksum covers everything before it. On replay, a record with a bad
//! checksum or a torn tail is the durability boundary of its file: the file
//! is truncated there and every byte after it is discarded.

use crate::db::key_types::{SeqNum, UserKey, Value, TOMBSTONE_LEN};
use crate::ioutils::{BufReaderWithPos, BufWriterWithPos};
use crate::Result;
use std::fs;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};

const RECORD_HEADER_SIZE: u64 = 16;

pub struct WalRecord {
    pub seq: SeqNum,
    pub key: UserKey,
    /// `None` is a tombstone.
    pub value: Option<Value>,
}

pub struct WriteAheadLog {
    log_dir: PathBuf,
    active_gen: u64,
    writer: BufWriterWithPos<File>,
}

impl WriteAheadLog {
    /// Open the logs at `db_path`, replaying every surviving generation in
    /// ascending order, and start a fresh generation for subsequent writes.
    /// Old generations stay on disk until [`remove_logs_upto`] is called
    /// after their contents are durably flushed.
    ///
    /// [`remove_logs_upto`]: WriteAheadLog::remove_logs_upto
    pub fn open(db_path: &Path) -> Result<(WriteAheadLog, Vec<WalRecord>)> {
        let log_dir = log_path(db_path);
        fs::create_dir_all(&log_dir)?;

        let gens = log_gens(&log_dir)?;
        let mut records = Vec::new();
        for gen in &gens {
            records.extend(Self::load_log(&log_file(&log_dir, *gen))?);
        }

        let active_gen = gens.last().map_or(1, |g| g + 1);
        let writer = Self::create_writer(&log_dir, active_gen)?;
        Ok((
            WriteAheadLog {
                log_dir,
                active_gen,
                writer,
            },
            records,
        ))
    }

    fn create_writer(log_dir: &Path, gen: u64) -> Result<BufWriterWithPos<File>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(true)
            .open(log_file(log_dir, gen))?;
        BufWriterWithPos::new(file)
    }

    /// Replay one generation file. The file is truncated at the last record
    /// whose checksum verifies.
    fn load_log(path: &Path) -> Result<Vec<WalRecord>> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReaderWithPos::new(&file)?;

        let mut records = Vec::new();
        let mut valid_end = 0u64;
        loop {
            let mut header = [0u8; RECORD_HEADER_SIZE as usize];
            if reader.read_exact(&mut header).is_err() {
                break;
            }
            let seq = u64::from_le_bytes(header[0..8].try_into().unwrap());
            let key_len = u32::from_le_bytes(header[8..12].try_into().unwrap());
            let value_len = u32::from_le_bytes(header[12..16].try_into().unwrap());

            let value_bytes = if value_len == TOMBSTONE_LEN {
                0
            } else {
                value_len as u64
            };
            if valid_end + RECORD_HEADER_SIZE + key_len as u64 + value_bytes + 4 > file_len {
                break;
            }

            let mut key = vec![0u8; key_len as usize];
            if reader.read_exact(&mut key).is_err() {
                break;
            }
            let value = if value_len == TOMBSTONE_LEN {
                None
            } else {
                let mut value = vec![0u8; value_len as usize];
                if reader.read_exact(&mut value).is_err() {
                    break;
                }
                Some(value)
            };
            let mut crc = [0u8; 4];
            if reader.read_exact(&mut crc).is_err() {
                break;
            }

            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&header);
            hasher.update(&key);
            if let Some(v) = &value {
                hasher.update(v);
            }
            if hasher.finalize() != u32::from_le_bytes(crc) {
                warn!("checksum mismatch in {:?} at offset {}", path, valid_end);
                break;
            }

            records.push(WalRecord { seq, key, value });
            valid_end = reader.pos();
        }

        if valid_end < file_len {
            warn!(
                "truncating {:?} from {} to {} bytes",
                path, file_len, valid_end
            );
            drop(reader);
            file.set_len(valid_end)?;
            file.sync_data()?;
        }
        Ok(records)
    }

    /// Append one record to the active generation, returning its offset in
    /// the log file. The record is not durable until this returns; on `Err`
    /// the caller must not acknowledge the write.
    pub fn append(
        &mut self,
        seq: SeqNum,
        key: &[u8],
        value: Option<&[u8]>,
        sync: bool,
    ) -> Result<u64> {
        let value_len = value.map_or(TOMBSTONE_LEN, |v| v.len() as u32);
        let mut buf =
            Vec::with_capacity(RECORD_HEADER_SIZE as usize + key.len() + value.map_or(0, <[u8]>::len) + 4);
        buf.extend_from_slice(&seq.to_le_bytes());
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&value_len.to_le_bytes());
        buf.extend_from_slice(key);
        if let Some(v) = value {
            buf.extend_from_slice(v);
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf);
        let crc = hasher.finalize();
        buf.extend_from_slice(&crc.to_le_bytes());

        use std::io::Write;
        let offset = self.writer.pos;
        self.writer.write_all(&buf)?;
        self.writer.flush()?;
        if sync {
            self.writer.sync_data()?;
        }
        Ok(offset)
    }

    #[inline]
    pub fn active_gen(&self) -> u64 {
        self.active_gen
    }

    /// Freeze the active generation and start a new one. The frozen file
    /// stays on disk; it becomes eligible for deletion only once the buffer
    /// it backs is flushed and recorded in the manifest.
    pub fn rotate(&mut self) -> Result<u64> {
        self.writer.sync_data()?;
        let frozen = self.active_gen;
        self.active_gen += 1;
        self.writer = Self::create_writer(&self.log_dir, self.active_gen)?;
        Ok(frozen)
    }

    /// Delete every generation file with `gen <= upto`.
    pub fn remove_logs_upto(&self, upto: u64) -> Result<()> {
        for gen in log_gens(&self.log_dir)? {
            if gen <= upto {
                fs::remove_file(log_file(&self.log_dir, gen))?;
            }
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.writer.sync_data()
    }
}

fn log_path(db_path: &Path) -> PathBuf {
    db_path.join("log")
}

fn log_file(log_dir: &Path, gen: u64) -> PathBuf {
    log_dir.join(format!("{}.log", gen))
}

/// Generation ids present in `log_dir`, ascending.
fn log_gens(log_dir: &Path) -> Result<Vec<u64>> {
    let mut gens = Vec::new();
    for entry in fs::read_dir(log_dir)? {
        let path = entry?.path();
        if path.extension().map_or(false, |e| e == "log") {
            if let Some(gen) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                gens.push(gen);
            }
        }
    }
    gens.sort_unstable();
    Ok(gens)
}

#[cfg(test)]
mod tests {
    use crate::wal::{log_file, log_path, WriteAheadLog};
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_replay() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path();

        let (mut wal, records) = WriteAheadLog::open(path).unwrap();
        assert!(records.is_empty());
        for i in 0..100u64 {
            let key = format!("key{}", i).into_bytes();
            if i % 3 == 0 {
                wal.append(i, &key, None, false).unwrap();
            } else if i % 3 == 1 {
                wal.append(i, &key, Some(b""), false).unwrap();
            } else {
                wal.append(i, &key, Some(format!("value{}", i).as_bytes()), false)
                    .unwrap();
            }
        }
        drop(wal);

        let (_wal, records) = WriteAheadLog::open(path).unwrap();
        assert_eq!(records.len(), 100);
        for (i, record) in records.iter().enumerate() {
            let i = i as u64;
            assert_eq!(record.seq, i);
            assert_eq!(record.key, format!("key{}", i).into_bytes());
            match i % 3 {
                0 => assert_eq!(record.value, None),
                1 => assert_eq!(record.value, Some(vec![])),
                _ => assert_eq!(record.value, Some(format!("value{}", i).into_bytes())),
            }
        }
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path();

        let (mut wal, _) = WriteAheadLog::open(path).unwrap();
        for i in 0..10u64 {
            wal.append(i, format!("key{}", i).as_bytes(), Some(b"value"), true)
                .unwrap();
        }
        let gen = wal.active_gen();
        drop(wal);

        // simulate a torn write: a partial record at the end of the file
        let file_path = log_file(&log_path(path), gen);
        let mut file = OpenOptions::new().append(true).open(&file_path).unwrap();
        file.write_all(&11u64.to_le_bytes()).unwrap();
        file.write_all(&[7u8; 3]).unwrap();
        drop(file);

        let (_wal, records) = WriteAheadLog::open(path).unwrap();
        assert_eq!(records.len(), 10);
        assert_eq!(records.last().unwrap().seq, 9);
    }

    #[test]
    fn test_corrupt_record_truncates_rest() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path();

        let (mut wal, _) = WriteAheadLog::open(path).unwrap();
        // fixed-size records so the offset of record 5 is predictable
        for i in 0..10u64 {
            wal.append(i, format!("key{:02}", i).as_bytes(), Some(b"value"), true)
                .unwrap();
        }
        let gen = wal.active_gen();
        drop(wal);

        let record_size = 16 + 5 + 5 + 4;
        let file_path = log_file(&log_path(path), gen);
        let contents = std::fs::read(&file_path).unwrap();
        assert_eq!(contents.len(), record_size * 10);
        let mut contents = contents;
        contents[record_size * 5 + 20] ^= 0xff; // flip a key byte of record 5
        std::fs::write(&file_path, &contents).unwrap();

        let (_wal, records) = WriteAheadLog::open(path).unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records.last().unwrap().seq, 4);
        // the file was truncated at the corruption boundary
        assert_eq!(
            std::fs::metadata(&file_path).unwrap().len(),
            (record_size * 5) as u64
        );
    }

    #[test]
    fn test_rotate_and_remove() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path();

        let (mut wal, _) = WriteAheadLog::open(path).unwrap();
        wal.append(1, b"old", Some(b"1"), false).unwrap();
        let frozen = wal.rotate().unwrap();
        wal.append(2, b"new", Some(b"2"), false).unwrap();

        // both generations replay before the frozen one is removed
        let (_wal2, records) = WriteAheadLog::open(path).unwrap();
        assert_eq!(records.len(), 2);
        drop(_wal2);

        wal.remove_logs_upto(frozen).unwrap();
        drop(wal);

        let (_wal, records) = WriteAheadLog::open(path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].seq, 2);
    }
}
