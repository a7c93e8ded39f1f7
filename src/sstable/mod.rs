//! Sorted table, which is stored in disk.
//!
//! # Table layout
//!
//! A table is stored in a file named `<file_id>` under one directory per
//! level (`<db_path>/<level>/<file_id>`). Each table holds exactly one
//! version per user key, entries ascending by key.
//!
//! ```text
//! +-------------------------+ (offset 0)
//! | Data Block 1            |<-+
//! +-------------------------+  |
//! | Data Block 2            |<-+
//! +-------------------------+  |
//! | ...                     |  |
//! +-------------------------+  |
//! | Data Block n            |<-+
//! +-------------------------+  |
//! | Index Block             |--+
//! +-------------------------+
//! | Filter Block            |
//! +-------------------------+
//! | Footer                  |
//! +-------------------------+
//! ```
//!
//! ## Index Block
//!
//! The table's minimum user key followed by one entry per data block:
//!
//! ```text
//! +--------------------------+
//! | min key length | min key |
//! +-------------------------------------------------------+
//! | offset | length | max key1 length | max key1 | -> Data Block1
//! +-------------------------------------------------------+
//! | offset | length | max key2 length | max key2 | -> Data Block2
//! +-------------------------------------------------------+
//! |                        ...                            |
//! +-------------------------------------------------------+
//! \--------/\-------/\----------------/\---------/
//!    u64       u64          u32          var-len
//! ```
//!
//! ## Filter Block
//!
//! Bloom filter bit array over every user key in the table, followed by one
//! byte holding the probe count.
//!
//! ## Footer
//!
//! Fixed 48 bytes: index offset, index length, filter offset, filter
//! length, entry count, magic number (all u64).
//!
//! Entry layout inside a data block is documented in [`data_block`].
//! All fixed-length integers are little-endian.

pub(crate) mod data_block;
pub(crate) mod filter_block;
pub(crate) mod footer;
pub(crate) mod index_block;
pub mod table_handle;

use std::path::{Path, PathBuf};

pub type TableId = u64;

pub(crate) fn sstable_path(db_path: &Path, level: usize, table_id: TableId) -> PathBuf {
    db_path.join(level.to_string()).join(table_id.to_string())
}

pub(crate) fn temp_file_name(file_path: &Path) -> PathBuf {
    let mut name = file_path.as_os_str().to_owned();
    name.push("_write");
    PathBuf::from(name)
}
