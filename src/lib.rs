#[macro_use]
extern crate log;

pub use db::engine::{EngineState, LsmKV};
pub use db::options::Options;

pub mod bloom;
mod compact;
pub mod db;
pub mod error;
mod hash;
mod ioutils;
pub mod memory;
pub mod sstable;
pub mod version;
pub mod wal;

pub type Result<T> = std::result::Result<T, error::Error>;
