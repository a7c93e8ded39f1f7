//! Engine facade and its supporting types.

pub mod db_iter;
pub mod engine;
pub mod key_types;
pub mod options;

pub use engine::{EngineState, LsmKV};
pub use key_types::{UserKey, Value};
pub use options::Options;
