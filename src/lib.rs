#[cfg(feature = "async")]
pub mod async_ext;
pub mod config;
pub mod engine;
pub mod error;
pub mod memory;
pub mod process;

pub use error::{MemOpError, MemOpResult, MemOpResultExt};
