//! Built-in muxer and writer implementations.

mod file_writer;
mod memory_writer;
mod raw_muxer;

pub use file_writer::FileWriter;
pub use memory_writer::{MemoryFragment, MemoryStore, MemoryWriter, WriterOp};
pub use raw_muxer::RawMuxer;
