pub mod reader;

pub use reader::{chunk_size_for, chunked_read};
