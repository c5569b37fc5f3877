//! Log source discovery, caching and line acquisition.

pub mod cache;
pub mod reader;
pub mod resolver;

pub use cache::{CacheStore, JsonCache};
pub use reader::{LineReader, LineSource, RawLine, ReadStrategy, RelevantLines};
pub use resolver::{SourceDescriptor, SourceMode, SourceResolver};
