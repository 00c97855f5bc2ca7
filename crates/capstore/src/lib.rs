//! On-disk stream stores.
//!
//! Two append-only binary stores share one chunk encoding: the
//! self-compacting per-converter cache ([`CacheFile`],
//! `converterindex-<name>.cidx`) and the filter result store
//! ([`filter_file`], `filterindex-<name>.fidx`). Chunk sizes are
//! big-endian 7-bit varints alternating directions starting client→server;
//! a lone zero flips sides without a chunk and two consecutive zeros
//! terminate the list. The payload follows as the concatenated client
//! bytes, then the concatenated server bytes.

mod cache_file;
mod filter_file;
mod varint;

pub use cache_file::CacheFile;
pub use filter_file::{FilterReader, FilterWriter};
pub use varint::{read_varint, write_varint};
