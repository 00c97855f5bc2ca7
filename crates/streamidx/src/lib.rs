//! Stream data model, immutable index files and query evaluation.
//!
//! This crate holds everything the stream manager shares with its
//! collaborators: the reassembled [`Stream`](stream::Stream) record, the
//! dense [`StreamSet`](bitmask::StreamSet) bitmask used for match and
//! uncertainty bookkeeping, the immutable on-disk index
//! ([`IndexFile`](index::IndexFile)), the [`IndexBuilder`](builder::IndexBuilder)
//! seam behind which pcap parsing lives, and the query language with its
//! [`search_streams`](query::search_streams) evaluator.

pub mod bitmask;
pub mod builder;
pub mod index;
pub mod query;
pub mod stream;

pub use bitmask::StreamSet;
pub use stream::{Chunk, Direction, Stream, StreamId, INVALID_STREAM_ID};
