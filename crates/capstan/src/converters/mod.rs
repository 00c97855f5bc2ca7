//! Converters: external programs producing alternative views of stream
//! bytes, fronted by an on-disk cache.

pub(crate) mod wire;
mod worker;

pub use wire::{StreamData, StreamMetadata};
pub use worker::{Converter, ProcessStats};

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;

use capstore::CacheFile;
use streamidx::query::{ConverterAccess, SearchableData};
use streamidx::{Chunk, Stream, StreamId};

/// Converter names appear in the query language, so they are restricted to
/// plain identifiers. `none` is reserved to mean "the unconverted bytes".
pub const RESERVED_CONVERTER_NAME: &str = "none";

pub fn valid_converter_name(name: &str) -> bool {
    !name.is_empty()
        && name != RESERVED_CONVERTER_NAME
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone, Serialize)]
pub struct ConverterStats {
    pub name: String,
    pub cached_stream_count: u64,
    pub processes: Vec<ProcessStats>,
}

/// A converter worker paired with its append/compact cache.
pub struct CachedConverter {
    worker: Converter,
    cache: CacheFile,
}

impl CachedConverter {
    /// Opens (or creates) `converterindex-<name>.cidx` in `index_dir` and
    /// prepares the subprocess pool.
    pub fn new(
        name: &str,
        executable: &Path,
        index_dir: &Path,
        max_processes: usize,
        stderr_limit: usize,
    ) -> Result<Self> {
        let cache_path = cache_path(index_dir, name);
        let cache = CacheFile::open(cache_path)?;
        Ok(CachedConverter {
            worker: Converter::new(name, executable, max_processes, stderr_limit),
            cache,
        })
    }

    pub fn name(&self) -> &str {
        self.worker.name()
    }

    pub fn executable(&self) -> &Path {
        self.worker.executable()
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.cache.contains(id)
    }

    /// Converted packets for a stream, served from the cache when present
    /// and converted (then cached) otherwise.
    pub async fn data(&self, stream: &Stream) -> Result<(Vec<Chunk>, u64, u64)> {
        if let Some(cached) = self.cache.data(stream.id)? {
            return Ok(cached);
        }
        let packets = self.worker.data(stream).await?;
        self.cache.set_data(stream.id, &packets)?;
        let client_bytes: u64 = packets
            .iter()
            .filter(|p| p.direction == streamidx::Direction::ClientToServer)
            .map(|p| p.data.len() as u64)
            .sum();
        let server_bytes: u64 = packets
            .iter()
            .filter(|p| p.direction == streamidx::Direction::ServerToClient)
            .map(|p| p.data.len() as u64)
            .sum();
        Ok((packets, client_bytes, server_bytes))
    }

    /// Cached packets only; `None` when the stream has not been converted.
    pub fn cached_data(&self, id: StreamId) -> Result<Option<(Vec<Chunk>, u64, u64)>> {
        self.cache.data(id)
    }

    /// Stops all processes and drops the cache file contents.
    pub async fn reset(&self) -> Result<()> {
        self.worker.reset().await;
        self.cache.reset()
    }

    /// Stops the subprocesses but keeps the cache. Used at shutdown.
    pub async fn close(&self) {
        self.worker.reset().await;
    }

    pub async fn stats(&self) -> ConverterStats {
        ConverterStats {
            name: self.name().to_string(),
            cached_stream_count: self.cache.stream_count(),
            processes: self.worker.process_stats().await,
        }
    }

    pub async fn stderrs(&self) -> Vec<Vec<String>> {
        self.worker.stderrs().await
    }
}

impl ConverterAccess for CachedConverter {
    fn data_for_search(&self, id: StreamId) -> Result<Option<SearchableData>> {
        self.cache.data_for_search(id)
    }
}

pub fn cache_path(index_dir: &Path, name: &str) -> PathBuf {
    index_dir.join(format!("converterindex-{name}.cidx"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converter_name_rules() {
        assert!(valid_converter_name("websockets"));
        assert!(valid_converter_name("http_0_9"));
        assert!(!valid_converter_name("none"));
        assert!(!valid_converter_name(""));
        assert!(!valid_converter_name("has space"));
        assert!(!valid_converter_name("dash-ed"));
        assert!(!valid_converter_name("dotted.name"));
    }

    #[test]
    fn cache_path_shape() {
        let p = cache_path(Path::new("/idx"), "ws");
        assert_eq!(p, PathBuf::from("/idx/converterindex-ws.cidx"));
    }
}
