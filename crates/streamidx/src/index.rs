//! Immutable on-disk stream indexes.
//!
//! An index file is a sealed snapshot of fully reassembled streams covering
//! a contiguous id range. Files are written once and never modified; the
//! manager replaces them wholesale on merge and deletes them when their
//! lock count drops to zero.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stream::{Stream, StreamId};

const MAGIC: &[u8; 8] = b"CSIDX001";

/// Disambiguates index filenames created within the same instant.
static WRITER_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Serialize, Deserialize)]
struct IndexPayload {
    reference_time: DateTime<Utc>,
    streams: Vec<Stream>,
}

/// Reader over a sealed index file. The payload is held in memory; streams
/// are sorted by id.
pub struct IndexFile {
    path: PathBuf,
    reference_time: DateTime<Utc>,
    streams: Vec<Stream>,
    by_id: HashMap<StreamId, usize>,
    packet_count: u64,
}

impl IndexFile {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let raw = fs::read(&path).with_context(|| format!("failed to read index {}", path.display()))?;
        if raw.len() < MAGIC.len() || &raw[..MAGIC.len()] != MAGIC {
            bail!("{} is not an index file", path.display());
        }
        let payload: IndexPayload = bincode::deserialize(&raw[MAGIC.len()..])
            .with_context(|| format!("failed to decode index {}", path.display()))?;
        Self::from_payload(path, payload)
    }

    fn from_payload(path: PathBuf, payload: IndexPayload) -> Result<Self> {
        let mut streams = payload.streams;
        streams.sort_by_key(|s| s.id);
        let mut by_id = HashMap::with_capacity(streams.len());
        let mut packet_count = 0u64;
        for (i, s) in streams.iter().enumerate() {
            if by_id.insert(s.id, i).is_some() {
                bail!("{} contains duplicate stream {}", path.display(), s.id);
            }
            packet_count += s.packet_count() as u64;
        }
        if streams.is_empty() {
            bail!("{} contains no streams", path.display());
        }
        Ok(IndexFile {
            path,
            reference_time: payload.reference_time,
            streams,
            by_id,
            packet_count,
        })
    }

    pub fn filename(&self) -> &Path {
        &self.path
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    pub fn min_stream_id(&self) -> StreamId {
        self.streams.first().map(|s| s.id).unwrap_or(0)
    }

    pub fn max_stream_id(&self) -> StreamId {
        self.streams.last().map(|s| s.id).unwrap_or(0)
    }

    /// Earliest packet time in the index, used as the base for relative
    /// time queries.
    pub fn reference_time(&self) -> DateTime<Utc> {
        self.reference_time
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn stream_ids(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.streams.iter().map(|s| s.id)
    }

    pub fn stream_by_id(&self, id: StreamId) -> Option<&Stream> {
        self.by_id.get(&id).map(|&i| &self.streams[i])
    }

    /// Visits every stream in ascending id order.
    pub fn for_each_stream<E>(&self, mut f: impl FnMut(&Stream) -> Result<(), E>) -> Result<(), E> {
        for s in &self.streams {
            f(s)?;
        }
        Ok(())
    }

    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }
}

/// Seals a batch of streams into a new uniquely named index file.
///
/// Returns `None` without touching the disk when the batch is empty.
pub fn write_index(
    index_dir: &Path,
    reference_time: DateTime<Utc>,
    streams: Vec<Stream>,
) -> Result<Option<IndexFile>> {
    if streams.is_empty() {
        return Ok(None);
    }
    let min = streams.iter().map(|s| s.id).min().unwrap_or(0);
    let max = streams.iter().map(|s| s.id).max().unwrap_or(0);
    let seq = WRITER_SEQ.fetch_add(1, Ordering::Relaxed);
    let name = format!(
        "{}-{:016x}-{:016x}-{:04x}.idx",
        Utc::now().format("%Y%m%d%H%M%S%3f"),
        min,
        max,
        seq & 0xffff,
    );
    let path = index_dir.join(name);

    let payload = IndexPayload {
        reference_time,
        streams,
    };
    let mut file = fs::File::create(&path)
        .with_context(|| format!("failed to create index {}", path.display()))?;
    file.write_all(MAGIC)?;
    let encoded = bincode::serialize(&payload).context("failed to encode index payload")?;
    file.write_all(&encoded)?;
    file.sync_all()?;

    let index = IndexFile::from_payload(path, payload)?;
    Ok(Some(index))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::stream::Chunk;
    use tempfile::TempDir;

    pub(crate) fn stream(id: StreamId, packets: Vec<Chunk>) -> Stream {
        Stream {
            id,
            client_host: "10.0.0.1".into(),
            client_port: 40000 + id as u16,
            server_host: "10.0.0.2".into(),
            server_port: 80,
            protocol: "tcp".into(),
            first_packet: Utc::now(),
            last_packet: Utc::now(),
            packets,
        }
    }

    #[test]
    fn write_and_reopen() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();
        let idx = write_index(
            dir.path(),
            now,
            vec![
                stream(2, vec![Chunk::client("hello")]),
                stream(0, vec![Chunk::server("hi"), Chunk::client("yo")]),
            ],
        )
        .unwrap()
        .expect("non-empty batch");

        assert_eq!(idx.stream_count(), 2);
        assert_eq!(idx.packet_count(), 3);
        assert_eq!(idx.min_stream_id(), 0);
        assert_eq!(idx.max_stream_id(), 2);

        let reopened = IndexFile::open(idx.filename()).unwrap();
        assert_eq!(reopened.stream_count(), 2);
        assert_eq!(
            reopened.stream_by_id(2).unwrap().packets[0].data,
            b"hello".to_vec()
        );
        assert!(reopened.stream_by_id(1).is_none());
    }

    #[test]
    fn empty_batch_writes_nothing() {
        let dir = TempDir::new().unwrap();
        assert!(write_index(dir.path(), Utc::now(), vec![]).unwrap().is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn rejects_non_index_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bogus.idx");
        fs::write(&path, b"not an index at all").unwrap();
        assert!(IndexFile::open(&path).is_err());
    }
}
