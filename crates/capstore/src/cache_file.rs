//! The per-converter append/compact cache file.
//!
//! Record layout:
//!
//! ```text
//! [u64 stream id, little endian]
//! [varint chunk sizes, alternating directions, terminated by 0 0]
//! [client-direction bytes] [server-direction bytes]
//! ```
//!
//! Overwriting a stream appends a fresh record and marks the old byte
//! range as free; once enough of the file is free the live tail is
//! rewritten in place from the earliest free offset and the file is
//! truncated. New records always append at the end of the file, cleanup or
//! not.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;

use streamidx::query::SearchableData;
use streamidx::{Chunk, Direction, StreamId};

use crate::varint::{read_varint, write_varint};

const HEADER_SIZE: u64 = 8;

/// Cleanup runs when at least this many bytes are free...
pub const CLEANUP_MIN_FREE: u64 = 16 * 1024 * 1024;
/// ...and the free share of the file is at least this factor.
pub const CLEANUP_MIN_FREE_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
struct StreamInfo {
    /// Byte offset of the record payload (right after the id header).
    offset: u64,
    /// Payload size: chunk-size varints plus data bytes.
    size: u64,
}

struct Inner {
    file: File,
    path: PathBuf,
    file_size: u64,
    free_size: u64,
    free_start: u64,
    min_free: u64,
    min_free_factor: f64,
    stream_infos: HashMap<StreamId, StreamInfo>,
}

/// Append/compact cache of converted stream bytes, keyed by stream id.
/// Reads take a shared lock, writes and compaction an exclusive one.
pub struct CacheFile {
    inner: RwLock<Inner>,
}

impl CacheFile {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_thresholds(path, CLEANUP_MIN_FREE, CLEANUP_MIN_FREE_FACTOR)
    }

    /// Opens the cache with custom cleanup thresholds.
    pub fn with_thresholds(
        path: impl Into<PathBuf>,
        min_free: u64,
        min_free_factor: f64,
    ) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open cache {}", path.display()))?;

        let mut inner = Inner {
            file,
            path,
            file_size: 0,
            free_size: 0,
            free_start: 0,
            min_free,
            min_free_factor,
            stream_infos: HashMap::new(),
        };
        inner.scan()?;
        Ok(CacheFile {
            inner: RwLock::new(inner),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.inner.read().path.clone()
    }

    pub fn stream_count(&self) -> u64 {
        self.inner.read().stream_infos.len() as u64
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.inner.read().stream_infos.contains_key(&id)
    }

    /// Drops every record and truncates the file to zero.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.write();
        inner.file.set_len(0).context("failed to truncate cache")?;
        inner.stream_infos.clear();
        inner.file_size = 0;
        inner.free_size = 0;
        inner.free_start = 0;
        Ok(())
    }

    /// Returns the ordered chunk list of a cached stream together with the
    /// per-direction byte totals, or `None` when the stream is absent.
    pub fn data(&self, id: StreamId) -> Result<Option<(Vec<Chunk>, u64, u64)>> {
        let inner = self.inner.read();
        let Some(info) = inner.stream_infos.get(&id).copied() else {
            return Ok(None);
        };
        let mut reader = BufReader::new(section(&inner.file, info.offset, info.size));

        let mut sizes: Vec<(Direction, u64)> = Vec::new();
        let mut totals = [0u64; 2];
        let mut direction = Direction::ClientToServer;
        let mut prev_was_zero = false;
        loop {
            let (sz, _) = read_varint(&mut reader)?;
            if sz == 0 && prev_was_zero {
                break;
            }
            sizes.push((direction, sz));
            prev_was_zero = sz == 0;
            totals[direction.index()] += sz;
            direction = direction.reverse();
        }

        let mut client = vec![0u8; totals[0] as usize];
        reader.read_exact(&mut client)?;
        let mut server = vec![0u8; totals[1] as usize];
        reader.read_exact(&mut server)?;

        let mut chunks = Vec::new();
        let (mut client, mut server) = (&client[..], &server[..]);
        for (direction, sz) in sizes {
            if sz == 0 {
                continue;
            }
            let data = match direction {
                Direction::ClientToServer => {
                    let (head, tail) = client.split_at(sz as usize);
                    client = tail;
                    head
                }
                Direction::ServerToClient => {
                    let (head, tail) = server.split_at(sz as usize);
                    server = tail;
                    head
                }
            };
            chunks.push(Chunk {
                direction,
                data: data.to_vec(),
            });
        }
        Ok(Some((chunks, totals[0], totals[1])))
    }

    /// Returns the two concatenated per-direction byte runs plus the
    /// cumulative per-chunk offsets, the shape the search engine consumes.
    pub fn data_for_search(&self, id: StreamId) -> Result<Option<SearchableData>> {
        let inner = self.inner.read();
        let Some(info) = inner.stream_infos.get(&id).copied() else {
            return Ok(None);
        };
        let mut reader = BufReader::new(section(&inner.file, info.offset, info.size));

        let mut offsets: Vec<[u64; 2]> = vec![[0, 0]];
        let mut totals = [0u64; 2];
        let mut direction = Direction::ClientToServer;
        let mut prev_was_zero = false;
        loop {
            let (sz, _) = read_varint(&mut reader)?;
            if sz == 0 {
                if prev_was_zero {
                    break;
                }
                prev_was_zero = true;
                direction = direction.reverse();
                continue;
            }
            let mut next = *offsets.last().unwrap();
            next[direction.index()] += sz;
            offsets.push(next);
            totals[direction.index()] += sz;
            prev_was_zero = false;
            direction = direction.reverse();
        }

        let mut client = vec![0u8; totals[0] as usize];
        reader.read_exact(&mut client)?;
        let mut server = vec![0u8; totals[1] as usize];
        reader.read_exact(&mut server)?;
        Ok(Some(SearchableData {
            client,
            server,
            offsets,
        }))
    }

    /// Stores the converted packets of a stream, superseding any previous
    /// record and compacting the file when the free-space thresholds are
    /// crossed.
    pub fn set_data(&self, id: StreamId, packets: &[Chunk]) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(info) = inner.stream_infos.get(&id).copied() {
            inner.free_size += info.size + HEADER_SIZE;
            if inner.free_start > info.offset - HEADER_SIZE {
                inner.free_start = info.offset - HEADER_SIZE;
            }
            let threshold =
                (inner.file_size as f64 * inner.min_free_factor).ceil() as u64;
            if inner.free_size >= inner.min_free && inner.free_size >= threshold {
                inner.stream_infos.remove(&id);
                inner.compact()?;
            }
        }

        let mut record = Vec::new();
        record.extend_from_slice(&id.to_le_bytes());
        encode_payload(&mut record, packets);
        let payload_size = record.len() as u64 - HEADER_SIZE;

        let at = inner.file_size;
        inner
            .file
            .write_all_at(&record, at)
            .context("failed to append cache record")?;

        inner.stream_infos.insert(
            id,
            StreamInfo {
                offset: at + HEADER_SIZE,
                size: payload_size,
            },
        );
        if inner.free_start == inner.file_size {
            inner.free_start += record.len() as u64;
        }
        inner.file_size += record.len() as u64;
        Ok(())
    }
}

/// Encodes the alternating chunk-size list and the two direction payloads.
fn encode_payload(out: &mut Vec<u8>, packets: &[Chunk]) {
    let mut want = Direction::ClientToServer;
    for packet in packets {
        if packet.direction != want {
            // A zero flips sides without consuming a chunk.
            out.push(0);
            want = want.reverse();
        }
        write_varint(out, packet.data.len() as u64);
        want = want.reverse();
    }
    out.extend_from_slice(&[0, 0]);
    for direction in [Direction::ClientToServer, Direction::ServerToClient] {
        for packet in packets.iter().filter(|p| p.direction == direction) {
            out.extend_from_slice(&packet.data);
        }
    }
}

impl Inner {
    /// Rebuilds the in-memory index from the file, accounting superseded
    /// duplicate records as free space.
    fn scan(&mut self) -> Result<()> {
        let len = self.file.metadata()?.len();
        let mut reader = BufReader::new(section(&self.file, 0, len));
        loop {
            let id = match read_id_header(&mut reader) {
                Ok(Some(id)) => id,
                Ok(None) => break,
                Err(e) => return Err(e).context("failed to read stream header"),
            };
            self.file_size += HEADER_SIZE;

            let mut length_size = 0u64;
            let mut data_size = 0u64;
            let mut zeros = 0;
            while zeros < 2 {
                let (sz, n) = read_varint(&mut reader).context("failed to read chunk size")?;
                length_size += n as u64;
                data_size += sz;
                zeros = if sz == 0 { zeros + 1 } else { 0 };
            }
            io::copy(
                &mut (&mut reader).take(data_size),
                &mut io::sink(),
            )
            .context("failed to skip record data")?;

            if let Some(prev) = self.stream_infos.get(&id).copied() {
                if self.free_size == 0 || self.free_start > prev.offset - HEADER_SIZE {
                    self.free_start = prev.offset - HEADER_SIZE;
                }
                self.free_size += HEADER_SIZE + prev.size;
            }
            self.stream_infos.insert(
                id,
                StreamInfo {
                    offset: self.file_size,
                    size: length_size + data_size,
                },
            );
            self.file_size += length_size + data_size;
        }
        if self.free_size == 0 {
            self.free_start = self.file_size;
        }
        Ok(())
    }

    /// Rewrites every live record at or after `free_start` leftwards over
    /// the free space and truncates the file. The read cursor always stays
    /// ahead of the write cursor, so positioned reads and writes on the
    /// same file cannot collide.
    fn compact(&mut self) -> Result<()> {
        let mut read_pos = self.free_start;
        let mut write_pos = self.free_start;
        let end = self.file_size;
        let mut reader = BufReader::new(section(&self.file, read_pos, end - read_pos));

        while read_pos < end {
            let Some(id) = read_id_header(&mut reader).context("compaction header read")? else {
                bail!("cache ended mid-record during compaction");
            };
            let payload_offset = read_pos + HEADER_SIZE;

            let mut varints = Vec::new();
            let mut data_size = 0u64;
            let mut zeros = 0;
            while zeros < 2 {
                let (sz, _) = read_varint_capture(&mut reader, &mut varints)?;
                data_size += sz;
                zeros = if sz == 0 { zeros + 1 } else { 0 };
            }
            let payload_size = varints.len() as u64 + data_size;

            let live = self
                .stream_infos
                .get(&id)
                .map(|i| i.offset == payload_offset)
                .unwrap_or(false);
            if live {
                let mut record =
                    Vec::with_capacity((HEADER_SIZE + payload_size) as usize);
                record.extend_from_slice(&id.to_le_bytes());
                record.extend_from_slice(&varints);
                let data_start = record.len();
                record.resize(data_start + data_size as usize, 0);
                reader.read_exact(&mut record[data_start..])?;

                self.file.write_all_at(&record, write_pos)?;
                self.stream_infos.insert(
                    id,
                    StreamInfo {
                        offset: write_pos + HEADER_SIZE,
                        size: payload_size,
                    },
                );
                write_pos += record.len() as u64;
            } else {
                io::copy(&mut (&mut reader).take(data_size), &mut io::sink())?;
            }
            read_pos = payload_offset + payload_size;
        }

        self.file.set_len(write_pos)?;
        self.file_size = write_pos;
        self.free_size = 0;
        self.free_start = write_pos;
        Ok(())
    }
}

/// Reads the 8-byte little-endian id header. `None` at a clean EOF,
/// an error when the file ends inside the header.
fn read_id_header(r: &mut impl Read) -> Result<Option<u64>> {
    let mut buf = [0u8; 8];
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            bail!("truncated record header");
        }
        filled += n;
    }
    Ok(Some(u64::from_le_bytes(buf)))
}

/// Like [`read_varint`] but also copies the raw bytes into `captured`.
fn read_varint_capture(r: &mut impl Read, captured: &mut Vec<u8>) -> Result<(u64, usize)> {
    let mut value = 0u64;
    let mut consumed = 0usize;
    let mut byte = [0u8; 1];
    loop {
        r.read_exact(&mut byte)?;
        captured.push(byte[0]);
        consumed += 1;
        value = (value << 7) | u64::from(byte[0] & 0x7f);
        if byte[0] < 0x80 {
            return Ok((value, consumed));
        }
    }
}

struct Section<'a> {
    file: &'a File,
    pos: u64,
    end: u64,
}

fn section(file: &File, pos: u64, len: u64) -> Section<'_> {
    Section {
        file,
        pos,
        end: pos + len,
    }
}

impl Read for Section<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = (self.end - self.pos).min(buf.len() as u64) as usize;
        if remaining == 0 {
            return Ok(0);
        }
        let n = self.file.read_at(&mut buf[..remaining], self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}
