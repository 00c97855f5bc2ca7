//! The `.fidx` filter result store.
//!
//! Record layout:
//!
//! ```text
//! [u64 stream id, little endian] [u64 data size, little endian]
//! [varint chunk sizes, terminated by 0 0]
//! [client-direction bytes] [server-direction bytes]
//! ```
//!
//! `data_size` counts everything after the 16-byte header, which lets the
//! loader skip records without decoding the chunk list. A stream id of
//! `u64::MAX` marks an invalidated record; it is skipped on load.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use streamidx::{Chunk, Direction, StreamId, INVALID_STREAM_ID};

use crate::varint::{read_varint, write_varint};

/// Appends filter results to a `.fidx` store.
pub struct FilterWriter {
    file: BufWriter<File>,
    path: PathBuf,
}

impl FilterWriter {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("failed to open filter store {}", path.display()))?;
        Ok(FilterWriter {
            file: BufWriter::new(file),
            path,
        })
    }

    pub fn append_stream(&mut self, id: StreamId, packets: &[Chunk]) -> Result<()> {
        let mut segmentation = Vec::new();
        let mut want = Direction::ClientToServer;
        for packet in packets {
            if packet.direction != want {
                segmentation.push(0);
                want = want.reverse();
            }
            write_varint(&mut segmentation, packet.data.len() as u64);
            want = want.reverse();
        }
        segmentation.extend_from_slice(&[0, 0]);

        let data_size: u64 = packets.iter().map(|p| p.data.len() as u64).sum();

        self.file.write_all(&id.to_le_bytes())?;
        self.file
            .write_all(&(data_size + segmentation.len() as u64).to_le_bytes())?;
        self.file.write_all(&segmentation)?;
        for direction in [Direction::ClientToServer, Direction::ServerToClient] {
            for packet in packets.iter().filter(|p| p.direction == direction) {
                self.file.write_all(&packet.data)?;
            }
        }
        self.file
            .flush()
            .with_context(|| format!("failed to flush filter store {}", self.path.display()))?;
        Ok(())
    }

    /// Marks a previously appended record as superseded.
    ///
    /// Currently a no-op: the loader keeps the last record per id anyway,
    /// and the tombstone id stays reserved for rewriting headers in place.
    pub fn invalidate_stream(&mut self, _id: StreamId) -> Result<()> {
        Ok(())
    }
}

/// Reads a `.fidx` store, indexing payload offsets per stream id.
pub struct FilterReader {
    file: File,
    path: PathBuf,
    offsets: HashMap<StreamId, u64>,
}

impl FilterReader {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path)
            .with_context(|| format!("failed to open filter store {}", path.display()))?;
        let mut offsets = HashMap::new();

        let mut reader = BufReader::new(&file);
        let mut pos = 0u64;
        let mut header = [0u8; 16];
        loop {
            match read_full(&mut reader, &mut header)? {
                ReadFull::Eof => break,
                ReadFull::Partial => {
                    anyhow::bail!("truncated record header in {}", path.display())
                }
                ReadFull::Done => {}
            }
            let id = u64::from_le_bytes(header[..8].try_into().unwrap());
            let data_size = u64::from_le_bytes(header[8..].try_into().unwrap());
            pos += 16;
            if id != INVALID_STREAM_ID {
                offsets.insert(id, pos);
            }
            io::copy(&mut (&mut reader).take(data_size), &mut io::sink())?;
            pos += data_size;
        }

        Ok(FilterReader {
            file,
            path,
            offsets,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_stream(&self, id: StreamId) -> bool {
        self.offsets.contains_key(&id)
    }

    pub fn stream_ids(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.offsets.keys().copied()
    }

    pub fn read_stream(&mut self, id: StreamId) -> Result<Vec<Chunk>> {
        let pos = *self
            .offsets
            .get(&id)
            .with_context(|| format!("stream {id} not found in {}", self.path.display()))?;
        self.file.seek(SeekFrom::Start(pos))?;
        let mut reader = BufReader::new(&self.file);

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
        Ok(chunks)
    }
}

enum ReadFull {
    Done,
    Eof,
    Partial,
}

fn read_full(r: &mut impl Read, buf: &mut [u8]) -> io::Result<ReadFull> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(if filled == 0 {
                ReadFull::Eof
            } else {
                ReadFull::Partial
            });
        }
        filled += n;
    }
    Ok(ReadFull::Done)
}
