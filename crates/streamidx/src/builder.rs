//! Index building: the seam between the manager and pcap parsing.
//!
//! The manager only depends on the [`IndexBuilder`] trait so that tests can
//! inject deterministic in-memory builders. [`PcapDirBuilder`] is the
//! shipped implementation: a minimal classic-pcap reader that reassembles
//! TCP/UDP flows per capture file and seals each file into one index.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::index::{write_index, IndexFile};
use crate::stream::{Chunk, Direction, Stream, StreamId};

/// Metadata about a capture file the builder has processed. Persisted in
/// the manager's state file so reimports can be skipped across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcapInfo {
    pub filename: String,
    pub filesize: u64,
    pub packet_count: u64,
    pub first_packet: Option<DateTime<Utc>>,
    pub last_packet: Option<DateTime<Utc>>,
}

/// Builds and merges index files on behalf of the manager.
pub trait IndexBuilder: Send + Sync {
    /// Processes a prefix of `filenames` (at least one) into new indexes.
    /// New stream ids start at `next_stream_id`; ids below it in the output
    /// mark updates to existing streams.
    fn build_from_pcaps(
        &self,
        pcap_dir: &Path,
        filenames: &[String],
        existing: &[Arc<IndexFile>],
        next_stream_id: StreamId,
        index_dir: &Path,
    ) -> Result<(usize, Vec<Arc<IndexFile>>)>;

    /// Coalesces `indexes` into fewer files. An empty result means the
    /// merge produced nothing and the inputs must stay.
    fn merge(&self, index_dir: &Path, indexes: &[Arc<IndexFile>]) -> Result<Vec<Arc<IndexFile>>>;

    fn known_pcaps(&self) -> Vec<PcapInfo>;

    /// Seeds the processed-pcap list from a recovered state file.
    fn seed_known_pcaps(&self, pcaps: Vec<PcapInfo>);
}

/// The shipped builder: one index per capture file, flows keyed by
/// 4-tuple, the first packet of a flow electing the client side.
#[derive(Default)]
pub struct PcapDirBuilder {
    known: Mutex<Vec<PcapInfo>>,
}

impl PcapDirBuilder {
    pub fn new() -> Self {
        PcapDirBuilder::default()
    }
}

impl IndexBuilder for PcapDirBuilder {
    fn build_from_pcaps(
        &self,
        pcap_dir: &Path,
        filenames: &[String],
        _existing: &[Arc<IndexFile>],
        next_stream_id: StreamId,
        index_dir: &Path,
    ) -> Result<(usize, Vec<Arc<IndexFile>>)> {
        let mut created = Vec::new();
        let mut next_id = next_stream_id;
        let mut processed = 0usize;
        for filename in filenames {
            let path = pcap_dir.join(filename);
            processed += 1;
            let parsed = match parse_pcap(&path) {
                Ok(p) => p,
                Err(e) => {
                    warn!(pcap = %filename, error = %e, "skipping unreadable capture");
                    continue;
                }
            };
            let filesize = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let info = PcapInfo {
                filename: filename.clone(),
                filesize,
                packet_count: parsed.packet_count,
                first_packet: parsed.first_packet,
                last_packet: parsed.last_packet,
            };
            let streams: Vec<Stream> = parsed
                .flows
                .into_iter()
                .map(|mut s| {
                    s.id = next_id;
                    next_id += 1;
                    s
                })
                .collect();
            let reference_time = parsed.first_packet.unwrap_or_else(Utc::now);
            if let Some(index) = write_index(index_dir, reference_time, streams)? {
                created.push(Arc::new(index));
            }
            self.known.lock().unwrap().push(info);
        }
        Ok((processed, created))
    }

    fn merge(&self, index_dir: &Path, indexes: &[Arc<IndexFile>]) -> Result<Vec<Arc<IndexFile>>> {
        let mut by_id: BTreeMap<StreamId, Stream> = BTreeMap::new();
        let mut reference_time: Option<DateTime<Utc>> = None;
        for index in indexes {
            let rt = index.reference_time();
            if reference_time.map(|r| rt < r).unwrap_or(true) {
                reference_time = Some(rt);
            }
            for stream in index.streams() {
                by_id.insert(stream.id, stream.clone());
            }
        }
        let streams: Vec<Stream> = by_id.into_values().collect();
        let reference_time = reference_time.unwrap_or_else(Utc::now);
        match write_index(index_dir, reference_time, streams)? {
            Some(index) => Ok(vec![Arc::new(index)]),
            None => Ok(Vec::new()),
        }
    }

    fn known_pcaps(&self) -> Vec<PcapInfo> {
        self.known.lock().unwrap().clone()
    }

    fn seed_known_pcaps(&self, pcaps: Vec<PcapInfo>) {
        *self.known.lock().unwrap() = pcaps;
    }
}

struct ParsedPcap {
    flows: Vec<Stream>,
    packet_count: u64,
    first_packet: Option<DateTime<Utc>>,
    last_packet: Option<DateTime<Utc>>,
}

#[derive(Hash, PartialEq, Eq, Clone)]
struct FlowKey {
    a: (String, u16),
    b: (String, u16),
    protocol: &'static str,
}

fn parse_pcap(path: &Path) -> Result<ParsedPcap> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    if raw.len() < 24 {
        bail!("truncated pcap header");
    }
    let magic = u32::from_le_bytes(raw[0..4].try_into().unwrap());
    let (le, nanos) = match magic {
        0xa1b2_c3d4 => (true, false),
        0xa1b2_3c4d => (true, true),
        0xd4c3_b2a1 => (false, false),
        0x4d3c_b2a1 => (false, true),
        _ => bail!("not a classic pcap file"),
    };
    let read_u32 = |buf: &[u8]| -> u32 {
        let b: [u8; 4] = buf.try_into().unwrap();
        if le {
            u32::from_le_bytes(b)
        } else {
            u32::from_be_bytes(b)
        }
    };

    let mut flows: HashMap<FlowKey, usize> = HashMap::new();
    let mut streams: Vec<Stream> = Vec::new();
    let mut packet_count = 0u64;
    let mut first_packet = None;
    let mut last_packet = None;

    let mut pos = 24usize;
    while pos + 16 <= raw.len() {
        let ts_sec = read_u32(&raw[pos..pos + 4]) as i64;
        let ts_frac = read_u32(&raw[pos + 4..pos + 8]) as u32;
        let incl_len = read_u32(&raw[pos + 8..pos + 12]) as usize;
        pos += 16;
        if pos + incl_len > raw.len() {
            bail!("truncated packet record");
        }
        let data = &raw[pos..pos + incl_len];
        pos += incl_len;
        packet_count += 1;

        let ts_nanos = if nanos { ts_frac } else { ts_frac.saturating_mul(1000) };
        let ts = Utc
            .timestamp_opt(ts_sec, ts_nanos)
            .single()
            .unwrap_or_else(Utc::now);
        if first_packet.is_none() {
            first_packet = Some(ts);
        }
        last_packet = Some(ts);

        let Some(pkt) = parse_ethernet_ipv4(data) else {
            continue;
        };

        let key = FlowKey {
            a: (pkt.src.clone(), pkt.sport),
            b: (pkt.dst.clone(), pkt.dport),
            protocol: pkt.protocol,
        };
        let reverse = FlowKey {
            a: key.b.clone(),
            b: key.a.clone(),
            protocol: pkt.protocol,
        };
        let (idx, direction) = if let Some(&i) = flows.get(&key) {
            (i, Direction::ClientToServer)
        } else if let Some(&i) = flows.get(&reverse) {
            (i, Direction::ServerToClient)
        } else {
            let i = streams.len();
            flows.insert(key, i);
            streams.push(Stream {
                id: 0,
                client_host: pkt.src.clone(),
                client_port: pkt.sport,
                server_host: pkt.dst.clone(),
                server_port: pkt.dport,
                protocol: pkt.protocol.to_string(),
                first_packet: ts,
                last_packet: ts,
                packets: Vec::new(),
            });
            (i, Direction::ClientToServer)
        };
        let stream = &mut streams[idx];
        stream.last_packet = ts;
        if !pkt.payload.is_empty() {
            stream.packets.push(Chunk {
                direction,
                data: pkt.payload.to_vec(),
            });
        }
    }

    Ok(ParsedPcap {
        flows: streams,
        packet_count,
        first_packet,
        last_packet,
    })
}

struct L4Packet<'a> {
    src: String,
    dst: String,
    sport: u16,
    dport: u16,
    protocol: &'static str,
    payload: &'a [u8],
}

fn parse_ethernet_ipv4(data: &[u8]) -> Option<L4Packet<'_>> {
    if data.len() < 14 || data[12] != 0x08 || data[13] != 0x00 {
        return None;
    }
    let ip = &data[14..];
    if ip.len() < 20 || ip[0] >> 4 != 4 {
        return None;
    }
    let ihl = ((ip[0] & 0x0f) as usize) * 4;
    let total_len = u16::from_be_bytes([ip[2], ip[3]]) as usize;
    if ihl < 20 || ip.len() < total_len || total_len < ihl {
        return None;
    }
    let src = format!("{}.{}.{}.{}", ip[12], ip[13], ip[14], ip[15]);
    let dst = format!("{}.{}.{}.{}", ip[16], ip[17], ip[18], ip[19]);
    let l4 = &ip[ihl..total_len];
    match ip[9] {
        6 => {
            if l4.len() < 20 {
                return None;
            }
            let data_off = ((l4[12] >> 4) as usize) * 4;
            if l4.len() < data_off {
                return None;
            }
            Some(L4Packet {
                src,
                dst,
                sport: u16::from_be_bytes([l4[0], l4[1]]),
                dport: u16::from_be_bytes([l4[2], l4[3]]),
                protocol: "tcp",
                payload: &l4[data_off..],
            })
        }
        17 => {
            if l4.len() < 8 {
                return None;
            }
            Some(L4Packet {
                src,
                dst,
                sport: u16::from_be_bytes([l4[0], l4[1]]),
                dport: u16::from_be_bytes([l4[2], l4[3]]),
                protocol: "udp",
                payload: &l4[8..],
            })
        }
        _ => None,
    }
}
