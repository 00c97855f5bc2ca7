//! Reassembled stream records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Monotonically assigned stream identifier. Ids are contiguous from zero
/// across the whole index set.
pub type StreamId = u64;

/// Reserved id marking an invalidated record in the on-disk stores.
pub const INVALID_STREAM_ID: StreamId = u64::MAX;

/// Transfer direction of a chunk of stream data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "client-to-server")]
    ClientToServer,
    #[serde(rename = "server-to-client")]
    ServerToClient,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }

    /// Stable index for two-sided arrays: client side is 0.
    pub fn index(self) -> usize {
        match self {
            Direction::ClientToServer => 0,
            Direction::ServerToClient => 1,
        }
    }

    /// Wire name used by the subprocess protocols.
    pub fn as_wire(self) -> &'static str {
        match self {
            Direction::ClientToServer => "client-to-server",
            Direction::ServerToClient => "server-to-client",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "client-to-server" => Some(Direction::ClientToServer),
            "server-to-client" => Some(Direction::ServerToClient),
            _ => None,
        }
    }
}

/// One directed run of bytes inside a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub direction: Direction,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn client(data: impl Into<Vec<u8>>) -> Self {
        Chunk {
            direction: Direction::ClientToServer,
            data: data.into(),
        }
    }

    pub fn server(data: impl Into<Vec<u8>>) -> Self {
        Chunk {
            direction: Direction::ServerToClient,
            data: data.into(),
        }
    }
}

/// A fully reassembled bidirectional stream as produced by the builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    pub id: StreamId,
    pub client_host: String,
    pub client_port: u16,
    pub server_host: String,
    pub server_port: u16,
    pub protocol: String,
    pub first_packet: DateTime<Utc>,
    pub last_packet: DateTime<Utc>,
    pub packets: Vec<Chunk>,
}

impl Stream {
    /// Total payload bytes in the given direction.
    pub fn bytes(&self, direction: Direction) -> u64 {
        self.packets
            .iter()
            .filter(|p| p.direction == direction)
            .map(|p| p.data.len() as u64)
            .sum()
    }

    /// Concatenated payload of one direction, in packet order.
    pub fn direction_data(&self, direction: Direction) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes(direction) as usize);
        for p in self.packets.iter().filter(|p| p.direction == direction) {
            out.extend_from_slice(&p.data);
        }
        out
    }

    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }
}
