//! Line-delimited JSON protocol spoken with converter and filter
//! subprocesses.
//!
//! Per stream, the program receives one metadata object, one object per
//! packet with base64 payload, and a bare newline. It answers with zero or
//! more packet objects, a bare newline, and one metadata object. Any
//! malformed frame poisons the process.

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, BufReader, Lines};
use tokio::process::{ChildStdin, ChildStdout};

use streamidx::{Chunk, Direction, Stream};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StreamMetadata {
    pub client_host: String,
    pub client_port: u16,
    pub server_host: String,
    pub server_port: u16,
    pub protocol: String,
}

impl From<&Stream> for StreamMetadata {
    fn from(s: &Stream) -> Self {
        StreamMetadata {
            client_host: s.client_host.clone(),
            client_port: s.client_port,
            server_host: s.server_host.clone(),
            server_port: s.server_port,
            protocol: s.protocol.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StreamData {
    pub direction: String,
    pub data: String,
}

/// Writes one stream to the subprocess: metadata, packets, terminator.
pub async fn send_stream(stdin: &mut ChildStdin, stream: &Stream) -> Result<()> {
    let mut out = serde_json::to_vec(&StreamMetadata::from(stream))?;
    out.push(b'\n');
    for packet in &stream.packets {
        let frame = StreamData {
            direction: packet.direction.as_wire().to_string(),
            data: BASE64.encode(&packet.data),
        };
        out.extend_from_slice(&serde_json::to_vec(&frame)?);
        out.push(b'\n');
    }
    out.push(b'\n');
    stdin
        .write_all(&out)
        .await
        .context("failed to write stream to subprocess")?;
    stdin.flush().await.context("failed to flush subprocess stdin")?;
    Ok(())
}

/// Reads the subprocess response for one stream: packets until the empty
/// line, then the trailing metadata object.
pub async fn read_response(
    stdout: &mut Lines<BufReader<ChildStdout>>,
) -> Result<(Vec<Chunk>, StreamMetadata)> {
    let mut packets = Vec::new();
    loop {
        let line = stdout
            .next_line()
            .await
            .context("failed to read from subprocess")?
            .ok_or_else(|| anyhow!("subprocess closed its stdout mid-stream"))?;
        if line.is_empty() {
            break;
        }
        let frame: StreamData =
            serde_json::from_str(&line).context("malformed packet frame")?;
        let Some(direction) = Direction::from_wire(&frame.direction) else {
            bail!("invalid direction {:?}", frame.direction);
        };
        let data = BASE64
            .decode(frame.data.as_bytes())
            .context("bad base64 in packet frame")?;
        packets.push(Chunk { direction, data });
    }
    let line = stdout
        .next_line()
        .await
        .context("failed to read from subprocess")?
        .ok_or_else(|| anyhow!("subprocess closed its stdout before the metadata frame"))?;
    let metadata: StreamMetadata =
        serde_json::from_str(&line).context("malformed metadata frame")?;
    Ok((packets, metadata))
}
