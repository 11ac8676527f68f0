//! Wire format: an 8-byte big-endian header (`u32` message code, `u32`
//! payload length) followed by a DEFLATE-compressed JSON payload. The
//! compressor runs at best compression and is stateless per message.

use std::io::{Read, Write};

use ethereum_types::{H256, U256};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::TransportError;
use crate::types::{Block, Transaction};

/// Upper bound on a single frame's compressed payload.
const MAX_PAYLOAD: u32 = 64 * 1024 * 1024;

/// The closed set of peer messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    Handshake {
        head: H256,
        total_difficulty: U256,
        number: u64,
    },
    NewBlock {
        block: Block,
    },
    NewTransaction {
        transaction: Transaction,
    },
    GetBlocks {
        from: u64,
        to: u64,
    },
    Blocks {
        blocks: Vec<Block>,
    },
    Ping {
        nonce: u64,
    },
    Pong {
        nonce: u64,
    },
}

impl Message {
    pub fn code(&self) -> u32 {
        match self {
            Message::Handshake { .. } => 0x00,
            Message::NewBlock { .. } => 0x01,
            Message::NewTransaction { .. } => 0x02,
            Message::GetBlocks { .. } => 0x03,
            Message::Blocks { .. } => 0x04,
            Message::Ping { .. } => 0x05,
            Message::Pong { .. } => 0x06,
        }
    }
}

/// DEFLATE at best compression.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, TransportError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data)?;
    encoder.finish().map_err(TransportError::Io)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, TransportError> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|err| TransportError::Decompress(err.to_string()))?;
    Ok(out)
}

/// Serialize a message into a complete frame: header plus compressed
/// payload.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, TransportError> {
    let payload = serde_json::to_vec(message).map_err(|err| TransportError::Decode(err.to_string()))?;
    let compressed = compress(&payload)?;
    let mut frame = Vec::with_capacity(8 + compressed.len());
    frame.extend_from_slice(&message.code().to_be_bytes());
    frame.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
    frame.extend_from_slice(&compressed);
    Ok(frame)
}

/// Parse one frame's payload back into a message, verifying the header code
/// against the decoded variant.
pub fn decode_payload(code: u32, payload: &[u8]) -> Result<Message, TransportError> {
    let decompressed = decompress(payload)?;
    let message: Message = serde_json::from_slice(&decompressed)
        .map_err(|err| TransportError::Decode(err.to_string()))?;
    if message.code() != code {
        return Err(TransportError::Decode(format!(
            "frame code {code} does not match payload variant {}",
            message.code()
        )));
    }
    Ok(message)
}

/// Read one frame from the stream.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, TransportError> {
    let mut header = [0u8; 8];
    reader.read_exact(&mut header).await?;
    let code = u32::from_be_bytes(header[..4].try_into().expect("4-byte slice"));
    let size = u32::from_be_bytes(header[4..].try_into().expect("4-byte slice"));
    if size > MAX_PAYLOAD {
        return Err(TransportError::Decode(format!("oversized frame: {size} bytes")));
    }
    let mut payload = vec![0u8; size as usize];
    reader.read_exact(&mut payload).await?;
    decode_payload(code, &payload)
}

/// Write one already-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &[u8],
) -> Result<(), TransportError> {
    writer.write_all(frame).await?;
    Ok(())
}
