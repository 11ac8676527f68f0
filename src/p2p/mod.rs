//! Peer-to-peer transport: framing and compression, per-peer priority
//! queues with batched flushing, and the TCP server.

mod codec;
mod priority;
mod server;

pub use codec::{compress, decode_payload, decompress, encode_frame, read_message, Message};
pub use priority::{Priority, PriorityQueue};
pub use server::{MessageHandler, P2pServer, BATCH_INTERVAL, LATENCY_PROBES, PROBE_SPACING};
