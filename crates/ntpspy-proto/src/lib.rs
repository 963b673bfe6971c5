// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! Covert NTP wire protocol types and parsing logic.
//!
//! Every datagram this crate produces is shaped like a legitimate NTPv4
//! client or server packet (RFC 5905): a 48-byte header with plausible
//! stratum, poll, precision, and reference-ID fields, optionally followed
//! by a 16-byte trailer sized like a MAC (key identifier + digest). The
//! four 64-bit timestamp fields are repurposed to carry a private framing:
//! a message kind, a transfer identifier, a chunk index, and a 32-bit magic
//! discriminator that separates covert traffic from ordinary NTP.
//!
//! This crate is pure codec: no sockets, no clocks beyond a timestamp
//! helper, no session state. The client and server engines live in
//! `ntpspy-client` and `ntpspy-server`.

#![warn(missing_docs)]

/// Custom error types for datagram parsing and serialization.
pub mod error;

/// Covert message kinds and their 48/64-byte wire form.
pub mod message;

/// Filename fitting and sanitation for the 16-byte Start trailer.
pub mod name;

/// NTP shell constants and camouflage field types (RFC 5905).
pub mod protocol;

/// Bit set tracking which chunks of a transfer have been seen.
mod bitmap;

pub use self::bitmap::ChunkBitmap;
pub use self::error::ParseError;
pub use self::message::{AckOf, ChunkPayload, Message, NakReason};
pub use self::protocol::Magic;

/// Covert protocol version carried in QueryReply.
pub const PROTOCOL_VERSION: u32 = 1;

/// Size of the mandatory NTP header; also the size of every non-payload datagram.
pub const HEADER_LEN: usize = 48;

/// Size of the repurposed MAC-shaped trailer carried by Start and Data.
pub const TRAILER_LEN: usize = 16;

/// Largest datagram the protocol ever emits (header + trailer).
pub const DATAGRAM_MAX: usize = HEADER_LEN + TRAILER_LEN;

/// Maximum covert payload bytes per Data datagram.
pub const MAX_PAYLOAD: usize = 16;

/// Chunk-index sentinel for messages that do not address a chunk.
pub const NO_CHUNK: u32 = 0xFFFF_FFFF;

/// Number of chunks needed to carry `total_size` bytes.
pub fn chunk_count(total_size: u64) -> u64 {
    total_size.div_ceil(MAX_PAYLOAD as u64)
}
