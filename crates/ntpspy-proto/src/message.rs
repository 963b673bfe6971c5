// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! Covert message kinds and their fixed wire form.
//!
//! The seven kinds form the protocol alphabet. Each is carried in one
//! NTP-shaped datagram whose timestamp fields are repurposed as follows
//! (all values network byte order):
//!
//! ```ignore
//! offset  size  field
//!  0      1     LI|VN|Mode            ; 0x23 client kinds, 0x24 server kinds
//!  1      1     Stratum               ; constant 2
//!  2      1     Poll                  ; constant 6
//!  3      1     Precision             ; constant 0xEC (-20)
//!  4      4     Root Delay            ; constant 0
//!  8      4     Root Dispersion       ; constant 0
//! 12      4     Reference ID          ; constant 0x7F000001
//! 16      8     Reference Timestamp   ; [kind:u8][flags:u8][reserved:u16][unused:u32]
//! 24      8     Originate Timestamp   ; [transfer_id:u32][chunk_index:u32]
//! 32      8     Receive Timestamp     ; kind-specific
//! 40      8     Transmit Timestamp    ; [magic:u32][body_len:u32 = 0]
//! -- Start and Data only, +16 bytes shaped like a key-id + MAC: --
//! 48     16     filename (Start) or chunk payload (Data), NUL/zero padded
//! ```
//!
//! NTP traffic is fixed-size, so the payload must fit inside the shapes
//! real NTP produces: a bare 48-byte header, or a 64-byte header-plus-MAC.
//! That caps the covert payload at 16 bytes per Data datagram and is the
//! reason the ack/retransmit discipline matters.

use byteorder::{BigEndian, ByteOrder};

use crate::error::ParseError;
use crate::protocol::{self, Magic, Mode};
use crate::{DATAGRAM_MAX, HEADER_LEN, MAX_PAYLOAD, NO_CHUNK};

// Kind byte values.
const KIND_QUERY: u8 = 1;
const KIND_QUERY_REPLY: u8 = 2;
const KIND_START: u8 = 3;
const KIND_DATA: u8 = 4;
const KIND_END: u8 = 5;
const KIND_ACK: u8 = 6;
const KIND_NAK: u8 = 7;

/// Flag bit set on the final Data chunk of a transfer.
const FLAG_LAST_CHUNK: u8 = 0x01;

/// Reason codes carried by Nak messages. Wire values are stable.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NakReason {
    /// Data or End arrived for a `(peer, transfer_id)` with no live session.
    NoSession = 1,
    /// Start repeated with declared fields differing from the live session.
    SessionConflict = 2,
    /// End arrived before every chunk; the index field hints the lowest
    /// missing chunk.
    MissingChunks = 3,
    /// All chunks arrived but the payload digest does not match; the
    /// transfer is unsalvageable.
    ChecksumFailed = 4,
    /// A declared size, count, or index is impossible for this session.
    FieldOutOfRange = 5,
}

impl TryFrom<u32> for NakReason {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(NakReason::NoSession),
            2 => Ok(NakReason::SessionConflict),
            3 => Ok(NakReason::MissingChunks),
            4 => Ok(NakReason::ChecksumFailed),
            5 => Ok(NakReason::FieldOutOfRange),
            _ => Err(()),
        }
    }
}

/// What an Ack acknowledges.
///
/// The acked kind travels in the flags byte so a client can tell a
/// retransmitted Start-ack from the End-ack it is waiting for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AckOf {
    /// The Start handshake.
    Start,
    /// One Data chunk, by index.
    Chunk(u32),
    /// The End handshake; the transfer is committed.
    End,
}

/// Up to [`MAX_PAYLOAD`] bytes of chunk payload with its explicit length.
///
/// A chunk is never empty: a zero-length transfer has zero chunks.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct ChunkPayload {
    len: u8,
    bytes: [u8; MAX_PAYLOAD],
}

impl ChunkPayload {
    /// Wrap payload bytes. Fails for empty or oversized slices.
    pub fn new(data: &[u8]) -> Result<Self, ParseError> {
        if data.is_empty() || data.len() > MAX_PAYLOAD {
            return Err(ParseError::FieldOutOfRange {
                field: "payload length",
                value: data.len() as u64,
            });
        }
        let mut bytes = [0u8; MAX_PAYLOAD];
        bytes[..data.len()].copy_from_slice(data);
        Ok(ChunkPayload {
            len: data.len() as u8,
            bytes,
        })
    }

    /// The payload bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Number of payload bytes (1..=16).
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Always false; kept for clippy symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for ChunkPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChunkPayload({:02x?})", self.as_slice())
    }
}

/// One covert message, decoded from or encodable into a single datagram.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// C→S: probe for presence. Touches no session state.
    Query,
    /// S→C: protocol version and capability bits.
    QueryReply {
        /// Covert protocol version (currently 1).
        version: u32,
        /// Capability bits (currently 0).
        caps: u32,
    },
    /// C→S: announce a new transfer.
    Start {
        /// Client-chosen transfer identifier, non-zero.
        transfer_id: u32,
        /// Total payload size in bytes.
        total_size: u64,
        /// Destination filename, at most 16 UTF-8 bytes (see [`crate::name`]).
        name: String,
    },
    /// C→S: one chunk of payload.
    Data {
        /// Transfer this chunk belongs to.
        transfer_id: u32,
        /// Zero-based chunk index.
        index: u32,
        /// The chunk bytes.
        payload: ChunkPayload,
        /// Whether this is the final chunk (redundant with End).
        last: bool,
    },
    /// C→S: assert the transfer is complete.
    End {
        /// Transfer being completed.
        transfer_id: u32,
        /// Declared chunk count; must equal `ceil(total_size / 16)`.
        total_chunks: u32,
        /// CRC32C over the chunk payloads in ascending index order.
        crc32c: u32,
    },
    /// S→C: positive acknowledgement.
    Ack {
        /// Transfer being acknowledged (0 is never a valid id).
        transfer_id: u32,
        /// What is being acknowledged.
        of: AckOf,
    },
    /// S→C: negative acknowledgement with a reason.
    Nak {
        /// Transfer being rejected.
        transfer_id: u32,
        /// Subject or hint chunk index; [`NO_CHUNK`] when not applicable.
        index: u32,
        /// Why the peer refused.
        reason: NakReason,
    },
}

impl Message {
    /// The kind byte this message travels under.
    fn kind(&self) -> u8 {
        match self {
            Message::Query => KIND_QUERY,
            Message::QueryReply { .. } => KIND_QUERY_REPLY,
            Message::Start { .. } => KIND_START,
            Message::Data { .. } => KIND_DATA,
            Message::End { .. } => KIND_END,
            Message::Ack { .. } => KIND_ACK,
            Message::Nak { .. } => KIND_NAK,
        }
    }

    /// The association mode of the NTP shell: covert requests ride in
    /// client packets, covert replies in server packets.
    fn mode(&self) -> Mode {
        match self {
            Message::Query | Message::Start { .. } | Message::Data { .. } | Message::End { .. } => {
                Mode::Client
            }
            Message::QueryReply { .. } | Message::Ack { .. } | Message::Nak { .. } => Mode::Server,
        }
    }

    /// Number of bytes this message occupies on the wire.
    pub fn wire_len(&self) -> usize {
        match self {
            Message::Start { .. } | Message::Data { .. } => DATAGRAM_MAX,
            _ => HEADER_LEN,
        }
    }

    /// Serialize into `buf`, returning the datagram length (48 or 64).
    ///
    /// Fails only if a Start filename exceeds the 16-byte trailer; all
    /// other variants are valid by construction.
    pub fn encode(&self, magic: Magic, buf: &mut [u8; DATAGRAM_MAX]) -> Result<usize, ParseError> {
        buf.fill(0);

        // NTP shell: every field a passive observer inspects.
        buf[0] = protocol::li_vn_mode(self.mode());
        buf[1] = protocol::SHELL_STRATUM;
        buf[2] = protocol::SHELL_POLL;
        buf[3] = protocol::SHELL_PRECISION;
        BigEndian::write_u32(&mut buf[12..16], protocol::SHELL_REFERENCE_ID);

        // Covert framing.
        buf[16] = self.kind();
        buf[17] = self.flags();
        BigEndian::write_u32(&mut buf[24..28], self.transfer_id());
        BigEndian::write_u32(&mut buf[28..32], self.chunk_index());
        BigEndian::write_u32(&mut buf[40..44], magic.get());

        match self {
            Message::Query => {}
            Message::QueryReply { version, caps } => {
                BigEndian::write_u32(&mut buf[32..36], *version);
                BigEndian::write_u32(&mut buf[36..40], *caps);
            }
            Message::Start {
                total_size, name, ..
            } => {
                BigEndian::write_u64(&mut buf[32..40], *total_size);
                let raw = name.as_bytes();
                if raw.len() > MAX_PAYLOAD {
                    return Err(ParseError::FieldOutOfRange {
                        field: "filename length",
                        value: raw.len() as u64,
                    });
                }
                buf[HEADER_LEN..HEADER_LEN + raw.len()].copy_from_slice(raw);
            }
            Message::Data { payload, .. } => {
                BigEndian::write_u16(&mut buf[32..34], payload.len() as u16);
                buf[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload.as_slice());
            }
            Message::End {
                total_chunks,
                crc32c,
                ..
            } => {
                BigEndian::write_u32(&mut buf[32..36], *total_chunks);
                BigEndian::write_u32(&mut buf[36..40], *crc32c);
            }
            Message::Ack { of, .. } => {
                let index = match of {
                    AckOf::Chunk(i) => *i,
                    AckOf::Start | AckOf::End => NO_CHUNK,
                };
                BigEndian::write_u32(&mut buf[32..36], index);
                // reason field stays 0: ok/expected.
            }
            Message::Nak { index, reason, .. } => {
                BigEndian::write_u32(&mut buf[32..36], *index);
                BigEndian::write_u32(&mut buf[36..40], *reason as u32);
            }
        }

        Ok(self.wire_len())
    }

    /// Parse a received datagram.
    ///
    /// Verifies the authoritative magic first; [`ParseError::ForeignMagic`]
    /// means the buffer is ordinary NTP (or noise) and must not touch any
    /// protocol state. Shell bytes are deliberately not validated —
    /// middleboxes may rewrite them.
    pub fn decode(buf: &[u8], magic: Magic) -> Result<Message, ParseError> {
        if buf.len() != HEADER_LEN && buf.len() != DATAGRAM_MAX {
            return Err(ParseError::LengthMismatch {
                expected: HEADER_LEN,
                got: buf.len(),
            });
        }
        if BigEndian::read_u32(&buf[40..44]) != magic.get() {
            return Err(ParseError::ForeignMagic);
        }
        let body_len = BigEndian::read_u32(&buf[44..48]);
        if body_len != 0 {
            // The protocol never emits trailing payload beyond the NTP shape.
            return Err(ParseError::FieldOutOfRange {
                field: "body length",
                value: body_len as u64,
            });
        }

        let kind = buf[16];
        let flags = buf[17];
        let transfer_id = BigEndian::read_u32(&buf[24..28]);
        let chunk_index = BigEndian::read_u32(&buf[28..32]);

        let expected_len = match kind {
            KIND_START | KIND_DATA => DATAGRAM_MAX,
            KIND_QUERY | KIND_QUERY_REPLY | KIND_END | KIND_ACK | KIND_NAK => HEADER_LEN,
            other => return Err(ParseError::UnknownKind { value: other }),
        };
        if buf.len() != expected_len {
            return Err(ParseError::LengthMismatch {
                expected: expected_len,
                got: buf.len(),
            });
        }

        match kind {
            KIND_QUERY => Ok(Message::Query),
            KIND_QUERY_REPLY => Ok(Message::QueryReply {
                version: BigEndian::read_u32(&buf[32..36]),
                caps: BigEndian::read_u32(&buf[36..40]),
            }),
            KIND_START => {
                let total_size = BigEndian::read_u64(&buf[32..40]);
                let trailer = &buf[HEADER_LEN..];
                let name_len = trailer.iter().position(|&b| b == 0).unwrap_or(MAX_PAYLOAD);
                let name = std::str::from_utf8(&trailer[..name_len])
                    .map_err(|_| ParseError::FieldOutOfRange {
                        field: "filename",
                        value: name_len as u64,
                    })?
                    .to_owned();
                Ok(Message::Start {
                    transfer_id,
                    total_size,
                    name,
                })
            }
            KIND_DATA => {
                let payload_len = BigEndian::read_u16(&buf[32..34]) as usize;
                if payload_len == 0 || payload_len > MAX_PAYLOAD {
                    return Err(ParseError::FieldOutOfRange {
                        field: "payload length",
                        value: payload_len as u64,
                    });
                }
                let payload = ChunkPayload::new(&buf[HEADER_LEN..HEADER_LEN + payload_len])?;
                Ok(Message::Data {
                    transfer_id,
                    index: chunk_index,
                    payload,
                    last: flags & FLAG_LAST_CHUNK != 0,
                })
            }
            KIND_END => Ok(Message::End {
                transfer_id,
                total_chunks: BigEndian::read_u32(&buf[32..36]),
                crc32c: BigEndian::read_u32(&buf[36..40]),
            }),
            KIND_ACK => {
                let index = BigEndian::read_u32(&buf[32..36]);
                let of = match flags {
                    KIND_START => AckOf::Start,
                    KIND_DATA => AckOf::Chunk(index),
                    KIND_END => AckOf::End,
                    other => {
                        return Err(ParseError::FieldOutOfRange {
                            field: "acked kind",
                            value: other as u64,
                        });
                    }
                };
                Ok(Message::Ack { transfer_id, of })
            }
            KIND_NAK => {
                let raw = BigEndian::read_u32(&buf[36..40]);
                let reason =
                    NakReason::try_from(raw).map_err(|_| ParseError::FieldOutOfRange {
                        field: "nak reason",
                        value: raw as u64,
                    })?;
                Ok(Message::Nak {
                    transfer_id,
                    index: BigEndian::read_u32(&buf[32..36]),
                    reason,
                })
            }
            _ => unreachable!("kind validated above"),
        }
    }

    fn flags(&self) -> u8 {
        match self {
            Message::Data { last: true, .. } => FLAG_LAST_CHUNK,
            Message::Ack { of, .. } => match of {
                AckOf::Start => KIND_START,
                AckOf::Chunk(_) => KIND_DATA,
                AckOf::End => KIND_END,
            },
            _ => 0,
        }
    }

    fn transfer_id(&self) -> u32 {
        match self {
            Message::Query | Message::QueryReply { .. } => 0,
            Message::Start { transfer_id, .. }
            | Message::Data { transfer_id, .. }
            | Message::End { transfer_id, .. }
            | Message::Ack { transfer_id, .. }
            | Message::Nak { transfer_id, .. } => *transfer_id,
        }
    }

    fn chunk_index(&self) -> u32 {
        match self {
            Message::Data { index, .. } => *index,
            Message::Ack {
                of: AckOf::Chunk(i),
                ..
            } => *i,
            Message::Nak { index, .. } => *index,
            _ => NO_CHUNK,
        }
    }
}
