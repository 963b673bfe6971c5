// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! Per-transfer reassembly state.
//!
//! A session is created by the first valid Start from a peer and lives
//! until commit, checksum failure, or idle timeout. Duplicate Data is
//! acked without re-writing; the received bitmap only grows. After a
//! successful commit the session lingers in `Completed` so retransmitted
//! End (and stray Data) keep getting acked until the garbage collector
//! retires it — a lost End-ack must not strand the client.

use log::{debug, info, warn};
use std::io;
use std::time::Instant;

use ntpspy_proto::{chunk_count, AckOf, ChunkBitmap, ChunkPayload, Message, NakReason, MAX_PAYLOAD, NO_CHUNK};

use crate::storage::Sink;

/// What the engine must do with the session after a message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Disposition {
    /// Session stays live.
    Keep,
    /// Session is finished (checksum failure or local I/O); remove it.
    Retire,
}

enum Phase {
    Receiving,
    Completed,
}

pub(crate) struct Session {
    transfer_id: u32,
    name: String,
    total_size: u64,
    expected_chunks: u32,
    bitmap: ChunkBitmap,
    sink: Option<Box<dyn Sink>>,
    /// Digest accumulated while chunks arrive strictly in order.
    inorder_crc: u32,
    /// Next index that would extend the in-order prefix.
    frontier: u32,
    /// False once any chunk arrives out of order; forces a one-pass
    /// re-digest of the sink at End.
    in_order: bool,
    phase: Phase,
    pub(crate) last_activity: Instant,
}

impl Session {
    /// Create a session for a Start with already-sanitized name.
    ///
    /// The caller has verified `total_size` is chunk-indexable.
    pub(crate) fn new(transfer_id: u32, name: String, total_size: u64, sink: Box<dyn Sink>) -> Self {
        Session {
            transfer_id,
            name,
            total_size,
            expected_chunks: chunk_count(total_size) as u32,
            bitmap: ChunkBitmap::new(chunk_count(total_size) as u32),
            sink: Some(sink),
            inorder_crc: 0,
            frontier: 0,
            in_order: true,
            phase: Phase::Receiving,
            last_activity: Instant::now(),
        }
    }

    /// Whether a repeated Start declares the same transfer.
    pub(crate) fn matches_start(&self, total_size: u64, name: &str) -> bool {
        self.total_size == total_size && self.name == name
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Abort the sink, if still open. Used by idle GC and fatal paths.
    pub(crate) fn discard(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.abort();
        }
    }

    /// Handle one Data chunk. Returns the reply, or `Err` on a local I/O
    /// failure, which retires the session with no reply.
    pub(crate) fn on_data(
        &mut self,
        index: u32,
        payload: &ChunkPayload,
    ) -> io::Result<(Message, Disposition)> {
        if matches!(self.phase, Phase::Completed) {
            // The client never saw our End-ack and is replaying its tail.
            return Ok((self.ack(AckOf::Chunk(index)), Disposition::Keep));
        }
        if !self.bitmap.in_range(index) {
            return Ok((
                self.nak(index, NakReason::FieldOutOfRange),
                Disposition::Keep,
            ));
        }
        let offset = index as u64 * MAX_PAYLOAD as u64;
        let expected_len = (self.total_size - offset).min(MAX_PAYLOAD as u64) as usize;
        if payload.len() != expected_len {
            return Ok((
                self.nak(index, NakReason::FieldOutOfRange),
                Disposition::Keep,
            ));
        }
        if !self.bitmap.get(index) {
            let Some(sink) = self.sink.as_mut() else {
                return Err(io::Error::other("sink already closed"));
            };
            sink.write_at(offset, payload.as_slice())?;
            self.bitmap.set(index);
            if self.in_order && index == self.frontier {
                self.inorder_crc = crc32c::crc32c_append(self.inorder_crc, payload.as_slice());
                self.frontier += 1;
            } else if index != self.frontier {
                self.in_order = false;
            }
        }
        Ok((self.ack(AckOf::Chunk(index)), Disposition::Keep))
    }

    /// Handle End: the commit procedure.
    pub(crate) fn on_end(
        &mut self,
        total_chunks: u32,
        declared_crc: u32,
    ) -> io::Result<(Message, Disposition)> {
        if matches!(self.phase, Phase::Completed) {
            return Ok((self.ack(AckOf::End), Disposition::Keep));
        }
        if total_chunks != self.expected_chunks {
            warn!(
                "transfer {}: End declares {total_chunks} chunks, expected {}",
                self.transfer_id, self.expected_chunks
            );
            return Ok((
                self.nak(NO_CHUNK, NakReason::FieldOutOfRange),
                Disposition::Keep,
            ));
        }
        if !self.bitmap.is_complete() {
            let hint = self.bitmap.first_unset().unwrap_or(0);
            debug!(
                "transfer {}: End with {}/{} chunks, hinting {hint}",
                self.transfer_id,
                self.bitmap.count_set(),
                self.expected_chunks
            );
            return Ok((self.nak(hint, NakReason::MissingChunks), Disposition::Keep));
        }

        let Some(mut sink) = self.sink.take() else {
            return Err(io::Error::other("sink already closed"));
        };
        let actual_crc = if self.in_order && self.frontier == self.expected_chunks {
            self.inorder_crc
        } else {
            sink.digest()?
        };
        if actual_crc != declared_crc {
            warn!(
                "transfer {}: checksum mismatch (declared {declared_crc:#010x}, got {actual_crc:#010x})",
                self.transfer_id
            );
            sink.abort();
            return Ok((
                self.nak(NO_CHUNK, NakReason::ChecksumFailed),
                Disposition::Retire,
            ));
        }
        let final_name = sink.commit(&self.name)?;
        info!(
            "transfer {}: committed {final_name:?} ({} bytes)",
            self.transfer_id, self.total_size
        );
        self.phase = Phase::Completed;
        Ok((self.ack(AckOf::End), Disposition::Keep))
    }

    pub(crate) fn ack(&self, of: AckOf) -> Message {
        Message::Ack {
            transfer_id: self.transfer_id,
            of,
        }
    }

    fn nak(&self, index: u32, reason: NakReason) -> Message {
        Message::Nak {
            transfer_id: self.transfer_id,
            index,
            reason,
        }
    }
}
