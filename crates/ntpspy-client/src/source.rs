// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! Chunk sources for the transfer engine.
//!
//! A source knows its total size and CRC32C up front (both travel in the
//! handshake) and serves 16-byte chunks by index, because the retransmit
//! loop revisits indexes in whatever order the network loses them. Files
//! are digested in one streaming pass and then seek-read per chunk so
//! client memory stays bounded at the window; piped stdin has no length
//! until EOF, so it is spooled into memory first.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use ntpspy_proto::{ChunkPayload, MAX_PAYLOAD};

/// A byte stream the engine can chunk and retransmit from.
pub trait ChunkSource {
    /// Total payload size in bytes.
    fn total_size(&self) -> u64;

    /// CRC32C over the whole payload.
    fn crc32c(&self) -> u32;

    /// Read the chunk at `index` (zero-based). The final chunk may be
    /// shorter than 16 bytes; every other chunk is exactly 16.
    fn read_chunk(&mut self, index: u32) -> io::Result<ChunkPayload>;
}

fn chunk_bounds(total_size: u64, index: u32) -> io::Result<(u64, usize)> {
    let offset = index as u64 * MAX_PAYLOAD as u64;
    if offset >= total_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("chunk {index} beyond end of {total_size}-byte source"),
        ));
    }
    let len = (total_size - offset).min(MAX_PAYLOAD as u64) as usize;
    Ok((offset, len))
}

/// A file on disk, digested once and then seek-read per chunk.
pub struct FileSource {
    file: File,
    size: u64,
    crc: u32,
}

impl FileSource {
    /// Open `path`, stat its size, and compute the payload digest in one
    /// streaming pass.
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let size = file.metadata()?.len();
        let mut crc = 0u32;
        let mut buf = [0u8; 8192];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            crc = crc32c::crc32c_append(crc, &buf[..n]);
        }
        file.seek(SeekFrom::Start(0))?;
        Ok(FileSource { file, size, crc })
    }
}

impl ChunkSource for FileSource {
    fn total_size(&self) -> u64 {
        self.size
    }

    fn crc32c(&self) -> u32 {
        self.crc
    }

    fn read_chunk(&mut self, index: u32) -> io::Result<ChunkPayload> {
        let (offset, len) = chunk_bounds(self.size, index)?;
        let mut chunk = [0u8; MAX_PAYLOAD];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut chunk[..len])?;
        ChunkPayload::new(&chunk[..len]).map_err(Into::into)
    }
}

/// An in-memory byte buffer, used for piped stdin.
pub struct BufSource {
    data: Vec<u8>,
    crc: u32,
}

impl BufSource {
    /// Wrap an already-read byte buffer.
    pub fn new(data: Vec<u8>) -> Self {
        let crc = crc32c::crc32c(&data);
        BufSource { data, crc }
    }
}

impl ChunkSource for BufSource {
    fn total_size(&self) -> u64 {
        self.data.len() as u64
    }

    fn crc32c(&self) -> u32 {
        self.crc
    }

    fn read_chunk(&mut self, index: u32) -> io::Result<ChunkPayload> {
        let (offset, len) = chunk_bounds(self.data.len() as u64, index)?;
        let start = offset as usize;
        ChunkPayload::new(&self.data[start..start + len]).map_err(Into::into)
    }
}

/// The filename used for piped input: `stdin-<utc-epoch-seconds>`.
///
/// Sixteen bytes for any plausible clock, so it always fits the Start
/// trailer untruncated.
pub fn stdin_name() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("stdin-{secs}")
}
