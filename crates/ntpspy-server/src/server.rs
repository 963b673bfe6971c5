// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! The covert server engine: socket loop, dispatch, and NTP camouflage.

use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

use ntpspy_proto::protocol::{self, Mode, TimestampFormat};
use ntpspy_proto::{
    chunk_count, name, AckOf, Magic, Message, NakReason, ParseError, DATAGRAM_MAX, HEADER_LEN,
    NO_CHUNK, PROTOCOL_VERSION,
};

use crate::session::{Disposition, Session};
use crate::storage::StorageProvider;

/// Sessions idle longer than this are garbage-collected.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on the socket wait so the collector runs on time.
const GC_TICK: Duration = Duration::from_secs(1);

/// Builder for configuring and creating an [`NtpSpyServer`].
pub struct NtpSpyServerBuilder<S> {
    listen_addr: String,
    magic: Option<Magic>,
    idle_timeout: Duration,
    storage: S,
}

impl<S: StorageProvider> NtpSpyServerBuilder<S> {
    fn new(storage: S) -> Self {
        NtpSpyServerBuilder {
            listen_addr: "0.0.0.0:123".to_owned(),
            magic: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            storage,
        }
    }

    /// Set the listen address (default `"0.0.0.0:123"`).
    pub fn listen(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    /// Set the shared magic discriminator. Required.
    pub fn magic(mut self, magic: Magic) -> Self {
        self.magic = Some(magic);
        self
    }

    /// Set the per-session idle timeout (default 60 s).
    pub fn idle_timeout(mut self, d: Duration) -> Self {
        self.idle_timeout = d;
        self
    }

    /// Sweep stale temp files, bind the socket, and build the server.
    pub async fn build(mut self) -> io::Result<NtpSpyServer<S>> {
        let magic = self.magic.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "magic is required")
        })?;
        let swept = self.storage.sweep()?;
        if swept > 0 {
            info!("swept {swept} stale temp file(s) from a previous run");
        }
        let sock = UdpSocket::bind(&self.listen_addr).await?;
        debug!("covert server listening on {}", self.listen_addr);
        Ok(NtpSpyServer {
            sock,
            magic,
            idle_timeout: self.idle_timeout,
            storage: self.storage,
            sessions: HashMap::new(),
            last_gc: Instant::now(),
        })
    }
}

/// A covert file-transfer server that doubles as a plausible NTP responder.
///
/// Created via [`NtpSpyServer::builder()`]. Call [`run()`](NtpSpyServer::run)
/// to start serving.
pub struct NtpSpyServer<S> {
    sock: UdpSocket,
    magic: Magic,
    idle_timeout: Duration,
    storage: S,
    sessions: HashMap<(SocketAddr, u32), Session>,
    last_gc: Instant,
}

impl<S: StorageProvider> NtpSpyServer<S> {
    /// Create a builder around a storage provider.
    pub fn builder(storage: S) -> NtpSpyServerBuilder<S> {
        NtpSpyServerBuilder::new(storage)
    }

    /// Get the local address the server is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    /// Run the server, processing datagrams indefinitely.
    ///
    /// This future runs until an I/O error occurs on the socket.
    pub async fn run(mut self) -> io::Result<()> {
        let mut recv_buf = [0u8; 2048];
        loop {
            match tokio::time::timeout(GC_TICK, self.sock.recv_from(&mut recv_buf)).await {
                Err(_) => {}
                Ok(Ok((recv_len, peer))) => {
                    self.handle_datagram(&recv_buf[..recv_len], peer).await?;
                }
                Ok(Err(e)) => return Err(e),
            }
            if self.last_gc.elapsed() >= GC_TICK {
                self.collect_idle();
            }
        }
    }

    async fn handle_datagram(&mut self, data: &[u8], peer: SocketAddr) -> io::Result<()> {
        let reply = match Message::decode(data, self.magic) {
            Ok(msg) => self.dispatch(msg, peer),
            Err(ParseError::ForeignMagic) => {
                // Ordinary NTP, or covert traffic under another magic.
                // Either way, stay in character.
                return self.answer_plain_ntp(data, peer).await;
            }
            Err(e) => {
                debug!("dropping {}-byte datagram from {peer}: {e}", data.len());
                None
            }
        };
        if let Some(msg) = reply {
            self.send_msg(&msg, peer).await?;
        }
        Ok(())
    }

    /// Dispatch a covert message. Returns the reply, if any.
    fn dispatch(&mut self, msg: Message, peer: SocketAddr) -> Option<Message> {
        match msg {
            // Answered unconditionally; no session state touched or needed.
            Message::Query => {
                debug!("query from {peer}");
                Some(Message::QueryReply {
                    version: PROTOCOL_VERSION,
                    caps: 0,
                })
            }
            Message::Start {
                transfer_id,
                total_size,
                name,
            } => self.on_start(peer, transfer_id, total_size, name),
            Message::Data {
                transfer_id,
                index,
                payload,
                ..
            } => self.with_session(peer, transfer_id, |session| {
                session.on_data(index, &payload)
            }),
            Message::End {
                transfer_id,
                total_chunks,
                crc32c,
            } => self.with_session(peer, transfer_id, |session| {
                session.on_end(total_chunks, crc32c)
            }),
            // Server-to-client kinds arriving here are bogus.
            Message::QueryReply { .. } | Message::Ack { .. } | Message::Nak { .. } => {
                debug!("dropping wrong-direction message from {peer}");
                None
            }
        }
    }

    fn on_start(
        &mut self,
        peer: SocketAddr,
        transfer_id: u32,
        total_size: u64,
        raw_name: String,
    ) -> Option<Message> {
        let sanitized = name::sanitize(&raw_name).unwrap_or_else(|| format!("transfer-{transfer_id}"));
        if let Some(session) = self.sessions.get_mut(&(peer, transfer_id)) {
            session.touch();
            return if session.matches_start(total_size, &sanitized) {
                // Start retransmit: re-ack, do not reset state.
                Some(session.ack(AckOf::Start))
            } else {
                warn!("conflicting Start for transfer {transfer_id} from {peer}");
                Some(Message::Nak {
                    transfer_id,
                    index: NO_CHUNK,
                    reason: NakReason::SessionConflict,
                })
            };
        }
        if chunk_count(total_size) > u32::MAX as u64 {
            return Some(Message::Nak {
                transfer_id,
                index: NO_CHUNK,
                reason: NakReason::FieldOutOfRange,
            });
        }
        let sink = match self.storage.begin(transfer_id, total_size) {
            Ok(sink) => sink,
            Err(e) => {
                warn!("cannot open storage for transfer {transfer_id}: {e}");
                return None;
            }
        };
        info!(
            "transfer {transfer_id} from {peer}: {sanitized:?}, {total_size} bytes, {} chunks",
            chunk_count(total_size)
        );
        let session = Session::new(transfer_id, sanitized, total_size, sink);
        self.sessions.insert((peer, transfer_id), session);
        Some(Message::Ack {
            transfer_id,
            of: AckOf::Start,
        })
    }

    /// Run `op` against the session for `(peer, transfer_id)`. A missing
    /// session is Nak(NoSession) — never auto-created. A local I/O failure
    /// retires the session with no reply.
    fn with_session(
        &mut self,
        peer: SocketAddr,
        transfer_id: u32,
        op: impl FnOnce(&mut Session) -> io::Result<(Message, Disposition)>,
    ) -> Option<Message> {
        let Some(session) = self.sessions.get_mut(&(peer, transfer_id)) else {
            return Some(Message::Nak {
                transfer_id,
                index: NO_CHUNK,
                reason: NakReason::NoSession,
            });
        };
        session.touch();
        match op(session) {
            Ok((reply, Disposition::Keep)) => Some(reply),
            Ok((reply, Disposition::Retire)) => {
                self.sessions.remove(&(peer, transfer_id));
                Some(reply)
            }
            Err(e) => {
                warn!("transfer {transfer_id} from {peer} failed locally: {e}");
                if let Some(mut session) = self.sessions.remove(&(peer, transfer_id)) {
                    session.discard();
                }
                None
            }
        }
    }

    /// Drop sessions idle past the timeout, deleting their temp files.
    fn collect_idle(&mut self) {
        self.last_gc = Instant::now();
        let idle_timeout = self.idle_timeout;
        let expired: Vec<(SocketAddr, u32)> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.last_activity.elapsed() >= idle_timeout)
            .map(|(&key, _)| key)
            .collect();
        for key in expired {
            if let Some(mut session) = self.sessions.remove(&key) {
                debug!("idle timeout for transfer {} from {}", key.1, key.0);
                session.discard();
            }
        }
    }

    async fn send_msg(&self, msg: &Message, peer: SocketAddr) -> io::Result<()> {
        let mut buf = [0u8; DATAGRAM_MAX];
        let len = msg.encode(self.magic, &mut buf).map_err(io::Error::from)?;
        self.sock.send_to(&buf[..len], peer).await?;
        Ok(())
    }

    /// Answer an ordinary NTPv4 client request the way a real stratum-2
    /// server would, so probing the covert port shows a working time
    /// server. Anything that is not a plausible client request is dropped.
    async fn answer_plain_ntp(&self, request: &[u8], peer: SocketAddr) -> io::Result<()> {
        if request.len() < HEADER_LEN || protocol::mode_of(request[0]) != Some(Mode::Client) {
            debug!("dropping non-NTP datagram from {peer}");
            return Ok(());
        }
        let version = (request[0] >> 3) & 0b111;
        if !(1..=4).contains(&version) {
            debug!("dropping NTP v{version} request from {peer}");
            return Ok(());
        }

        let now = TimestampFormat::now();
        // Claim a reference update a few seconds ago, like a server that
        // polls its upstream on a short interval.
        let reftime_age = 5 + rand::random::<u32>() % 6;

        let mut reply = [0u8; HEADER_LEN];
        reply[0] = (version << 3) | Mode::Server as u8;
        reply[1] = protocol::SHELL_STRATUM;
        reply[2] = request[2];
        reply[3] = protocol::SHELL_PRECISION;
        BigEndian::write_u32(&mut reply[12..16], protocol::SHELL_REFERENCE_ID);
        BigEndian::write_u32(&mut reply[16..20], now.seconds - reftime_age);
        BigEndian::write_u32(&mut reply[20..24], now.fraction);
        // Origin := client transmit, for the client's anti-replay check.
        reply[24..32].copy_from_slice(&request[40..48]);
        BigEndian::write_u32(&mut reply[32..36], now.seconds);
        BigEndian::write_u32(&mut reply[36..40], now.fraction);
        BigEndian::write_u32(&mut reply[40..44], now.seconds);
        BigEndian::write_u32(&mut reply[44..48], now.fraction);

        debug!("answering plain NTP request from {peer}");
        self.sock.send_to(&reply, peer).await?;
        Ok(())
    }
}
