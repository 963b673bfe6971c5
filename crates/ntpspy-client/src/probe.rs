// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! Genuine NTP probe.
//!
//! Sends an ordinary NTPv4 client request — real transmit timestamp, no
//! magic anywhere — and computes clock offset and round-trip delay from
//! the four timestamps per RFC 5905 Section 8. Against a covert server
//! this exercises the camouflage path: the reply must be indistinguishable
//! from a working time server's.

use byteorder::{BigEndian, ByteOrder};
use std::io;
use std::time::Duration;
use tokio::net::UdpSocket;

use ntpspy_proto::protocol::{li_vn_mode, mode_of, Mode, TimestampFormat};
use ntpspy_proto::HEADER_LEN;

/// The outcome of one genuine NTP exchange.
#[derive(Clone, Copy, Debug)]
pub struct ProbeResult {
    /// Estimated clock offset in seconds (positive = local clock behind).
    pub offset_seconds: f64,
    /// Round-trip delay in seconds.
    pub delay_seconds: f64,
    /// Stratum the server claims.
    pub stratum: u8,
}

fn timestamp_to_f64(ts: TimestampFormat) -> f64 {
    ts.seconds as f64 + ts.fraction as f64 / (1u64 << 32) as f64
}

fn read_timestamp(buf: &[u8], offset: usize) -> TimestampFormat {
    TimestampFormat {
        seconds: BigEndian::read_u32(&buf[offset..offset + 4]),
        fraction: BigEndian::read_u32(&buf[offset + 4..offset + 8]),
    }
}

/// Send one genuine NTPv4 request to `addr` and await the reply.
pub async fn ntp_probe(addr: &str, timeout: Duration) -> io::Result<ProbeResult> {
    let peer = tokio::net::lookup_host(addr).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "address resolved to no socket addresses",
        )
    })?;
    let bind_addr = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let sock = UdpSocket::bind(bind_addr).await?;
    sock.connect(peer).await?;

    let mut request = [0u8; HEADER_LEN];
    request[0] = li_vn_mode(Mode::Client);
    let t1 = TimestampFormat::now();
    BigEndian::write_u32(&mut request[40..44], t1.seconds);
    BigEndian::write_u32(&mut request[44..48], t1.fraction);
    sock.send(&request).await?;

    let mut reply = [0u8; 1024];
    let n = tokio::time::timeout(timeout, sock.recv(&mut reply))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no NTP reply"))??;
    let t4 = TimestampFormat::now();

    if n < HEADER_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "NTP reply too short",
        ));
    }
    if mode_of(reply[0]) != Some(Mode::Server) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unexpected reply mode (expected Server)",
        ));
    }
    let origin = read_timestamp(&reply, 24);
    if origin != t1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "origin timestamp mismatch: reply does not match our request",
        ));
    }
    let t2 = read_timestamp(&reply, 32);
    let t3 = read_timestamp(&reply, 40);
    if t3.seconds == 0 && t3.fraction == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "server transmit timestamp is zero",
        ));
    }

    let (t1, t2, t3, t4) = (
        timestamp_to_f64(t1),
        timestamp_to_f64(t2),
        timestamp_to_f64(t3),
        timestamp_to_f64(t4),
    );
    Ok(ProbeResult {
        offset_seconds: ((t2 - t1) + (t3 - t4)) / 2.0,
        delay_seconds: (t4 - t1) - (t3 - t2),
        stratum: reply[1],
    })
}
