// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! NTP shell constants and field types used to camouflage covert datagrams.
//!
//! Every emitted datagram must look like a plausible NTPv4 packet to a
//! passive observer, so the fields that are not repurposed carry fixed,
//! unremarkable values: a stratum-2 secondary server, a 64-second poll
//! interval, microsecond-class precision, and an IPv4-looking reference ID.
//!
//! Documentation of the NTP fields is derived from IETF RFC 5905.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between the NTP prime epoch (1900-01-01) and the Unix epoch.
pub const UNIX_TO_NTP: u64 = 2_208_988_800;

/// Stratum emitted in the shell of every covert datagram (secondary server).
pub const SHELL_STRATUM: u8 = 2;

/// Poll exponent emitted in the shell (2^6 = 64 s).
pub const SHELL_POLL: u8 = 6;

/// Precision exponent emitted in the shell (-20 ≈ 1 μs), as its raw byte.
pub const SHELL_PRECISION: u8 = 0xEC;

/// Reference ID emitted in the shell; reads as the IPv4 address 127.0.0.1.
pub const SHELL_REFERENCE_ID: u32 = 0x7F00_0001;

/// A 3-bit integer representing the association mode.
///
/// Covert client→server kinds travel in `Client` mode packets and
/// server→client kinds in `Server` mode packets, matching the only two
/// modes seen in an ordinary NTP client/server exchange.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum Mode {
    /// Reserved mode (value 0).
    Reserved = 0,
    /// Symmetric active mode (value 1).
    SymmetricActive = 1,
    /// Symmetric passive mode (value 2).
    SymmetricPassive = 2,
    /// Client mode (value 3).
    Client = 3,
    /// Server mode (value 4).
    Server = 4,
    /// Broadcast mode (value 5).
    Broadcast = 5,
    /// NTP control message mode (value 6).
    NtpControlMessage = 6,
    /// Reserved for private use (value 7).
    ReservedForPrivateUse = 7,
}

impl TryFrom<u8> for Mode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Mode::Reserved),
            1 => Ok(Mode::SymmetricActive),
            2 => Ok(Mode::SymmetricPassive),
            3 => Ok(Mode::Client),
            4 => Ok(Mode::Server),
            5 => Ok(Mode::Broadcast),
            6 => Ok(Mode::NtpControlMessage),
            7 => Ok(Mode::ReservedForPrivateUse),
            _ => Err(()),
        }
    }
}

/// Pack leap indicator 0, version 4, and the given mode into the first
/// header byte (0x23 for client packets, 0x24 for server packets).
pub fn li_vn_mode(mode: Mode) -> u8 {
    (4u8 << 3) | mode as u8
}

/// Extract the mode bits from the first header byte.
pub fn mode_of(byte0: u8) -> Option<Mode> {
    Mode::try_from(byte0 & 0b111).ok()
}

/// **NTP Timestamp Format** — 32-bit seconds since the 1900 prime epoch and
/// 32-bit fractional seconds, used where the camouflage needs genuine
/// timestamps (the plain-NTP reply path and the NTP probe).
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TimestampFormat {
    /// Seconds since 1900-01-01 00:00:00 UTC.
    pub seconds: u32,
    /// Fractional seconds (~232 ps resolution).
    pub fraction: u32,
}

impl TimestampFormat {
    /// The current system time as an NTP-era timestamp.
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let seconds = (since_epoch.as_secs() + UNIX_TO_NTP) as u32;
        // Scale nanoseconds into the 32-bit binary fraction.
        let fraction = ((since_epoch.subsec_nanos() as u64) << 32) / 1_000_000_000;
        TimestampFormat {
            seconds,
            fraction: fraction as u32,
        }
    }
}

/// The 32-bit non-zero discriminator shared out-of-band by client and
/// server. A datagram is covert traffic iff the high 32 bits of its
/// transmit-timestamp field equal the magic.
///
/// Zero is rejected so the codec keeps a cheap sentinel for "unset".
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Magic(u32);

impl Magic {
    /// Construct a magic value. Returns `None` for zero.
    pub fn new(value: u32) -> Option<Self> {
        if value == 0 { None } else { Some(Magic(value)) }
    }

    /// The raw 32-bit value.
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Magic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
