// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! Custom error types for the covert transfer client.
//!
//! Errors carry enough structure for the binary to map them onto its exit
//! codes: 2 for network/timeout failures, 3 for checksum mismatches,
//! 4 for local I/O.

use std::fmt;
use std::io;

use ntpspy_proto::NakReason;

/// Errors that can occur while querying a server or transferring a file.
#[derive(Debug)]
pub enum ClientError {
    /// No acknowledgement to Start (or no QueryReply) after every retry.
    /// The peer is unreachable, not covert, or keyed to a different magic.
    /// This failure aborts a batch.
    NoContact,
    /// A chunk or the End handshake exhausted its retries mid-transfer.
    Timeout {
        /// What timed out ("chunk 17", "end handshake", ...).
        what: String,
    },
    /// The server refused the transfer with a Nak.
    Rejected {
        /// The reason code from the wire.
        reason: NakReason,
    },
    /// The server reported a payload digest mismatch; the file cannot be
    /// delivered as-is.
    ChecksumFailed,
    /// The source is too large to index with 32-bit chunk numbers.
    TooLarge {
        /// Size of the offending source in bytes.
        size: u64,
    },
    /// Reading the source or using the socket failed locally.
    LocalIo(io::Error),
}

impl ClientError {
    /// The process exit code this failure maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::NoContact | ClientError::Timeout { .. } => 2,
            ClientError::ChecksumFailed => 3,
            ClientError::Rejected {
                reason: NakReason::ChecksumFailed,
            } => 3,
            ClientError::Rejected { .. } => 2,
            ClientError::TooLarge { .. } => 4,
            ClientError::LocalIo(_) => 4,
        }
    }

    /// Whether this failure means the peer is unreachable and the rest of
    /// the batch should not be attempted.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, ClientError::NoContact)
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::NoContact => {
                write!(f, "no response from server: unreachable, not covert, or wrong magic")
            }
            ClientError::Timeout { what } => write!(f, "timed out waiting for {what}"),
            ClientError::Rejected { reason } => write!(f, "server refused transfer: {reason:?}"),
            ClientError::ChecksumFailed => write!(f, "server reports checksum mismatch"),
            ClientError::TooLarge { size } => {
                write!(f, "source of {size} bytes exceeds the protocol's chunk index space")
            }
            ClientError::LocalIo(e) => write!(f, "local I/O error: {e}"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::LocalIo(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        ClientError::LocalIo(err)
    }
}
