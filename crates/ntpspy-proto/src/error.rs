// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! Custom error types for covert datagram parsing and serialization.
//!
//! [`ParseError::ForeignMagic`] deserves special handling by callers: it
//! marks a datagram that is simply not ours (wrong or absent magic), which
//! the engines drop silently — or, on the server, hand to the plain-NTP
//! camouflage path. It is never surfaced above debug level.

use std::fmt;
use std::io;

/// Errors that can occur while parsing or serializing a covert datagram.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ParseError {
    /// The buffer length is not valid for the message kind (or not a
    /// datagram size the protocol ever emits).
    LengthMismatch {
        /// Number of bytes the kind requires.
        expected: usize,
        /// Number of bytes available.
        got: usize,
    },
    /// The bytes at the authoritative magic offset do not match our magic.
    /// The datagram is not covert traffic and must be ignored.
    ForeignMagic,
    /// The kind byte is not one of the seven protocol kinds.
    UnknownKind {
        /// The kind byte received.
        value: u8,
    },
    /// A declared field value is impossible in isolation.
    FieldOutOfRange {
        /// Name of the offending field.
        field: &'static str,
        /// The invalid value.
        value: u64,
    },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::LengthMismatch { expected, got } => {
                write!(f, "datagram length mismatch: expected {expected} bytes, got {got}")
            }
            ParseError::ForeignMagic => {
                write!(f, "magic mismatch: not a covert datagram")
            }
            ParseError::UnknownKind { value } => {
                write!(f, "unknown message kind: {value}")
            }
            ParseError::FieldOutOfRange { field, value } => {
                write!(f, "{field} out of range: {value}")
            }
        }
    }
}

impl std::error::Error for ParseError {}

impl From<ParseError> for io::Error {
    fn from(err: ParseError) -> io::Error {
        let kind = match &err {
            ParseError::LengthMismatch { .. } => io::ErrorKind::UnexpectedEof,
            ParseError::ForeignMagic => io::ErrorKind::InvalidData,
            ParseError::UnknownKind { .. } => io::ErrorKind::InvalidData,
            ParseError::FieldOutOfRange { .. } => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, err)
    }
}
