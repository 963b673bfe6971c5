// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! Covert NTP file-transfer server.
//!
//! Listens on a UDP socket, reassembles chunked transfers into files under
//! a storage root, and — to preserve its cover — answers ordinary NTP
//! client requests the way a genuine stratum-2 time server would.
//!
//! # Architecture
//!
//! The server uses a builder pattern for configuration and processes
//! incoming datagrams on a single async task. Per-transfer state lives in
//! a session map keyed by `(peer address, transfer id)`; idle sessions are
//! garbage-collected, and stale temp files from a previous run are swept
//! on startup (which is why two servers must not share a storage root).
//!
//! # Examples
//!
//! ```no_run
//! # async fn example() -> std::io::Result<()> {
//! use ntpspy_proto::Magic;
//! use ntpspy_server::storage::FileStore;
//! use ntpspy_server::NtpSpyServer;
//!
//! let store = FileStore::new("/var/spool/drops".into(), false)?;
//! let server = NtpSpyServer::builder(store)
//!     .listen("0.0.0.0:123")
//!     .magic(Magic::new(0xDEAD_BEEF).unwrap())
//!     .build()
//!     .await?;
//!
//! server.run().await
//! # }
//! ```

#![warn(missing_docs)]

/// Storage providers: the filesystem store and an in-memory test double.
pub mod storage;

mod server;
mod session;

pub use self::server::{NtpSpyServer, NtpSpyServerBuilder};
pub use self::storage::{FileStore, MemStore, Sink, StorageProvider};
