// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! Shared test helpers for server integration tests.

use std::net::SocketAddr;
use std::time::Duration;

use ntpspy_proto::{Magic, Message, DATAGRAM_MAX};
use ntpspy_server::{NtpSpyServer, NtpSpyServerBuilder, StorageProvider};
use tokio::net::UdpSocket;

pub(crate) const TEST_MAGIC: u32 = 0xDEAD_BEEF;

pub(crate) fn magic() -> Magic {
    Magic::new(TEST_MAGIC).unwrap()
}

/// Spawn a test server on an ephemeral loopback port and return its
/// bound address. The server runs in a background tokio task and shuts
/// down when the runtime is dropped.
pub(crate) async fn spawn_test_server<S: StorageProvider + Send + 'static>(
    builder: NtpSpyServerBuilder<S>,
) -> SocketAddr {
    let server = builder
        .listen("127.0.0.1:0")
        .build()
        .await
        .expect("failed to bind test server");
    let addr = server.local_addr().expect("failed to get local addr");
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    // Small yield to ensure the server task is running.
    tokio::time::sleep(Duration::from_millis(10)).await;
    addr
}

/// A hand-rolled covert peer speaking raw datagrams, so the server is
/// exercised independently of the client crate.
pub(crate) struct RawPeer {
    sock: UdpSocket,
}

impl RawPeer {
    pub(crate) async fn connect(addr: SocketAddr) -> Self {
        let sock = UdpSocket::bind("127.0.0.1:0").await.expect("bind failed");
        sock.connect(addr).await.expect("connect failed");
        RawPeer { sock }
    }

    pub(crate) async fn send(&self, msg: &Message) {
        self.send_with_magic(msg, magic()).await;
    }

    pub(crate) async fn send_with_magic(&self, msg: &Message, magic: Magic) {
        let mut buf = [0u8; DATAGRAM_MAX];
        let len = msg.encode(magic, &mut buf).expect("encode failed");
        self.sock.send(&buf[..len]).await.expect("send failed");
    }

    pub(crate) async fn send_raw(&self, bytes: &[u8]) {
        self.sock.send(bytes).await.expect("send failed");
    }

    /// Receive and decode the next covert reply, or `None` on timeout.
    pub(crate) async fn recv(&self, timeout: Duration) -> Option<Message> {
        let bytes = self.recv_raw(timeout).await?;
        Some(Message::decode(&bytes, magic()).expect("server sent undecodable reply"))
    }

    pub(crate) async fn recv_raw(&self, timeout: Duration) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; 2048];
        match tokio::time::timeout(timeout, self.sock.recv(&mut buf)).await {
            Ok(Ok(len)) => {
                buf.truncate(len);
                Some(buf)
            }
            _ => None,
        }
    }

    /// Send a message and await the reply, failing the test on silence.
    pub(crate) async fn exchange(&self, msg: &Message) -> Message {
        self.send(msg).await;
        self.recv(Duration::from_secs(2))
            .await
            .unwrap_or_else(|| panic!("no reply to {msg:?}"))
    }
}

/// Convenience: a server builder around a fresh MemStore.
pub(crate) fn mem_server() -> (ntpspy_server::MemStore, NtpSpyServerBuilder<ntpspy_server::MemStore>) {
    let store = ntpspy_server::MemStore::new(false);
    let builder = NtpSpyServer::builder(store.clone()).magic(magic());
    (store, builder)
}
