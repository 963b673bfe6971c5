// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! Client engine tests against a scripted UDP peer, including loss
//! recovery. The scripted peer reassembles like a real server but can be
//! told to stay silent about chosen chunks the first time it sees them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use ntpspy_client::{ClientError, NtpSpyClient};
use ntpspy_proto::{chunk_count, AckOf, Magic, Message, DATAGRAM_MAX};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

const TEST_MAGIC: u32 = 0xCAFE_F00D;

fn magic() -> Magic {
    Magic::new(TEST_MAGIC).unwrap()
}

#[derive(Default)]
struct Received {
    name: String,
    total_size: u64,
    chunks: HashMap<u32, Vec<u8>>,
    end_crc: Option<u32>,
}

impl Received {
    fn assemble(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.total_size as usize];
        for (&index, data) in &self.chunks {
            let start = index as usize * 16;
            out[start..start + data.len()].copy_from_slice(data);
        }
        out
    }
}

/// Spawn a scripted covert server on loopback. Acks everything, except
/// that the first arrival of each chunk index in `drop_once` is ignored —
/// simulating a lost datagram the client must retransmit.
async fn spawn_scripted_server(
    drop_once: HashSet<u32>,
) -> (std::net::SocketAddr, Arc<Mutex<Received>>) {
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = sock.local_addr().unwrap();
    let state = Arc::new(Mutex::new(Received::default()));
    let shared = state.clone();

    tokio::spawn(async move {
        let mut dropped: HashSet<u32> = HashSet::new();
        let mut buf = [0u8; 2048];
        loop {
            let Ok((n, peer)) = sock.recv_from(&mut buf).await else {
                return;
            };
            let Ok(msg) = Message::decode(&buf[..n], magic()) else {
                continue;
            };
            let reply = {
                let mut state = shared.lock().await;
                match msg {
                    Message::Query => Some(Message::QueryReply { version: 1, caps: 0 }),
                    Message::Start {
                        transfer_id,
                        total_size,
                        name,
                    } => {
                        state.name = name;
                        state.total_size = total_size;
                        Some(Message::Ack {
                            transfer_id,
                            of: AckOf::Start,
                        })
                    }
                    Message::Data {
                        transfer_id,
                        index,
                        payload,
                        ..
                    } => {
                        if drop_once.contains(&index) && dropped.insert(index) {
                            None
                        } else {
                            state.chunks.insert(index, payload.as_slice().to_vec());
                            Some(Message::Ack {
                                transfer_id,
                                of: AckOf::Chunk(index),
                            })
                        }
                    }
                    Message::End {
                        transfer_id,
                        crc32c,
                        ..
                    } => {
                        state.end_crc = Some(crc32c);
                        Some(Message::Ack {
                            transfer_id,
                            of: AckOf::End,
                        })
                    }
                    _ => None,
                }
            };
            if let Some(reply) = reply {
                let mut out = [0u8; DATAGRAM_MAX];
                let len = reply.encode(magic(), &mut out).unwrap();
                let _ = sock.send_to(&out[..len], peer).await;
            }
        }
    });

    (addr, state)
}

async fn client_for(addr: std::net::SocketAddr) -> NtpSpyClient {
    NtpSpyClient::builder()
        .server(addr.to_string())
        .magic(magic())
        .rtt_base(Duration::from_millis(100))
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_query_roundtrip() {
    let (addr, _state) = spawn_scripted_server(HashSet::new()).await;
    let mut client = client_for(addr).await;
    let info = client.query().await.unwrap();
    assert_eq!(info.version, 1);
    assert_eq!(info.caps, 0);
}

#[tokio::test]
async fn test_transfer_no_loss() {
    let (addr, state) = spawn_scripted_server(HashSet::new()).await;
    let mut client = client_for(addr).await;

    let data: Vec<u8> = (0u8..=255).cycle().take(1000).collect();
    client
        .transfer(
            &mut ntpspy_client::BufSource::new(data.clone()),
            "big.bin".into(),
        )
        .await
        .unwrap();

    let state = state.lock().await;
    assert_eq!(state.name, "big.bin");
    assert_eq!(state.chunks.len() as u64, chunk_count(1000));
    assert_eq!(state.assemble(), data);
    assert_eq!(state.end_crc, Some(crc32c::crc32c(&data)));
}

#[tokio::test]
async fn test_lost_chunk_is_retransmitted() {
    // A 33-byte transfer with chunk 1 lost on first send: the client must
    // retransmit it after its retry interval and still complete.
    let (addr, state) = spawn_scripted_server(HashSet::from([1])).await;
    let mut client = client_for(addr).await;

    let data: Vec<u8> = (1u8..=33).collect();
    client
        .transfer(
            &mut ntpspy_client::BufSource::new(data.clone()),
            "lossy.bin".into(),
        )
        .await
        .unwrap();

    let state = state.lock().await;
    assert_eq!(state.assemble(), data);
}

#[tokio::test]
async fn test_heavy_loss_still_completes() {
    let (addr, state) = spawn_scripted_server(HashSet::from([0, 3, 4, 5, 9])).await;
    let mut client = client_for(addr).await;

    let data: Vec<u8> = (0u8..=255).cycle().take(10 * 16).collect();
    client
        .transfer(
            &mut ntpspy_client::BufSource::new(data.clone()),
            "swiss.bin".into(),
        )
        .await
        .unwrap();

    assert_eq!(state.lock().await.assemble(), data);
}

#[tokio::test]
async fn test_empty_transfer_sends_no_data() {
    let (addr, state) = spawn_scripted_server(HashSet::new()).await;
    let mut client = client_for(addr).await;

    client
        .transfer(&mut ntpspy_client::BufSource::new(Vec::new()), "e.bin".into())
        .await
        .unwrap();

    let state = state.lock().await;
    assert_eq!(state.total_size, 0);
    assert!(state.chunks.is_empty());
    assert_eq!(state.end_crc, Some(0));
}

#[tokio::test]
async fn test_silent_server_is_no_contact() {
    // Bind a socket that never answers.
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = sock.local_addr().unwrap();

    let mut client = NtpSpyClient::builder()
        .server(addr.to_string())
        .magic(magic())
        .rtt_base(Duration::from_millis(20))
        .handshake_retries(2)
        .build()
        .await
        .unwrap();

    let err = client.query().await.unwrap_err();
    assert!(matches!(err, ClientError::NoContact));
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn test_pacing_spaces_datagrams() {
    let (addr, _state) = spawn_scripted_server(HashSet::new()).await;
    let mut client = NtpSpyClient::builder()
        .server(addr.to_string())
        .magic(magic())
        .min_interval(Duration::from_millis(50))
        .build()
        .await
        .unwrap();

    // Start + 2 data + End = 4 datagrams, so at least 3 gaps.
    let started = std::time::Instant::now();
    client
        .transfer(
            &mut ntpspy_client::BufSource::new(vec![9u8; 20]),
            "paced.bin".into(),
        )
        .await
        .unwrap();
    assert!(
        started.elapsed() >= Duration::from_millis(150),
        "pacing must dominate scheduling"
    );
}
