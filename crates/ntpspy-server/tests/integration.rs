// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! Integration tests driving the server over loopback UDP with raw
//! datagrams.

mod common;

use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use common::{magic, mem_server, spawn_test_server, RawPeer};
use ntpspy_proto::{
    chunk_count, AckOf, ChunkPayload, Magic, Message, NakReason, NO_CHUNK, PROTOCOL_VERSION,
};
use ntpspy_server::{FileStore, NtpSpyServer};

fn chunks_of(data: &[u8]) -> Vec<ChunkPayload> {
    data.chunks(16).map(|c| ChunkPayload::new(c).unwrap()).collect()
}

/// Drive a complete upload through raw datagrams.
async fn upload(peer: &RawPeer, transfer_id: u32, name: &str, data: &[u8]) {
    let total_chunks = chunk_count(data.len() as u64) as u32;
    let reply = peer
        .exchange(&Message::Start {
            transfer_id,
            total_size: data.len() as u64,
            name: name.into(),
        })
        .await;
    assert_eq!(
        reply,
        Message::Ack {
            transfer_id,
            of: AckOf::Start
        }
    );

    for (i, payload) in chunks_of(data).into_iter().enumerate() {
        let index = i as u32;
        let reply = peer
            .exchange(&Message::Data {
                transfer_id,
                index,
                payload,
                last: index + 1 == total_chunks,
            })
            .await;
        assert_eq!(
            reply,
            Message::Ack {
                transfer_id,
                of: AckOf::Chunk(index)
            }
        );
    }

    let reply = peer
        .exchange(&Message::End {
            transfer_id,
            total_chunks,
            crc32c: crc32c::crc32c(data),
        })
        .await;
    assert_eq!(
        reply,
        Message::Ack {
            transfer_id,
            of: AckOf::End
        }
    );
}

#[tokio::test]
async fn test_query_gets_version_reply() {
    let (_store, builder) = mem_server();
    let addr = spawn_test_server(builder).await;
    let peer = RawPeer::connect(addr).await;

    let reply = peer.exchange(&Message::Query).await;
    assert_eq!(
        reply,
        Message::QueryReply {
            version: PROTOCOL_VERSION,
            caps: 0
        }
    );
}

#[tokio::test]
async fn test_foreign_magic_gets_camouflage_and_no_state() {
    let (store, builder) = mem_server();
    let addr = spawn_test_server(builder).await;
    let peer = RawPeer::connect(addr).await;

    let wrong = Magic::new(0x1111_2222).unwrap();
    peer.send_with_magic(
        &Message::Start {
            transfer_id: 1,
            total_size: 4,
            name: "x".into(),
        },
        wrong,
    )
    .await;
    // A wrong-magic Start rides a mode-3 packet, so the server answers in
    // character as a plain time server; crucially it is NOT covert traffic
    // (the reply's magic offset holds a timestamp) and no session exists.
    let reply = peer
        .recv_raw(Duration::from_millis(500))
        .await
        .expect("camouflage reply expected");
    assert_eq!(reply.len(), 48);
    assert_eq!(reply[0] & 0b111, 4, "mode must be Server");
    assert_eq!(
        Message::decode(&reply, wrong),
        Err(ntpspy_proto::ParseError::ForeignMagic),
        "reply must not look covert to the mismatched peer"
    );

    // The session really does not exist.
    let reply = peer
        .exchange(&Message::Data {
            transfer_id: 1,
            index: 0,
            payload: ChunkPayload::new(b"abcd").unwrap(),
            last: true,
        })
        .await;
    assert_eq!(
        reply,
        Message::Nak {
            transfer_id: 1,
            index: NO_CHUNK,
            reason: NakReason::NoSession
        }
    );
    assert!(store.files().is_empty());
}

#[tokio::test]
async fn test_plain_ntp_request_gets_camouflage_reply() {
    let (_store, builder) = mem_server();
    let addr = spawn_test_server(builder).await;
    let peer = RawPeer::connect(addr).await;

    // A minimal genuine SNTP request: LI=0 VN=4 Mode=3, transmit set.
    let mut request = [0u8; 48];
    request[0] = 0x23;
    BigEndian::write_u32(&mut request[40..44], 0xE000_0000);
    BigEndian::write_u32(&mut request[44..48], 0x1234_5678);
    peer.send_raw(&request).await;

    let reply = peer
        .recv_raw(Duration::from_secs(2))
        .await
        .expect("camouflage reply expected");
    assert_eq!(reply.len(), 48);
    assert_eq!(reply[0] & 0b111, 4, "mode must be Server");
    assert_eq!((reply[0] >> 3) & 0b111, 4, "version echoed");
    assert_eq!(reply[1], 2, "stratum 2");
    assert_eq!(&reply[24..32], &request[40..48], "origin echoes our transmit");
    let t3 = BigEndian::read_u32(&reply[40..44]);
    assert!(t3 > 3_786_825_600, "transmit timestamp looks current");
}

#[tokio::test]
async fn test_full_upload_to_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path().to_path_buf(), false).unwrap();
    let addr = spawn_test_server(NtpSpyServer::builder(store).magic(magic())).await;
    let peer = RawPeer::connect(addr).await;

    upload(&peer, 1, "h.txt", b"hello").await;

    assert_eq!(std::fs::read(dir.path().join("h.txt")).unwrap(), b"hello");
    // No temp file remains.
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
}

#[tokio::test]
async fn test_same_name_twice_lands_deconflicted() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path().to_path_buf(), false).unwrap();
    let addr = spawn_test_server(NtpSpyServer::builder(store).magic(magic())).await;
    let peer = RawPeer::connect(addr).await;

    upload(&peer, 1, "h.txt", b"first").await;
    upload(&peer, 2, "h.txt", b"second").await;

    assert_eq!(std::fs::read(dir.path().join("h.txt")).unwrap(), b"first");
    assert_eq!(std::fs::read(dir.path().join("h-1.txt")).unwrap(), b"second");
}

#[tokio::test]
async fn test_overwrite_mode_replaces() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path().to_path_buf(), true).unwrap();
    let addr = spawn_test_server(NtpSpyServer::builder(store).magic(magic())).await;
    let peer = RawPeer::connect(addr).await;

    upload(&peer, 1, "h.txt", b"first").await;
    upload(&peer, 2, "h.txt", b"second").await;

    assert_eq!(std::fs::read(dir.path().join("h.txt")).unwrap(), b"second");
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
}

#[tokio::test]
async fn test_duplicate_data_acked_every_time() {
    let (store, builder) = mem_server();
    let addr = spawn_test_server(builder).await;
    let peer = RawPeer::connect(addr).await;

    peer.exchange(&Message::Start {
        transfer_id: 1,
        total_size: 4,
        name: "d.bin".into(),
    })
    .await;

    let data = Message::Data {
        transfer_id: 1,
        index: 0,
        payload: ChunkPayload::new(b"abcd").unwrap(),
        last: true,
    };
    for _ in 0..4 {
        let reply = peer.exchange(&data).await;
        assert_eq!(
            reply,
            Message::Ack {
                transfer_id: 1,
                of: AckOf::Chunk(0)
            }
        );
    }

    peer.exchange(&Message::End {
        transfer_id: 1,
        total_chunks: 1,
        crc32c: crc32c::crc32c(b"abcd"),
    })
    .await;
    assert_eq!(store.files()["d.bin"], b"abcd");
}

#[tokio::test]
async fn test_data_before_start_is_refused() {
    let (_store, builder) = mem_server();
    let addr = spawn_test_server(builder).await;
    let peer = RawPeer::connect(addr).await;

    let reply = peer
        .exchange(&Message::Data {
            transfer_id: 99,
            index: 0,
            payload: ChunkPayload::new(b"x").unwrap(),
            last: true,
        })
        .await;
    assert_eq!(
        reply,
        Message::Nak {
            transfer_id: 99,
            index: NO_CHUNK,
            reason: NakReason::NoSession
        }
    );
}

#[tokio::test]
async fn test_start_retransmit_reacks_but_conflict_is_refused() {
    let (_store, builder) = mem_server();
    let addr = spawn_test_server(builder).await;
    let peer = RawPeer::connect(addr).await;

    let start = Message::Start {
        transfer_id: 5,
        total_size: 10,
        name: "a.bin".into(),
    };
    let first = peer.exchange(&start).await;
    let second = peer.exchange(&start).await;
    assert_eq!(first, second, "identical Start re-acks without reset");

    let reply = peer
        .exchange(&Message::Start {
            transfer_id: 5,
            total_size: 11,
            name: "a.bin".into(),
        })
        .await;
    assert_eq!(
        reply,
        Message::Nak {
            transfer_id: 5,
            index: NO_CHUNK,
            reason: NakReason::SessionConflict
        }
    );
}

#[tokio::test]
async fn test_premature_end_gets_missing_hint_then_commit() {
    let (store, builder) = mem_server();
    let addr = spawn_test_server(builder).await;
    let peer = RawPeer::connect(addr).await;

    let data = b"0123456789abcdefxyz";
    let chunks = chunks_of(data);
    peer.exchange(&Message::Start {
        transfer_id: 3,
        total_size: data.len() as u64,
        name: "gap.bin".into(),
    })
    .await;

    // Send only chunk 1; End must hint chunk 0.
    peer.exchange(&Message::Data {
        transfer_id: 3,
        index: 1,
        payload: chunks[1],
        last: true,
    })
    .await;
    let end = Message::End {
        transfer_id: 3,
        total_chunks: 2,
        crc32c: crc32c::crc32c(data),
    };
    let reply = peer.exchange(&end).await;
    assert_eq!(
        reply,
        Message::Nak {
            transfer_id: 3,
            index: 0,
            reason: NakReason::MissingChunks
        }
    );

    // Fill the gap and End again.
    peer.exchange(&Message::Data {
        transfer_id: 3,
        index: 0,
        payload: chunks[0],
        last: false,
    })
    .await;
    let reply = peer.exchange(&end).await;
    assert_eq!(
        reply,
        Message::Ack {
            transfer_id: 3,
            of: AckOf::End
        }
    );
    assert_eq!(store.files()["gap.bin"], data);
}

#[tokio::test]
async fn test_checksum_mismatch_naks_and_discards() {
    let (store, builder) = mem_server();
    let addr = spawn_test_server(builder).await;
    let peer = RawPeer::connect(addr).await;

    peer.exchange(&Message::Start {
        transfer_id: 4,
        total_size: 4,
        name: "bad.bin".into(),
    })
    .await;
    peer.exchange(&Message::Data {
        transfer_id: 4,
        index: 0,
        payload: ChunkPayload::new(b"abcd").unwrap(),
        last: true,
    })
    .await;

    let reply = peer
        .exchange(&Message::End {
            transfer_id: 4,
            total_chunks: 1,
            crc32c: 0xBAD0_BAD0,
        })
        .await;
    assert_eq!(
        reply,
        Message::Nak {
            transfer_id: 4,
            index: NO_CHUNK,
            reason: NakReason::ChecksumFailed
        }
    );
    assert!(store.files().is_empty());

    // The session is retired: more traffic for it gets NoSession.
    let reply = peer
        .exchange(&Message::End {
            transfer_id: 4,
            total_chunks: 1,
            crc32c: 0xBAD0_BAD0,
        })
        .await;
    assert!(matches!(
        reply,
        Message::Nak {
            reason: NakReason::NoSession,
            ..
        }
    ));
}

#[tokio::test]
async fn test_path_components_stripped_from_name() {
    let (store, builder) = mem_server();
    let addr = spawn_test_server(builder).await;
    let peer = RawPeer::connect(addr).await;

    upload(&peer, 6, "../../etc/pw", b"nope").await;
    let files = store.files();
    assert_eq!(files.len(), 1);
    assert_eq!(files["pw"], b"nope");
}

#[tokio::test]
async fn test_empty_file_start_then_end() {
    let (store, builder) = mem_server();
    let addr = spawn_test_server(builder).await;
    let peer = RawPeer::connect(addr).await;

    upload(&peer, 7, "empty.bin", b"").await;
    assert_eq!(store.files()["empty.bin"], b"");
}

#[tokio::test]
async fn test_idle_session_is_collected_and_part_file_removed() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path().to_path_buf(), false).unwrap();
    let addr = spawn_test_server(
        NtpSpyServer::builder(store)
            .magic(magic())
            .idle_timeout(Duration::from_millis(200)),
    )
    .await;
    let peer = RawPeer::connect(addr).await;

    peer.exchange(&Message::Start {
        transfer_id: 8,
        total_size: 32,
        name: "gone.bin".into(),
    })
    .await;
    peer.exchange(&Message::Data {
        transfer_id: 8,
        index: 0,
        payload: ChunkPayload::new(&[1u8; 16]).unwrap(),
        last: false,
    })
    .await;
    assert_eq!(
        std::fs::read_dir(dir.path()).unwrap().count(),
        1,
        "temp file exists mid-transfer"
    );

    // Past the idle timeout plus a collector tick, the temp file is gone
    // and the session with it.
    tokio::time::sleep(Duration::from_millis(1600)).await;
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    let reply = peer
        .exchange(&Message::Data {
            transfer_id: 8,
            index: 1,
            payload: ChunkPayload::new(&[2u8; 16]).unwrap(),
            last: false,
        })
        .await;
    assert!(matches!(
        reply,
        Message::Nak {
            reason: NakReason::NoSession,
            ..
        }
    ));
}

#[tokio::test]
async fn test_wrong_direction_messages_dropped() {
    let (_store, builder) = mem_server();
    let addr = spawn_test_server(builder).await;
    let peer = RawPeer::connect(addr).await;

    peer.send(&Message::Ack {
        transfer_id: 1,
        of: AckOf::Start,
    })
    .await;
    peer.send(&Message::QueryReply { version: 1, caps: 0 }).await;
    assert!(peer.recv_raw(Duration::from_millis(300)).await.is_none());
}
