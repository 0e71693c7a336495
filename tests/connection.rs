use bytes::Bytes;
use gnet_rs::transport::frame::{encode_session_packet, read_frame, write_frame};
use gnet_rs::transport::handshake::{read_hello, write_hello};
use gnet_rs::transport::{ByteCounters, ConnPool, Packet, PoolConfig, SessionPacket, SessionState};
use gnet_rs::util::Keys;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

fn config() -> PoolConfig {
    PoolConfig::default().with_heartbeat_interval(Duration::from_secs(2))
}

/// 跳过心跳帧，读到下一个会话包为止
async fn next_session_packet(peer: &mut DuplexStream) -> (u64, SessionPacket) {
    loop {
        let frame = read_frame(peer, 1 << 20).await.unwrap().expect("connection open");
        match Packet::from_bytes(frame).unwrap() {
            Packet::Session { session_id, packet } => return (session_id, packet),
            Packet::Info(_) | Packet::Ping => continue,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn peer_session_traffic_flows_through_pool() {
    let counters = Arc::new(ByteCounters::new());
    let (sink, mut created) = mpsc::unbounded_channel();
    let pool = ConnPool::builder(1, "secret")
        .config(config())
        .on_new_session(sink)
        .byte_counters(counters.clone())
        .spawn();

    let (io, mut peer) = tokio::io::duplex(1 << 16);
    pool.submit_connection(Box::new(io)).unwrap();

    let hello = encode_session_packet(5, &SessionPacket::Data(Bytes::from_static(b"ping")));
    write_frame(&mut peer, &hello).await.unwrap();

    let session = created.recv().await.unwrap();
    assert_eq!(session.id(), 5);
    assert_eq!(
        session.recv().await,
        Some(SessionPacket::Data(Bytes::from_static(b"ping")))
    );

    session.send("pong").unwrap();
    let (id, packet) = next_session_packet(&mut peer).await;
    assert_eq!(id, 5);
    assert_eq!(packet, SessionPacket::Data(Bytes::from_static(b"pong")));

    assert_eq!(counters.bytes_read(), (4 + hello.len()) as u64);
    // 写循环在写完之后才累加
    while counters.bytes_sent() < (4 + 10 + 4) as u64 {
        tokio::task::yield_now().await;
    }
    pool.stop();
}

#[tokio::test(start_paused = true)]
async fn peer_stop_state_concludes_session() {
    let (sink, mut created) = mpsc::unbounded_channel();
    let pool = ConnPool::builder(1, "secret")
        .config(config())
        .on_new_session(sink)
        .spawn();

    let (io, mut peer) = tokio::io::duplex(1 << 16);
    pool.submit_connection(Box::new(io)).unwrap();
    let session = pool.create_session(3).await.unwrap().session().unwrap();
    assert_eq!(created.recv().await.unwrap().id(), 3);

    let stop = encode_session_packet(3, &SessionPacket::State(SessionState::Stop));
    write_frame(&mut peer, &stop).await.unwrap();

    assert_eq!(session.recv().await, Some(SessionPacket::State(SessionState::Stop)));
    assert_eq!(session.recv().await, None);
    assert!(session.is_stopped());

    loop {
        if pool.stats().await.unwrap().stopped_sessions == 1 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(pool.create_session(3).await.unwrap().is_rejected());
    pool.stop();
}

#[tokio::test(start_paused = true)]
async fn oversize_frame_kills_connection_and_pool() {
    let pool = ConnPool::new(1, "secret", config().with_max_frame_size(64));
    let (io, mut peer) = tokio::io::duplex(1 << 16);
    pool.submit_connection(Box::new(io)).unwrap();

    write_frame(&mut peer, &[0u8; 128]).await.unwrap();
    pool.wait_closed().await;
    assert!(pool.is_closed());
}

#[tokio::test(start_paused = true)]
async fn garbage_frames_are_ignored() {
    let pool = ConnPool::new(1, "secret", config());
    let (io, mut peer) = tokio::io::duplex(1 << 16);
    pool.submit_connection(Box::new(io)).unwrap();

    write_frame(&mut peer, &[0xff, 1, 2]).await.unwrap();
    write_frame(&mut peer, &Packet::Ping.to_bytes()).await.unwrap();
    loop {
        let stats = pool.stats().await.unwrap();
        if stats.pings_received == 1 {
            assert_eq!(stats.connections, 1);
            assert_eq!(stats.sessions, 0);
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(!pool.is_closed());
    pool.stop();
}

#[tokio::test(start_paused = true)]
async fn handshake_binds_socket_to_client_pool() {
    let keys = Keys::derive("secret");
    let pool = ConnPool::new(77, "secret", config());
    assert_eq!(pool.keys(), &keys);

    let (mut client, mut server) = tokio::io::duplex(1 << 16);
    write_hello(&mut client, &keys, 77).await.unwrap();
    let client_id = read_hello(&mut server, pool.keys()).await.unwrap();
    assert_eq!(client_id, pool.client_id());

    pool.submit_connection(Box::new(server)).unwrap();
    let frame = read_frame(&mut client, 1 << 20).await.unwrap().unwrap();
    assert_eq!(Packet::from_bytes(frame).unwrap(), Packet::Info(Bytes::new()));
    pool.stop();
}

#[tokio::test(start_paused = true)]
async fn connection_refused_by_closed_pool_moves_to_fresh_pool() {
    let old = ConnPool::new(3, "secret", config());
    old.stop();
    old.wait_closed().await;

    let (io, mut peer) = tokio::io::duplex(1 << 16);
    let io = match old.try_submit_connection(Box::new(io)) {
        Ok(id) => panic!("closed pool accepted connection {}", id),
        Err(io) => io,
    };

    let fresh = ConnPool::new(3, "secret", config());
    fresh.try_submit_connection(io).ok().expect("fresh pool accepts");
    let frame = read_frame(&mut peer, 1 << 20).await.unwrap().expect("connection open");
    assert_eq!(Packet::from_bytes(frame).unwrap(), Packet::Info(Bytes::new()));
    fresh.stop();
}
