//! Acceptance tests for the networking stack.
//!
//! These tests verify the end-to-end behavior:
//! 1. Echo - a framed message round-trips over a single connection
//! 2. Tie-break - simultaneous dials converge to one chosen connection
//! 3. Oversized message - a bad header terminates the connection
//! 4. Retry - a bounded number of attempts against a dead address
//! 5. Keep-alive - a silent peer is torn down after the idle timeout
//! 6. Multicast - partial failure surfaces a recoverable error
//! 7. Peer removal - del_peer terminates the chosen connection
//! 8. Backpressure - a small inbox never loses or reorders messages
//! 9. Backpressure - writes and termination work while reads are paused

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::sleep;

use crosswire::{
    ConnPoolConfig, ConnRef, Envelope, Error, IdentityMode, MsgNetwork, MsgNetworkConfig,
    PeerId, PeerNetwork, PeerNetworkConfig, Result, WireMsg,
};

/// Echo request carrying an opaque payload.
struct Echo(Vec<u8>);

impl WireMsg<u8> for Echo {
    const OPCODE: u8 = 0x01;

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_slice(&self.0);
    }

    fn decode(src: &mut Bytes) -> Result<Self> {
        Ok(Echo(src.to_vec()))
    }
}

/// Echo response.
struct EchoReply(Vec<u8>);

impl WireMsg<u8> for EchoReply {
    const OPCODE: u8 = 0x02;

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_slice(&self.0);
    }

    fn decode(src: &mut Bytes) -> Result<Self> {
        Ok(EchoReply(src.to_vec()))
    }
}

/// Sequenced message for ordering checks.
struct Seq(u32);

impl WireMsg<u8> for Seq {
    const OPCODE: u8 = 0x03;

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.0);
    }

    fn decode(src: &mut Bytes) -> Result<Self> {
        if src.remaining() < 4 {
            return Err(Error::Decode("truncated seq"));
        }
        Ok(Seq(src.get_u32_le()))
    }
}

/// Wait for a condition with timeout, polling periodically.
async fn wait_for<F, Fut>(timeout_ms: u64, poll_ms: u64, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(timeout_ms);
    let poll = Duration::from_millis(poll_ms);

    loop {
        if condition().await {
            return true;
        }
        if start.elapsed() > timeout {
            return false;
        }
        sleep(poll).await;
    }
}

/// Peer network configuration tuned for fast tests.
fn peer_config() -> PeerNetworkConfig<u8> {
    PeerNetworkConfig::new()
        .with_msg(
            MsgNetworkConfig::new().with_pool(
                ConnPoolConfig::new().with_conn_server_timeout(Duration::from_secs(2)),
            ),
        )
        .with_id_mode(IdentityMode::AddrBased)
        .with_ping_period(Duration::from_millis(300))
        .with_conn_timeout(Duration::from_secs(10))
}

// ============================================================================
// Test 1: Echo - a message round-trips over a single connection
// ============================================================================

#[tokio::test]
async fn test_single_connection_echo() {
    // Node 1 listens and echoes whatever it receives
    let n1 = MsgNetwork::<u8>::new(MsgNetworkConfig::default());
    let n1_for_handler = n1.clone();
    n1.reg_msg_handler(move |msg: Echo, conn| {
        let net = n1_for_handler.clone();
        async move {
            net.send_msg(&EchoReply(msg.0), &conn).await;
        }
    });
    n1.start();
    let addr = n1.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

    // Node 2 has no listener
    let n2 = MsgNetwork::<u8>::new(MsgNetworkConfig::default());
    let replies = Arc::new(Mutex::new(Vec::new()));
    let replies_in = replies.clone();
    n2.reg_msg_handler(move |msg: EchoReply, _conn| {
        replies_in.lock().unwrap().push(msg.0);
        async {}
    });
    n2.start();

    let conn = n2.connect(addr).await.unwrap();
    assert!(n2.send_msg(&Echo(b"hello".to_vec()), &conn).await);

    let replies_check = replies.clone();
    assert!(
        wait_for(5000, 20, || {
            let replies = replies_check.clone();
            async move { !replies.lock().unwrap().is_empty() }
        })
        .await,
        "echo reply should arrive"
    );

    // Exactly one reply, byte-for-byte identical
    sleep(Duration::from_millis(100)).await;
    let got = replies.lock().unwrap().clone();
    assert_eq!(got, vec![b"hello".to_vec()]);

    n2.stop().await;
    n1.stop().await;
}

// ============================================================================
// Test 2: Tie-break - simultaneous dials converge to one connection
// ============================================================================

#[tokio::test]
async fn test_duplicate_handshake_tie_break() {
    let a = PeerNetwork::new(peer_config());
    let b = PeerNetwork::new(peer_config());

    let a_up = Arc::new(AtomicUsize::new(0));
    let a_down = Arc::new(AtomicUsize::new(0));
    let (up, down) = (a_up.clone(), a_down.clone());
    a.reg_peer_handler(move |_conn, connected| {
        if connected {
            up.fetch_add(1, Ordering::SeqCst);
        } else {
            down.fetch_add(1, Ordering::SeqCst);
        }
    });

    let b_up = Arc::new(AtomicUsize::new(0));
    let b_down = Arc::new(AtomicUsize::new(0));
    let (up, down) = (b_up.clone(), b_down.clone());
    b.reg_peer_handler(move |_conn, connected| {
        if connected {
            up.fetch_add(1, Ordering::SeqCst);
        } else {
            down.fetch_add(1, Ordering::SeqCst);
        }
    });

    a.start();
    b.start();
    let addr_a = a.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr_b = b.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let pid_a = PeerId::from_addr(&addr_a);
    let pid_b = PeerId::from_addr(&addr_b);

    // Register each other and dial simultaneously
    a.add_peer(pid_b);
    a.set_peer_addr(pid_b, addr_b);
    b.add_peer(pid_a);
    b.set_peer_addr(pid_a, addr_a);
    a.conn_peer(pid_b, -1, Duration::from_secs(1));
    b.conn_peer(pid_a, -1, Duration::from_secs(1));

    let (ua, ub) = (a_up.clone(), b_up.clone());
    assert!(
        wait_for(10000, 20, || {
            let (ua, ub) = (ua.clone(), ub.clone());
            async move {
                ua.load(Ordering::SeqCst) == 1 && ub.load(Ordering::SeqCst) == 1
            }
        })
        .await,
        "both sides should establish a peer connection"
    );

    // The chosen connections stay up and no second handshake completes
    sleep(Duration::from_millis(500)).await;
    assert_eq!(a_up.load(Ordering::SeqCst), 1);
    assert_eq!(b_up.load(Ordering::SeqCst), 1);
    assert_eq!(a_down.load(Ordering::SeqCst), 0);
    assert_eq!(b_down.load(Ordering::SeqCst), 0);

    let conn_ab = a.get_peer_conn(&pid_b).await.unwrap().unwrap();
    let conn_ba = b.get_peer_conn(&pid_a).await.unwrap().unwrap();
    assert!(!conn_ab.is_terminated());
    assert!(!conn_ba.is_terminated());

    a.stop().await;
    b.stop().await;
}

// ============================================================================
// Test 3: Oversized message - the connection drops, no handler runs
// ============================================================================

#[tokio::test]
async fn test_oversized_message_terminates() {
    let server = MsgNetwork::<u8>::new(MsgNetworkConfig::new().with_max_msg_size(16));
    let handled = Arc::new(AtomicUsize::new(0));
    let handled_in = handled.clone();
    server.reg_msg_handler(move |_msg: Echo, _conn| {
        handled_in.fetch_add(1, Ordering::SeqCst);
        async {}
    });

    let oversized = Arc::new(AtomicUsize::new(0));
    let oversized_in = oversized.clone();
    server.reg_error_handler(move |err, fatal, _id| {
        if matches!(err, Error::OversizedMsg { .. }) {
            assert!(!fatal);
            oversized_in.fetch_add(1, Ordering::SeqCst);
        }
    });
    server.start();
    let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

    // Raw client declares a 1024-byte payload
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut frame = BytesMut::new();
    frame.put_u8(0x01);
    frame.put_u32_le(1024);
    frame.put_u32_le(0);
    stream.write_all(&frame).await.unwrap();

    let oversized_check = oversized.clone();
    assert!(
        wait_for(5000, 20, || {
            let oversized = oversized_check.clone();
            async move { oversized.load(Ordering::SeqCst) == 1 }
        })
        .await,
        "oversized frame should surface through the error callback"
    );

    // The server closed the connection; the client sees EOF
    let mut buf = [0u8; 64];
    let mut closed = false;
    loop {
        match tokio::time::timeout(Duration::from_secs(3), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => {
                closed = true;
                break;
            }
            Ok(Ok(_)) => continue,
            Err(_) => break,
        }
    }
    assert!(closed, "connection should be closed by the server");
    assert_eq!(handled.load(Ordering::SeqCst), 0, "no handler runs");

    server.stop().await;
}

// ============================================================================
// Test 4: Retry - a bounded number of attempts against a dead address
// ============================================================================

#[tokio::test]
async fn test_retry_budget_on_dead_address() {
    let net = PeerNetwork::new(peer_config());

    let attempts = Arc::new(AtomicUsize::new(0));
    let established = Arc::new(AtomicUsize::new(0));
    let attempts_in = attempts.clone();
    net.reg_conn_handler(move |_conn, connected| {
        if !connected {
            attempts_in.fetch_add(1, Ordering::SeqCst);
        }
    });
    let established_in = established.clone();
    net.reg_peer_handler(move |_conn, connected| {
        if connected {
            established_in.fetch_add(1, Ordering::SeqCst);
        }
    });
    net.start();
    net.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

    // Nothing listens on the peer's address
    let dead_addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let pid = PeerId::from_addr(&dead_addr);
    net.add_peer(pid);
    net.set_peer_addr(pid, dead_addr);
    net.conn_peer(pid, 3, Duration::from_millis(200));

    let attempts_check = attempts.clone();
    assert!(
        wait_for(10000, 20, || {
            let attempts = attempts_check.clone();
            async move { attempts.load(Ordering::SeqCst) >= 3 }
        })
        .await,
        "three attempts should be made"
    );

    // The budget is exhausted; no further attempts
    sleep(Duration::from_millis(800)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(established.load(Ordering::SeqCst), 0);

    net.stop().await;
}

// ============================================================================
// Test 5: Keep-alive - a silent peer is torn down after the idle timeout
// ============================================================================

/// Serialize a handshake ping the way an initiating node would.
fn raw_handshake_ping(claimed: SocketAddr, nonce: u32) -> Bytes {
    let mut payload = BytesMut::new();
    payload.put_u8(1);
    match claimed {
        SocketAddr::V4(v4) => {
            payload.put_slice(&v4.ip().octets());
            payload.put_u16_le(v4.port());
        }
        SocketAddr::V6(_) => unreachable!("tests use IPv4"),
    }
    payload.put_u32_le(nonce);
    Envelope::new(0xf0u8, payload.freeze(), 0).to_bytes()
}

#[tokio::test]
async fn test_keep_alive_timeout() {
    let config = peer_config()
        .with_ping_period(Duration::from_millis(100))
        .with_conn_timeout(Duration::from_millis(600));
    let a = PeerNetwork::new(config);

    let events = Arc::new(Mutex::new(Vec::new()));
    let events_in = events.clone();
    a.reg_peer_handler(move |_conn, connected| {
        events_in.lock().unwrap().push(connected);
    });
    a.start();
    let addr_a = a.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

    // The remote claims this listen address; its peer id derives from it
    let claimed: SocketAddr = "127.0.0.1:45555".parse().unwrap();
    let pid = PeerId::from_addr(&claimed);
    a.add_peer(pid);

    // A raw client completes the handshake, then goes silent
    let mut stream = TcpStream::connect(addr_a).await.unwrap();
    stream
        .write_all(&raw_handshake_ping(claimed, 7))
        .await
        .unwrap();

    let events_check = events.clone();
    assert!(
        wait_for(5000, 20, || {
            let events = events_check.clone();
            async move { events.lock().unwrap().first() == Some(&true) }
        })
        .await,
        "handshake should complete"
    );

    // No pongs come back; the idle timeout tears the connection down
    let events_check = events.clone();
    assert!(
        wait_for(5000, 20, || {
            let events = events_check.clone();
            async move { events.lock().unwrap().len() >= 2 }
        })
        .await,
        "silent peer should be torn down"
    );
    assert_eq!(events.lock().unwrap().clone(), vec![true, false]);

    drop(stream);
    a.stop().await;
}

// ============================================================================
// Test 6: Multicast - partial failure surfaces a recoverable error
// ============================================================================

#[tokio::test]
async fn test_multicast_partial_failure() {
    let a = PeerNetwork::new(peer_config());
    let b = PeerNetwork::new(peer_config());

    let received = Arc::new(Mutex::new(Vec::new()));
    let received_in = received.clone();
    b.reg_msg_handler(move |msg: Echo, _conn| {
        received_in.lock().unwrap().push(msg.0);
        async {}
    });

    let errors = Arc::new(Mutex::new(Vec::new()));
    let errors_in = errors.clone();
    a.reg_error_handler(move |err, fatal, id| {
        let kind = match err {
            Error::ConnNotReady => "not_ready",
            Error::PeerNotExist => "not_exist",
            _ => return,
        };
        assert!(!fatal);
        errors_in.lock().unwrap().push((kind, id));
    });

    a.start();
    b.start();
    let addr_a = a.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr_b = b.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let pid_a = PeerId::from_addr(&addr_a);
    let pid_b = PeerId::from_addr(&addr_b);

    a.add_peer(pid_b);
    a.set_peer_addr(pid_b, addr_b);
    b.add_peer(pid_a);
    a.conn_peer(pid_b, -1, Duration::from_secs(1));

    let a_check = a.clone();
    assert!(
        wait_for(10000, 20, || {
            let a = a_check.clone();
            async move {
                matches!(a.get_peer_conn(&pid_b).await, Ok(Some(c)) if !c.is_terminated())
            }
        })
        .await,
        "peer B should connect"
    );

    // P2 is registered but never connected
    let unused: SocketAddr = "127.0.0.1:46666".parse().unwrap();
    let pid_x = PeerId::from_addr(&unused);
    a.add_peer(pid_x);
    a.set_peer_addr(pid_x, unused);

    assert!(a.has_peer(&pid_b).await);
    assert_eq!(a.get_npending().await, 0, "handshake completed, nothing pending");

    let id = a.multicast_msg(&Echo(b"fanout".to_vec()), &[pid_b, pid_x]);

    let received_check = received.clone();
    assert!(
        wait_for(5000, 20, || {
            let received = received_check.clone();
            async move { received.lock().unwrap().as_slice() == [b"fanout".to_vec()] }
        })
        .await,
        "connected peer should receive the message"
    );

    let errors_check = errors.clone();
    assert!(
        wait_for(5000, 20, || {
            let errors = errors_check.clone();
            async move { errors.lock().unwrap().contains(&("not_ready", id)) }
        })
        .await,
        "unresolved peer should surface the multicast's async-id"
    );

    // An unregistered id early in the list does not block later peers
    let never_added = PeerId::from_addr(&"127.0.0.1:46777".parse().unwrap());
    let id2 = a.multicast_msg(&Echo(b"fanout-2".to_vec()), &[never_added, pid_b]);

    let received_check = received.clone();
    assert!(
        wait_for(5000, 20, || {
            let received = received_check.clone();
            async move {
                received.lock().unwrap().as_slice()
                    == [b"fanout".to_vec(), b"fanout-2".to_vec()]
            }
        })
        .await,
        "resolved peers after an unregistered id still receive the message"
    );
    let errors_check = errors.clone();
    assert!(
        wait_for(5000, 20, || {
            let errors = errors_check.clone();
            async move { errors.lock().unwrap().contains(&("not_exist", id2)) }
        })
        .await,
        "the unregistered peer surfaces with the second multicast's async-id"
    );

    a.stop().await;
    b.stop().await;
}

// ============================================================================
// Test 7: Peer removal - del_peer terminates the chosen connection
// ============================================================================

#[tokio::test]
async fn test_del_peer_terminates_connection() {
    let a = PeerNetwork::new(peer_config());
    let b = PeerNetwork::new(peer_config());
    a.start();
    b.start();
    let addr_a = a.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr_b = b.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let pid_a = PeerId::from_addr(&addr_a);
    let pid_b = PeerId::from_addr(&addr_b);
    a.add_peer(pid_b);
    a.set_peer_addr(pid_b, addr_b);
    b.add_peer(pid_a);
    a.conn_peer(pid_b, -1, Duration::from_secs(1));

    let a_check = a.clone();
    assert!(
        wait_for(10000, 20, || {
            let a = a_check.clone();
            async move {
                matches!(a.get_peer_conn(&pid_b).await, Ok(Some(c)) if !c.is_terminated())
            }
        })
        .await
    );
    let conn = a.get_peer_conn(&pid_b).await.unwrap().unwrap();

    a.del_peer(pid_b);

    let a_check = a.clone();
    assert!(
        wait_for(5000, 20, || {
            let a = a_check.clone();
            async move { !a.has_peer(&pid_b).await }
        })
        .await,
        "peer should be unregistered"
    );
    let conn_check = conn.clone();
    assert!(
        wait_for(5000, 20, || {
            let conn = conn_check.clone();
            async move { conn.is_terminated() }
        })
        .await,
        "the chosen connection should be terminated"
    );
    assert!(matches!(
        a.get_peer_conn(&pid_b).await,
        Err(Error::PeerNotExist)
    ));

    a.stop().await;
    b.stop().await;
}

// ============================================================================
// Test 8: Backpressure - a small inbox never loses or reorders messages
// ============================================================================

#[tokio::test]
async fn test_backpressure_preserves_order() {
    const TOTAL: u32 = 40;

    let config = MsgNetworkConfig::new()
        .with_max_msg_queue_size(2)
        .with_burst_size(2);
    let server = MsgNetwork::<u8>::new(config);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in = seen.clone();
    server.reg_msg_handler(move |msg: Seq, _conn| {
        let seen = seen_in.clone();
        async move {
            // Slow consumer forces the inbox to fill
            sleep(Duration::from_millis(5)).await;
            seen.lock().unwrap().push(msg.0);
        }
    });
    server.start();
    let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let client = MsgNetwork::<u8>::new(MsgNetworkConfig::default());
    client.start();
    let conn = client.connect(addr).await.unwrap();

    for i in 0..TOTAL {
        assert!(client.send_msg(&Seq(i), &conn).await);
    }

    let seen_check = seen.clone();
    assert!(
        wait_for(15000, 50, || {
            let seen = seen_check.clone();
            async move { seen.lock().unwrap().len() == TOTAL as usize }
        })
        .await,
        "every message should be delivered"
    );
    let got = seen.lock().unwrap().clone();
    let expected: Vec<u32> = (0..TOTAL).collect();
    assert_eq!(got, expected, "delivery preserves per-connection order");

    client.stop().await;
    server.stop().await;
}

// ============================================================================
// Test 9: Backpressure - writes and termination work while reads are paused
// ============================================================================

#[tokio::test]
async fn test_backpressure_keeps_writes_and_control_live() {
    const TOTAL: u32 = 60;

    let config = MsgNetworkConfig::new()
        .with_max_msg_queue_size(2)
        .with_burst_size(1);
    let server = MsgNetwork::<u8>::new(config);

    let server_conn = Arc::new(Mutex::new(None::<ConnRef>));
    let server_down = Arc::new(AtomicUsize::new(0));
    let (conn_slot, down) = (server_conn.clone(), server_down.clone());
    server.reg_conn_handler(move |conn, connected| {
        if connected {
            *conn_slot.lock().unwrap() = Some(conn.clone());
        } else {
            down.fetch_add(1, Ordering::SeqCst);
        }
    });

    let handled = Arc::new(AtomicUsize::new(0));
    let handled_in = handled.clone();
    server.reg_msg_handler(move |_msg: Seq, _conn| {
        let handled = handled_in.clone();
        async move {
            // Slow consumer keeps the inbox full for seconds
            sleep(Duration::from_millis(50)).await;
            handled.fetch_add(1, Ordering::SeqCst);
        }
    });
    server.start();
    let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let client = MsgNetwork::<u8>::new(MsgNetworkConfig::default());
    let echoes = Arc::new(Mutex::new(Vec::new()));
    let echoes_in = echoes.clone();
    client.reg_msg_handler(move |msg: Echo, _conn| {
        echoes_in.lock().unwrap().push(msg.0);
        async {}
    });
    client.start();
    let conn = client.connect(addr).await.unwrap();

    for i in 0..TOTAL {
        assert!(client.send_msg(&Seq(i), &conn).await);
    }

    // Wait until the server is clearly backpressured
    let (conn_check, handled_check) = (server_conn.clone(), handled.clone());
    assert!(
        wait_for(5000, 20, || {
            let (conn, handled) = (conn_check.clone(), handled_check.clone());
            async move {
                conn.lock().unwrap().is_some() && handled.load(Ordering::SeqCst) >= 1
            }
        })
        .await
    );
    let sconn = server_conn.lock().unwrap().clone().unwrap();

    // The paused connection still accepts and flushes writes
    assert!(server.send_msg(&Echo(b"live".to_vec()), &sconn).await);
    let echoes_check = echoes.clone();
    assert!(
        wait_for(2000, 20, || {
            let echoes = echoes_check.clone();
            async move { echoes.lock().unwrap().as_slice() == [b"live".to_vec()] }
        })
        .await,
        "writes must flush while reads are paused"
    );
    assert!(
        (handled.load(Ordering::SeqCst) as u32) < TOTAL,
        "the inbox should still be draining"
    );

    // Termination takes effect without waiting for the inbox to drain
    server.terminate(&sconn);
    let (conn_check, down_check) = (sconn.clone(), server_down.clone());
    assert!(
        wait_for(2000, 20, || {
            let (conn, down) = (conn_check.clone(), down_check.clone());
            async move { conn.is_terminated() && down.load(Ordering::SeqCst) >= 1 }
        })
        .await,
        "terminate must not be gated on the full inbox"
    );

    client.stop().await;
    server.stop().await;
}
