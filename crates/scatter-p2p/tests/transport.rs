//! Integration tests for the TCP transport over loopback.
//!
//! Each test wires two transports together and observes peer registration,
//! control-frame delivery, and the stream gate from the outside.

use futures::future::BoxFuture;
use scatter_p2p::{Rpc, TcpPeer, TcpTransport, TcpTransportOpts};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct Side {
    transport: TcpTransport,
    peers: mpsc::UnboundedReceiver<Arc<TcpPeer>>,
    gone: mpsc::UnboundedReceiver<SocketAddr>,
    inbound: mpsc::Receiver<Rpc>,
}

fn side_with(mut opts: TcpTransportOpts) -> Side {
    let (peer_tx, peers) = mpsc::unbounded_channel();
    let (gone_tx, gone) = mpsc::unbounded_channel();
    opts.on_peer = Some(Arc::new(move |peer: Arc<TcpPeer>| {
        let _ = peer_tx.send(peer);
        Ok(())
    }));
    opts.on_disconnect = Some(Arc::new(move |addr: SocketAddr| {
        let _ = gone_tx.send(addr);
    }));
    let transport = TcpTransport::new(opts);
    let inbound = transport.consume().expect("first consume gets the queue");
    Side {
        transport,
        peers,
        gone,
        inbound,
    }
}

fn side() -> Side {
    side_with(TcpTransportOpts::new("127.0.0.1:0"))
}

/// Listen on `a`, dial it from `b`, and return (a's view of b, b's view of a).
async fn connect(a: &mut Side, b: &mut Side) -> (Arc<TcpPeer>, Arc<TcpPeer>) {
    let addr = a.transport.listen_and_accept().await.unwrap();
    b.transport.dial(&addr.to_string()).await.unwrap();

    let on_a = timeout(WAIT, a.peers.recv()).await.unwrap().unwrap();
    let on_b = timeout(WAIT, b.peers.recv()).await.unwrap().unwrap();
    (on_a, on_b)
}

#[tokio::test]
async fn test_listen_reports_bound_addr() {
    let s = side();
    assert_eq!(s.transport.addr(), "127.0.0.1:0");
    let addr = s.transport.listen_and_accept().await.unwrap();
    assert_ne!(addr.port(), 0);
    assert_eq!(s.transport.addr(), addr.to_string());
    assert!(s.transport.consume().is_none(), "queue is handed out once");
}

#[tokio::test]
async fn test_dial_registers_peer_on_both_sides() {
    let mut a = side();
    let mut b = side();
    let (b_seen_by_a, a_seen_by_b) = connect(&mut a, &mut b).await;

    assert!(b_seen_by_a.is_incoming());
    assert!(!a_seen_by_b.is_incoming());
    assert_eq!(a_seen_by_b.remote_addr(), a.transport.local_addr().unwrap());
}

#[tokio::test]
async fn test_control_frame_is_delivered_with_sender() {
    let mut a = side();
    let mut b = side();
    let (b_seen_by_a, a_seen_by_b) = connect(&mut a, &mut b).await;

    a_seen_by_b.send_message(b"{\"hello\":1}").await.unwrap();

    let rpc = timeout(WAIT, a.inbound.recv()).await.unwrap().unwrap();
    assert_eq!(rpc.from, b_seen_by_a.remote_addr());
    assert!(!rpc.stream);
    assert_eq!(&rpc.payload[..], b"{\"hello\":1}");
}

#[tokio::test]
async fn test_stream_pauses_receive_loop_until_released() {
    let mut a = side();
    let mut b = side();
    let (b_seen_by_a, a_seen_by_b) = connect(&mut a, &mut b).await;

    a_seen_by_b.send_message(b"before").await.unwrap();
    a_seen_by_b
        .send_stream(Some(3), &mut &b"abc"[..])
        .await
        .unwrap();
    a_seen_by_b.send_message(b"after").await.unwrap();

    let first = timeout(WAIT, a.inbound.recv()).await.unwrap().unwrap();
    assert_eq!(&first.payload[..], b"before");

    // The stream shows up in the queue in wire order.
    let marker = timeout(WAIT, a.inbound.recv()).await.unwrap().unwrap();
    assert!(marker.stream);
    assert!(marker.payload.is_empty());
    assert_eq!(marker.from, b_seen_by_a.remote_addr());

    let mut stream = timeout(WAIT, b_seen_by_a.read_stream())
        .await
        .unwrap()
        .unwrap();
    let size = stream.read_i64_le().await.unwrap();
    let mut body = vec![0u8; size as usize];
    stream.read_exact(&mut body).await.unwrap();
    assert_eq!(body, b"abc");

    // The frame after the stream must wait for the release.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(a.inbound.try_recv().is_err());

    stream.release();
    let last = timeout(WAIT, a.inbound.recv()).await.unwrap().unwrap();
    assert!(!last.stream);
    assert_eq!(&last.payload[..], b"after");
}

#[tokio::test]
async fn test_close_triggers_disconnect_on_remote() {
    let mut a = side();
    let mut b = side();
    let (_b_seen_by_a, a_seen_by_b) = connect(&mut a, &mut b).await;

    a.transport.close();

    let gone = timeout(WAIT, b.gone.recv()).await.unwrap().unwrap();
    assert_eq!(gone, a_seen_by_b.remote_addr());
    assert!(a_seen_by_b.is_closed());
    assert!(a_seen_by_b.read_stream().await.is_err());
}

#[tokio::test]
async fn test_closing_one_peer_drops_only_that_connection() {
    let mut a = side();
    let mut b = side();
    let (b_seen_by_a, a_seen_by_b) = connect(&mut a, &mut b).await;

    // The receive loop is idle in a frame read; closing must still end it.
    b_seen_by_a.close();

    let gone_on_a = timeout(WAIT, a.gone.recv()).await.unwrap().unwrap();
    assert_eq!(gone_on_a, b_seen_by_a.remote_addr());
    let gone_on_b = timeout(WAIT, b.gone.recv()).await.unwrap().unwrap();
    assert_eq!(gone_on_b, a_seen_by_b.remote_addr());
    assert!(!a.transport.is_closed());
}

#[tokio::test]
async fn test_closing_peer_mid_stream_unblocks_loop() {
    let mut a = side();
    let mut b = side();
    let (b_seen_by_a, a_seen_by_b) = connect(&mut a, &mut b).await;

    a_seen_by_b
        .send_stream(None, &mut &b"never claimed"[..])
        .await
        .unwrap();
    let marker = timeout(WAIT, a.inbound.recv()).await.unwrap().unwrap();
    assert!(marker.stream);

    // Nobody claims the stream; closing the peer still tears the loop down.
    b_seen_by_a.close();
    let gone = timeout(WAIT, a.gone.recv()).await.unwrap().unwrap();
    assert_eq!(gone, b_seen_by_a.remote_addr());
}

fn reject(_peer: &TcpPeer) -> BoxFuture<'_, anyhow::Result<()>> {
    Box::pin(async { anyhow::bail!("not welcome") })
}

#[tokio::test]
async fn test_failed_handshake_never_registers() {
    let mut opts = TcpTransportOpts::new("127.0.0.1:0");
    opts.handshake = Arc::new(reject);
    let mut a = side_with(opts);
    let b = side();

    let addr = a.transport.listen_and_accept().await.unwrap();
    b.transport.dial(&addr.to_string()).await.unwrap();

    assert!(timeout(Duration::from_millis(300), a.peers.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn test_dial_unreachable_fails() {
    let b = side();
    let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = unused.local_addr().unwrap();
    drop(unused);

    assert!(b.transport.dial(&addr.to_string()).await.is_err());
}
