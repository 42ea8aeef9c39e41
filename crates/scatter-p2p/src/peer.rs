//! A live connection to a remote node.

use anyhow::{Context, Result};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::frame::{encode_message, INCOMING_STREAM};

/// One side of a TCP connection plus the synchronization the receive loop
/// and the protocol layer share.
///
/// Writes are serialized by a mutex: every `send_*` call puts a complete
/// frame on the wire before another writer can start. The read half is
/// shared between the receive loop (frame headers) and stream consumers
/// (payload bytes), handed over through two semaphores:
///
/// - `stream_ready` gains a permit each time the loop reads a stream tag;
///   [`TcpPeer::read_stream`] consumes it.
/// - `stream_done` gains a permit when the [`StreamReader`] is dropped; the
///   loop waits for it before reading the next tag.
///
/// [`close`](TcpPeer::close) ends the receive loop as well, so closing a peer
/// always leads to its disconnect callback.
pub struct TcpPeer {
    remote_addr: SocketAddr,
    incoming: bool,
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    stream_ready: Semaphore,
    stream_done: Semaphore,
    closed: CancellationToken,
}

impl TcpPeer {
    pub fn new(stream: TcpStream, incoming: bool) -> Result<Self> {
        let remote_addr = stream.peer_addr().context("reading peer address")?;
        stream
            .set_nodelay(true)
            .with_context(|| format!("setting TCP_NODELAY for {remote_addr}"))?;
        let (read_half, write_half) = stream.into_split();

        Ok(TcpPeer {
            remote_addr,
            incoming,
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(write_half),
            stream_ready: Semaphore::new(0),
            stream_done: Semaphore::new(0),
            closed: CancellationToken::new(),
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// True for accepted connections, false for dialed ones.
    pub fn is_incoming(&self) -> bool {
        self.incoming
    }

    /// Write raw bytes. Meant for handshakes; protocol traffic should go
    /// through [`send_message`](Self::send_message) / [`send_stream`](Self::send_stream).
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let mut w = self.writer.lock().await;
        w.write_all(data)
            .await
            .with_context(|| format!("writing to {}", self.remote_addr))
    }

    /// Read exactly `buf.len()` raw bytes. Only valid before the receive loop
    /// starts, i.e. from inside a handshake.
    pub async fn recv_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut r = self.reader.lock().await;
        r.read_exact(buf)
            .await
            .with_context(|| format!("reading from {}", self.remote_addr))?;
        Ok(())
    }

    /// Send `body` as one control frame.
    pub async fn send_message(&self, body: &[u8]) -> Result<()> {
        let frame = encode_message(body)?;
        self.send(&frame).await
    }

    /// Send a stream tag, an optional 8-byte little-endian size header, and
    /// everything readable from `body`, as one uninterrupted write.
    /// Returns the number of body bytes sent.
    pub async fn send_stream<R>(&self, size: Option<i64>, body: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut w = self.writer.lock().await;
        let mut header = Vec::with_capacity(9);
        header.push(INCOMING_STREAM);
        if let Some(size) = size {
            header.extend_from_slice(&size.to_le_bytes());
        }
        w.write_all(&header)
            .await
            .with_context(|| format!("writing stream header to {}", self.remote_addr))?;
        let n = tokio::io::copy(body, &mut *w)
            .await
            .with_context(|| format!("streaming to {}", self.remote_addr))?;
        w.flush().await?;
        Ok(n)
    }

    /// Wait for the next stream announced on this connection and take
    /// exclusive read access to it. The receive loop stays paused until the
    /// returned reader is dropped.
    ///
    /// Fails if the connection closes first.
    pub async fn read_stream(&self) -> Result<StreamReader<'_>> {
        let permit = self
            .stream_ready
            .acquire()
            .await
            .map_err(|_| anyhow::anyhow!("peer {} disconnected", self.remote_addr))?;
        let reader = self.reader.lock().await;
        // Only consume the announcement once the reader is ours; dropping this
        // future earlier hands the permit back.
        permit.forget();
        Ok(StreamReader {
            reader,
            done: &self.stream_done,
        })
    }

    /// Stop the receive loop and wake every task waiting on this
    /// connection's streams with an error.
    pub fn close(&self) {
        self.closed.cancel();
        self.stream_ready.close();
        self.stream_done.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) async fn wait_closed(&self) {
        self.closed.cancelled().await
    }

    pub(crate) async fn lock_reader(&self) -> MutexGuard<'_, BufReader<OwnedReadHalf>> {
        self.reader.lock().await
    }

    pub(crate) fn announce_stream(&self) {
        self.stream_ready.add_permits(1);
    }

    pub(crate) async fn wait_stream_released(&self) -> Result<()> {
        self.stream_done
            .acquire()
            .await
            .map(|permit| permit.forget())
            .map_err(|_| anyhow::anyhow!("peer {} closed while streaming", self.remote_addr))
    }

    /// Best-effort FIN to the remote side; skipped if a write is in flight.
    pub(crate) async fn shutdown_writer(&self) {
        if let Ok(mut w) = self.writer.try_lock() {
            let _ = w.shutdown().await;
        }
    }
}

impl std::fmt::Debug for TcpPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpPeer")
            .field("remote_addr", &self.remote_addr)
            .field("incoming", &self.incoming)
            .finish()
    }
}

/// Exclusive access to one stream payload on a connection.
///
/// Dropping it (or calling [`release`](Self::release)) lets the connection's
/// receive loop resume.
pub struct StreamReader<'a> {
    reader: MutexGuard<'a, BufReader<OwnedReadHalf>>,
    done: &'a Semaphore,
}

impl StreamReader<'_> {
    pub fn release(self) {}
}

impl AsyncRead for StreamReader<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut *this.reader).poll_read(cx, buf)
    }
}

impl Drop for StreamReader<'_> {
    fn drop(&mut self) {
        self.done.add_permits(1);
    }
}
