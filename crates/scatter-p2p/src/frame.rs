//! Frame tags, the inbound control-frame type, and the pluggable decoder

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use scatter_core::{ScatterError, MAX_FRAME_SIZE};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Tag byte: a length-prefixed control frame follows.
pub const INCOMING_MESSAGE: u8 = 0x1;
/// Tag byte: raw stream bytes follow.
pub const INCOMING_STREAM: u8 = 0x2;

/// Size header value meaning "the sender does not have the requested blob".
pub const SIZE_ABSENT: i64 = -1;

/// One decoded unit from a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message(Bytes),
    Stream,
}

/// One item on the inbound queue, tagged with its sender.
///
/// Control frames and stream markers share the queue so a consumer sees them
/// in wire order per connection.
#[derive(Debug, Clone)]
pub struct Rpc {
    pub from: SocketAddr,
    pub payload: Bytes,
    /// Set for a stream marker: `payload` is empty and the stream bytes must
    /// be claimed with [`TcpPeer::read_stream`](crate::TcpPeer::read_stream).
    pub stream: bool,
}

impl Rpc {
    pub fn message(from: SocketAddr, payload: Bytes) -> Self {
        Rpc {
            from,
            payload,
            stream: false,
        }
    }

    pub fn stream_marker(from: SocketAddr) -> Self {
        Rpc {
            from,
            payload: Bytes::new(),
            stream: true,
        }
    }
}

/// Reads the next frame off a connection.
///
/// Implementations must consume exactly one frame header (and, for control
/// frames, the body) and nothing beyond it: bytes after a stream tag belong
/// to the protocol layer.
pub trait Decoder: Send + Sync + 'static {
    fn decode<'a>(
        &'a self,
        reader: &'a mut (dyn AsyncRead + Unpin + Send),
    ) -> BoxFuture<'a, Result<Frame>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDecoder;

impl Decoder for DefaultDecoder {
    fn decode<'a>(
        &'a self,
        reader: &'a mut (dyn AsyncRead + Unpin + Send),
    ) -> BoxFuture<'a, Result<Frame>> {
        Box::pin(async move {
            let tag = reader.read_u8().await.context("reading frame tag")?;
            match tag {
                INCOMING_STREAM => Ok(Frame::Stream),
                INCOMING_MESSAGE => {
                    let len = reader
                        .read_u16_le()
                        .await
                        .context("reading frame length")? as usize;
                    if len > MAX_FRAME_SIZE {
                        return Err(ScatterError::FrameTooLarge {
                            size: len,
                            max: MAX_FRAME_SIZE,
                        }
                        .into());
                    }
                    let mut body = vec![0u8; len];
                    reader
                        .read_exact(&mut body)
                        .await
                        .context("reading frame body")?;
                    Ok(Frame::Message(Bytes::from(body)))
                }
                other => Err(ScatterError::Decode(format!("unknown frame tag {other:#04x}")).into()),
            }
        })
    }
}

/// Encode `body` as a complete control frame (tag, length, body).
pub fn encode_message(body: &[u8]) -> Result<Vec<u8>> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(ScatterError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        }
        .into());
    }
    let mut frame = Vec::with_capacity(3 + body.len());
    frame.push(INCOMING_MESSAGE);
    frame.extend_from_slice(&(body.len() as u16).to_le_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Read the 8-byte little-endian size header that opens a reply stream.
pub async fn read_size_header<R>(reader: &mut R) -> Result<i64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    reader.read_i64_le().await.context("reading size header")
}
