//! scatter-p2p: TCP peer transport
//!
//! Every connection carries two kinds of traffic, distinguished by a leading
//! tag byte:
//!
//! ```text
//! 0x1 [u16 LE length][body]   control frame, delivered to the inbound queue
//! 0x2 [raw bytes ...]         stream, read directly by the protocol layer
//! ```
//!
//! When the receive loop sees a stream tag it queues a stream marker behind
//! the control frames already delivered, stops reading, and hands the
//! connection to whoever claims the stream ([`TcpPeer::read_stream`]). It
//! resumes only after that claim is released, so a control frame is never
//! decoded out of the middle of a payload, and the consumer can tell which
//! exchange a stream belongs to from its position in the queue.

pub mod frame;
pub mod handshake;
pub mod peer;
pub mod transport;

pub use frame::{
    encode_message, read_size_header, Decoder, DefaultDecoder, Frame, Rpc, INCOMING_MESSAGE,
    INCOMING_STREAM, SIZE_ABSENT,
};
pub use handshake::{nop_handshake, HandshakeFn};
pub use peer::{StreamReader, TcpPeer};
pub use transport::{OnDisconnectFn, OnPeerFn, TcpTransport, TcpTransportOpts};
