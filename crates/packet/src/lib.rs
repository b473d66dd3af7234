//! SPHINX-style packet format and onion transform.
//!
//! Fixed-size packets carrying a routing header, an embedded payment, a
//! payment challenge, and an onion-encrypted message. Every hop performs
//! identical processing, so traffic analysis cannot tell a relayer from the
//! origin or the destination.
//!
//! ```text
//! Packet ─ Header  (alpha ‖ beta ‖ mac)          555 bytes
//!        ─ Transaction (sealed channel update)   146 bytes
//!        ─ Challenge (recoverable signature)      65 bytes
//!        ─ Message (onion-encrypted body)        256 bytes
//! ```

pub mod challenge;
pub mod header;
pub mod message;
pub mod packet;

pub use challenge::{Challenge, CHALLENGE_SIZE};
pub use header::{
    create_header, Header, PeeledHeader, HEADER_SIZE, MAX_HOPS, PER_HOP_SIZE, ROUTING_INFO_SIZE,
};
pub use message::{OnionMessage, MAX_PLAINTEXT_SIZE, MESSAGE_SIZE};
pub use packet::{
    ForwardPacket, HopReceipt, Packet, PacketOutline, Transform, PACKET_SIZE,
};

/// Packet processing errors. All of them are silent drops at the pipeline:
/// adversarial input must not learn which check failed.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("frame is {0} bytes, not the packet size")]
    WrongSize(usize),

    #[error("path has {0} positions")]
    BadPathLength(usize),

    #[error("plaintext of {0} bytes exceeds the message body")]
    MessageTooLong(usize),

    #[error("header MAC mismatch")]
    BadMac,

    #[error("challenge does not bind to this hop")]
    BadChallenge,

    #[error("malformed packet component")]
    Malformed,

    #[error(transparent)]
    Crypto(#[from] crypto::CryptoError),
}
