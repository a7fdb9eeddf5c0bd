//! Connectivity substrate
//!
//! The round machinery is written against the [`Substrate`] trait rather
//! than a socket type, so the production TCP mesh ([`transport::TcpMesh`])
//! and the in-process simulator ([`crate::sim::SimNet`]) are
//! interchangeable underneath a protocol engine.
//!
//! The contract is deliberately small: send one frame to one peer, stream
//! inbound events, and report disconnects. Round semantics (barriers,
//! buffering, timeouts) live above in [`crate::round`].

pub mod messages;
pub mod transport;

use async_trait::async_trait;

use crate::config::ParticipantId;
use messages::WireMessage;

/// Transport-level errors. At round boundaries these escalate to
/// [`crate::error::ProtocolError::RoundTimeout`] naming the lost peer.
#[derive(thiserror::Error, Debug)]
pub enum NetError {
    #[error("substrate configuration error: {0}")]
    Config(String),
    #[error("no connection to participant {peer}")]
    PeerUnreachable { peer: ParticipantId },
    #[error("handshake with {addr} rejected: {reason}")]
    Handshake { addr: String, reason: String },
    #[error("frame of {size} bytes exceeds the frame limit")]
    FrameTooLarge { size: usize },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("mesh establishment timed out with {connected} of {expected} peers connected")]
    MeshTimeout { connected: usize, expected: usize },
}

/// An inbound event from the substrate.
#[derive(Debug, Clone)]
pub enum SubstrateEvent {
    /// A frame arrived from a peer.
    Frame {
        from: ParticipantId,
        message: WireMessage,
    },
    /// The channel to a peer is gone. Rounds still expecting the peer
    /// fail immediately instead of waiting out their timeout.
    Disconnected(ParticipantId),
}

/// Point-to-point frame delivery between group members.
///
/// Implementations own their connections and surface inbound traffic as a
/// single ordered event stream. Delivery is reliable and ordered per pair
/// while the channel lives; there is no delivery guarantee across a
/// disconnect, which is why disconnects are events.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// The participant this substrate endpoint belongs to.
    fn local_id(&self) -> ParticipantId;

    /// Sends one frame to one peer.
    async fn send(&self, to: ParticipantId, message: WireMessage) -> Result<(), NetError>;

    /// Next inbound event; `None` once the substrate is shut down.
    async fn next_event(&self) -> Option<SubstrateEvent>;
}
