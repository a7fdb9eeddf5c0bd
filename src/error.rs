//! Protocol error taxonomy
//!
//! Every failure a protocol run can surface is one of these variants;
//! callers never see a panic from non-test code. A tampered payload is
//! deliberately *not* an error: tamper detection is a successful protocol
//! outcome (see [`crate::amd::Decoded`]).

use crate::config::ParticipantId;
use crate::net::NetError;

/// Errors surfaced by protocol runs and the round machinery beneath them.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    /// A peer presented a different group configuration. Fatal for the
    /// session; raised before any round runs or pad is consumed.
    #[error("group configuration mismatch with participant {peer}")]
    ConfigMismatch { peer: ParticipantId },

    /// No unconsumed pairwise pad is left for a peer the next round needs.
    #[error("pairwise key material exhausted for participant {peer}")]
    KeyExhausted { peer: ParticipantId },

    /// A round barrier did not complete within the configured bound.
    /// `missing` names the participants whose values never arrived,
    /// including peers whose channel failed mid-run
    /// ([`crate::net::NetError::PeerUnreachable`] never stalls a barrier;
    /// it fails it immediately under this variant).
    #[error("round {round} timed out waiting for participants {missing:?}")]
    RoundTimeout {
        round: u64,
        missing: Vec<ParticipantId>,
    },

    /// A caller-supplied value violates the input contract.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A codeword handed to the codec has the wrong length.
    #[error("codeword is {got} bits, expected {expected}")]
    CodewordLength { expected: usize, got: usize },

    /// Transport-level failure from the connectivity substrate.
    #[error("network error: {0}")]
    Net(#[from] NetError),
}
