//! Group configuration
//!
//! Every participant supplies the identical configuration out of band: the
//! full participant set, the message length L and the security parameter
//! beta. The codeword length is derived, never negotiated. Agreement is
//! checked by exchanging a digest of the canonical encoding at transport
//! handshake and again when a run opens; disagreement is misconfiguration
//! and aborts before any key material is consumed.

use std::collections::BTreeSet;

use blake2::{Blake2b512, Digest};
use serde::{Deserialize, Serialize};

use crate::amd::AmdParams;
use crate::error::ProtocolError;

/// Stable identifier of a participant within a session. Ordering is total
/// and shared by everyone: protocols iterate participants in ascending id
/// order.
pub type ParticipantId = u32;

/// The agreed per-session tuple: membership, message length, security
/// parameter and the derived codeword length.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    participants: BTreeSet<ParticipantId>,
    message_len: usize,
    security: u32,
    codeword_len: usize,
}

impl GroupConfig {
    /// Builds and validates a configuration.
    ///
    /// # Errors
    /// Returns `InvalidParameter` for duplicate ids, fewer than two
    /// participants, or codec parameters the codec cannot support.
    pub fn new(
        participants: impl IntoIterator<Item = ParticipantId>,
        message_len: usize,
        security: u32,
    ) -> Result<Self, ProtocolError> {
        let mut set = BTreeSet::new();
        for id in participants {
            if !set.insert(id) {
                return Err(ProtocolError::InvalidParameter(format!(
                    "duplicate participant id {id}"
                )));
            }
        }
        if set.len() < 2 {
            return Err(ProtocolError::InvalidParameter(format!(
                "a group needs at least two participants, got {}",
                set.len()
            )));
        }

        let params = AmdParams::derive(message_len, security)?;
        Ok(GroupConfig {
            participants: set,
            message_len,
            security,
            codeword_len: params.codeword_len(),
        })
    }

    /// Participants in ascending id order.
    pub fn participants(&self) -> impl Iterator<Item = ParticipantId> + '_ {
        self.participants.iter().copied()
    }

    /// Everyone except `id`, in ascending id order.
    pub fn peers_of(&self, id: ParticipantId) -> Vec<ParticipantId> {
        self.participants().filter(|&peer| peer != id).collect()
    }

    pub fn contains(&self, id: ParticipantId) -> bool {
        self.participants.contains(&id)
    }

    pub fn group_size(&self) -> usize {
        self.participants.len()
    }

    /// Message length L in bits.
    pub fn message_len(&self) -> usize {
        self.message_len
    }

    /// Security parameter beta.
    pub fn security(&self) -> u32 {
        self.security
    }

    /// Codeword (and pad) length L' in bits.
    pub fn codeword_len(&self) -> usize {
        self.codeword_len
    }

    /// The codec parameters for this configuration. Derivation is
    /// deterministic and was validated at construction.
    pub fn amd_params(&self) -> Result<AmdParams, ProtocolError> {
        AmdParams::derive(self.message_len, self.security)
    }

    /// Digest of the canonical encoding, compared at handshake and run
    /// open to detect misconfigured peers.
    pub fn digest(&self) -> ConfigDigest {
        let mut hasher = Blake2b512::new();
        hasher.update((self.participants.len() as u64).to_be_bytes());
        for id in &self.participants {
            hasher.update(id.to_be_bytes());
        }
        hasher.update((self.message_len as u64).to_be_bytes());
        hasher.update(self.security.to_be_bytes());
        hasher.update((self.codeword_len as u64).to_be_bytes());
        let hash = hasher.finalize();

        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hash[..32]);
        ConfigDigest(digest)
    }
}

/// Truncated Blake2b digest of a [`GroupConfig`].
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDigest([u8; 32]);

impl std::fmt::Display for ConfigDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for ConfigDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConfigDigest({}..)", hex::encode(&self.0[..4]))
    }
}
