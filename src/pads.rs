//! Pairwise one-time pads
//!
//! Anonymity rests on every unordered participant pair {i, j} sharing
//! secret pads that are used exactly once: each pad enters the grand XOR
//! twice (once from i, once from j) and cancels, so a pad that is ever
//! reused links two broadcasts and breaks the anonymity set.
//!
//! Single use is structural, not checked: claiming a pad moves it out of
//! the store, and an aborted run drops (zeroizes) whatever it claimed.
//! Installation is the key-agreement precondition; how pads come to exist
//! is outside this crate (see [`crate::setup`] for the demo provisioner).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::bits::Bits;
use crate::config::{GroupConfig, ParticipantId};
use crate::error::ProtocolError;

/// A single-use pad shared with exactly one peer. Always `codeword_len`
/// bits; rounds narrower than that use a prefix and discard the rest with
/// the pad.
pub struct PairwisePad {
    bits: Bits,
}

impl PairwisePad {
    pub fn new(bits: Bits) -> Self {
        PairwisePad { bits }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// The first `width` bits, the portion one round XORs into its
    /// contribution.
    pub fn prefix(&self, width: usize) -> Bits {
        self.bits.prefix(width)
    }
}

impl Zeroize for PairwisePad {
    fn zeroize(&mut self) {
        self.bits.zeroize();
    }
}

impl ZeroizeOnDrop for PairwisePad {}

impl Drop for PairwisePad {
    fn drop(&mut self) {
        self.zeroize();
    }
}

// Prevent debug output from leaking pad material.
impl std::fmt::Debug for PairwisePad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairwisePad")
            .field("len", &self.bits.len())
            .field("bits", &"[REDACTED]")
            .finish()
    }
}

/// Per-participant store of fresh pads, keyed by peer.
pub struct PadStore {
    config: Arc<GroupConfig>,
    local: ParticipantId,
    pads: Mutex<HashMap<ParticipantId, VecDeque<PairwisePad>>>,
}

impl PadStore {
    /// # Errors
    /// Returns `InvalidParameter` if `local` is not a group member.
    pub fn new(config: Arc<GroupConfig>, local: ParticipantId) -> Result<Self, ProtocolError> {
        if !config.contains(local) {
            return Err(ProtocolError::InvalidParameter(format!(
                "participant {local} is not in the group"
            )));
        }
        Ok(PadStore {
            config,
            local,
            pads: Mutex::new(HashMap::new()),
        })
    }

    /// The participant this store belongs to.
    pub fn local(&self) -> ParticipantId {
        self.local
    }

    pub fn config(&self) -> &Arc<GroupConfig> {
        &self.config
    }

    /// Installs a fresh pad for `peer`. The key-agreement side of the
    /// contract: both ends of the pair install the identical pad.
    ///
    /// # Errors
    /// Returns `InvalidParameter` for non-members, the local participant
    /// itself, or a pad whose length is not the codeword length.
    pub fn install(&self, peer: ParticipantId, pad: PairwisePad) -> Result<(), ProtocolError> {
        if peer == self.local {
            return Err(ProtocolError::InvalidParameter(
                "cannot share a pad with yourself".to_string(),
            ));
        }
        if !self.config.contains(peer) {
            return Err(ProtocolError::InvalidParameter(format!(
                "participant {peer} is not in the group"
            )));
        }
        if pad.len() != self.config.codeword_len() {
            return Err(ProtocolError::InvalidParameter(format!(
                "pad is {} bits, expected the codeword length {}",
                pad.len(),
                self.config.codeword_len()
            )));
        }
        self.lock().entry(peer).or_default().push_back(pad);
        Ok(())
    }

    /// Claims the oldest fresh pad for `peer`, consuming it.
    pub fn take(&self, peer: ParticipantId) -> Result<PairwisePad, ProtocolError> {
        self.lock()
            .get_mut(&peer)
            .and_then(|queue| queue.pop_front())
            .ok_or(ProtocolError::KeyExhausted { peer })
    }

    /// Claims one pad per listed peer, all or nothing: on any shortage the
    /// store is left untouched and the first lacking peer is reported.
    /// Holding the lock across check and claim is what makes concurrent
    /// claims race-free: exactly one contender gets a contested pad.
    pub fn take_for_round(
        &self,
        peers: &[ParticipantId],
    ) -> Result<Vec<(ParticipantId, PairwisePad)>, ProtocolError> {
        let mut pads = self.lock();
        for &peer in peers {
            if pads.get(&peer).map_or(0, VecDeque::len) == 0 {
                return Err(ProtocolError::KeyExhausted { peer });
            }
        }
        let mut claimed = Vec::with_capacity(peers.len());
        for &peer in peers {
            match pads.get_mut(&peer).and_then(VecDeque::pop_front) {
                Some(pad) => claimed.push((peer, pad)),
                // Unreachable while the lock is held: availability was
                // checked above under the same guard.
                None => return Err(ProtocolError::KeyExhausted { peer }),
            }
        }
        Ok(claimed)
    }

    /// Number of fresh pads left for `peer`.
    pub fn available(&self, peer: ParticipantId) -> usize {
        self.lock().get(&peer).map_or(0, VecDeque::len)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ParticipantId, VecDeque<PairwisePad>>> {
        // Recover from a poisoned lock rather than propagating the panic;
        // the map itself is always in a consistent state.
        match self.pads.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for PadStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<ParticipantId, usize> = self
            .lock()
            .iter()
            .map(|(&peer, queue)| (peer, queue.len()))
            .collect();
        f.debug_struct("PadStore")
            .field("local", &self.local)
            .field("fresh", &counts)
            .finish()
    }
}
