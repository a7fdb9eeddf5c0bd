//! Session provisioning
//!
//! Pad material comes from a key-agreement step outside the protocols
//! themselves. This module is the demonstration provisioner: both ends
//! of every pair expand a shared session seed into the identical pad
//! stream, keyed by the unordered pair of participant ids. A real
//! deployment installs pads from its own key agreement through
//! [`PadStore::install`]; nothing downstream cares where the bits came
//! from, only that both ends hold the same ones in the same order.

use blake2::{Blake2b512, Digest};
use rand::rngs::StdRng;
use rand::SeedableRng;
use zeroize::Zeroize;

use crate::bits::Bits;
use crate::config::ParticipantId;
use crate::error::ProtocolError;
use crate::net::messages::ProtocolKind;
use crate::pads::{PadStore, PairwisePad};

/// Installs `per_peer` fresh pads for every peer of the store's
/// participant. The stream for a pair depends only on the session seed
/// and the unordered pair of ids, so both ends derive the same pads in
/// the same order.
pub fn install_session_pads(
    store: &PadStore,
    session_seed: u64,
    per_peer: usize,
) -> Result<(), ProtocolError> {
    let config = store.config();
    let local = store.local();
    let width = config.codeword_len();
    for peer in config.peers_of(local) {
        let mut rng = pair_rng(session_seed, local, peer);
        for _ in 0..per_peer {
            store.install(peer, PairwisePad::new(Bits::random(width, &mut rng)))?;
        }
    }
    Ok(())
}

/// Worst-case pads consumed per peer by one run of `kind`. Veto phases
/// may exit early, so the actual draw is often lower.
pub fn pads_required(kind: ProtocolKind, group_size: usize, security: u32) -> usize {
    let beta = security as usize;
    match kind {
        ProtocolKind::Transmission => 1,
        ProtocolKind::Veto => beta,
        ProtocolKind::CollisionDetection => 2 * beta,
        ProtocolKind::Notification => group_size * beta,
        ProtocolKind::MessageExchange => 3 * beta + group_size * beta + 1,
    }
}

fn pair_rng(session_seed: u64, a: ParticipantId, b: ParticipantId) -> StdRng {
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    let mut hasher = Blake2b512::new();
    hasher.update(session_seed.to_be_bytes());
    hasher.update(lo.to_be_bytes());
    hasher.update(hi.to_be_bytes());
    let digest = hasher.finalize();
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&digest[..32]);
    let rng = StdRng::from_seed(seed);
    seed.zeroize();
    rng
}
