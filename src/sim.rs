//! In-process substrate simulator
//!
//! [`SimNet`] wires one [`SimSubstrate`] per group member through shared
//! in-memory inboxes, so multi-party runs execute inside a single test
//! process with no sockets. The net injects the failures the protocols
//! must survive: a silenced peer whose frames vanish in transit, a
//! disconnected peer, and a single flipped bit on a chosen link.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::config::{GroupConfig, ParticipantId};
use crate::net::messages::WireMessage;
use crate::net::{NetError, Substrate, SubstrateEvent};

/// One-shot bit flip armed for the next round value on a link.
struct BitTap {
    from: ParticipantId,
    to: ParticipantId,
    bit: usize,
}

struct SimInner {
    inboxes: std::sync::Mutex<HashMap<ParticipantId, mpsc::UnboundedSender<SubstrateEvent>>>,
    dropped: std::sync::Mutex<HashSet<ParticipantId>>,
    silenced: std::sync::Mutex<HashSet<ParticipantId>>,
    taps: std::sync::Mutex<Vec<BitTap>>,
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Control handle over a simulated group network.
pub struct SimNet {
    inner: Arc<SimInner>,
}

impl SimNet {
    /// Builds a fully-connected net with one substrate endpoint per group
    /// member, returned in ascending id order.
    pub fn full_mesh(config: &GroupConfig) -> (SimNet, Vec<SimSubstrate>) {
        let inner = Arc::new(SimInner {
            inboxes: std::sync::Mutex::new(HashMap::new()),
            dropped: std::sync::Mutex::new(HashSet::new()),
            silenced: std::sync::Mutex::new(HashSet::new()),
            taps: std::sync::Mutex::new(Vec::new()),
        });
        let mut endpoints = Vec::with_capacity(config.group_size());
        for id in config.participants() {
            let (tx, rx) = mpsc::unbounded_channel();
            lock(&inner.inboxes).insert(id, tx);
            endpoints.push(SimSubstrate {
                local: id,
                inner: inner.clone(),
                events: Mutex::new(rx),
            });
        }
        (SimNet { inner }, endpoints)
    }

    /// Drops every frame `id` sends from here on. Sends still report
    /// success, so `id` believes it is participating.
    pub fn silence(&self, id: ParticipantId) {
        lock(&self.inner.silenced).insert(id);
    }

    /// Removes `id` from the net. Every other member receives a
    /// [`SubstrateEvent::Disconnected`] and further traffic to or from
    /// `id` fails with [`NetError::PeerUnreachable`].
    pub fn disconnect(&self, id: ParticipantId) {
        let mut inboxes = lock(&self.inner.inboxes);
        if inboxes.remove(&id).is_none() {
            return;
        }
        lock(&self.inner.dropped).insert(id);
        for tx in inboxes.values() {
            let _ = tx.send(SubstrateEvent::Disconnected(id));
        }
    }

    /// Arms a one-shot flip of `bit` in the next round value `from` sends
    /// to `to`. Subsequent frames on the link pass untouched.
    pub fn tamper_bit(&self, from: ParticipantId, to: ParticipantId, bit: usize) {
        lock(&self.inner.taps).push(BitTap { from, to, bit });
    }
}

/// One member's endpoint in a [`SimNet`].
pub struct SimSubstrate {
    local: ParticipantId,
    inner: Arc<SimInner>,
    events: Mutex<mpsc::UnboundedReceiver<SubstrateEvent>>,
}

#[async_trait::async_trait]
impl Substrate for SimSubstrate {
    fn local_id(&self) -> ParticipantId {
        self.local
    }

    async fn send(&self, to: ParticipantId, mut message: WireMessage) -> Result<(), NetError> {
        {
            let dropped = lock(&self.inner.dropped);
            if dropped.contains(&self.local) || dropped.contains(&to) {
                return Err(NetError::PeerUnreachable { peer: to });
            }
        }
        if lock(&self.inner.silenced).contains(&self.local) {
            return Ok(());
        }
        if let WireMessage::RoundValue { ref mut value, .. } = message {
            let mut taps = lock(&self.inner.taps);
            if let Some(pos) = taps
                .iter()
                .position(|tap| tap.from == self.local && tap.to == to)
            {
                let tap = taps.remove(pos);
                if tap.bit < value.len() {
                    value.set_bit(tap.bit, !value.bit(tap.bit));
                }
            }
        }
        let tx = lock(&self.inner.inboxes)
            .get(&to)
            .cloned()
            .ok_or(NetError::PeerUnreachable { peer: to })?;
        tx.send(SubstrateEvent::Frame {
            from: self.local,
            message,
        })
        .map_err(|_| NetError::PeerUnreachable { peer: to })
    }

    async fn next_event(&self) -> Option<SubstrateEvent> {
        self.events.lock().await.recv().await
    }
}
