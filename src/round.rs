//! Round coordination
//!
//! Keeps a group in lockstep across a run of synchronous rounds. A run
//! opens with a barrier agreeing on run id, protocol kind and
//! configuration digest before any key material is touched, proceeds
//! through numbered value-exchange rounds, and closes with a strict
//! finish barrier so no participant starts the next run while another is
//! still inside this one.
//!
//! Peers progress at different speeds, so frames for the current run's
//! later rounds and for the next run are buffered until asked for.
//! Anything staler is dropped. A peer that disconnects or refuses a send
//! is dead for the rest of the session; every barrier still expecting it
//! fails immediately instead of waiting out the timeout.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::bits::Bits;
use crate::config::{ConfigDigest, GroupConfig, ParticipantId};
use crate::error::ProtocolError;
use crate::net::messages::{ProtocolKind, WireMessage};
use crate::net::{Substrate, SubstrateEvent};

/// Who a round's contribution is sent to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundMode {
    /// Everyone sends to everyone and combines the full set.
    Broadcast,
    /// Everyone sends to the collector only. Other participants finish
    /// the round immediately with no values.
    Collect(ParticipantId),
}

/// Values received for one round, keyed by contributor. Duplicates keep
/// the first arrival; a value of the wrong width counts as missing so the
/// timeout report names its sender.
#[derive(Debug, Default)]
struct RoundBuffer {
    values: HashMap<ParticipantId, Bits>,
}

impl RoundBuffer {
    fn insert(&mut self, from: ParticipantId, value: Bits) {
        if self.values.contains_key(&from) {
            warn!(from, "duplicate round value dropped");
            return;
        }
        self.values.insert(from, value);
    }

    fn missing(&self, expected: &BTreeSet<ParticipantId>, width: usize) -> Vec<ParticipantId> {
        expected
            .iter()
            .copied()
            .filter(|peer| self.values.get(peer).map_or(true, |v| v.len() != width))
            .collect()
    }

    fn into_values(self) -> HashMap<ParticipantId, Bits> {
        self.values
    }
}

enum Pump {
    Absorbed,
    Exhausted,
}

/// Drives one participant through run and round barriers on top of a
/// [`Substrate`]. One coordinator per participant; one run in flight at a
/// time.
pub struct RoundCoordinator {
    substrate: Arc<dyn Substrate>,
    config: Arc<GroupConfig>,
    local: ParticipantId,
    round_timeout: Duration,
    current_run: u64,
    dead: BTreeSet<ParticipantId>,
    pending_opens: HashMap<u64, HashMap<ParticipantId, (ProtocolKind, ConfigDigest)>>,
    pending_values: HashMap<(u64, u64), RoundBuffer>,
    pending_finishes: HashMap<u64, BTreeSet<ParticipantId>>,
}

impl RoundCoordinator {
    pub fn new(
        substrate: Arc<dyn Substrate>,
        config: Arc<GroupConfig>,
        round_timeout: Duration,
    ) -> Result<Self, ProtocolError> {
        let local = substrate.local_id();
        if !config.contains(local) {
            return Err(ProtocolError::InvalidParameter(format!(
                "participant {local} is not a group member"
            )));
        }
        Ok(RoundCoordinator {
            substrate,
            config,
            local,
            round_timeout,
            current_run: 0,
            dead: BTreeSet::new(),
            pending_opens: HashMap::new(),
            pending_values: HashMap::new(),
            pending_finishes: HashMap::new(),
        })
    }

    pub fn local_id(&self) -> ParticipantId {
        self.local
    }

    /// Opens a run: announces `(run_id, kind, digest)` to every peer and
    /// waits until every peer has announced the same. Completion means
    /// the whole group is committed to the same protocol over the same
    /// configuration, so key material consumed afterwards stays aligned.
    pub async fn open_run(&mut self, run_id: u64, kind: ProtocolKind) -> Result<(), ProtocolError> {
        self.current_run = run_id;
        self.pending_opens.retain(|&run, _| run >= run_id);
        self.pending_values.retain(|&(run, _), _| run >= run_id);
        self.pending_finishes.retain(|&run, _| run >= run_id);

        let digest = self.config.digest();
        debug!(participant = self.local, run_id, kind = %kind, "opening run");
        for peer in self.config.peers_of(self.local) {
            self.send_or_mark(
                peer,
                WireMessage::RunOpen {
                    run_id,
                    kind,
                    digest,
                },
            )
            .await;
        }

        let expected = self.expected_peers();
        let deadline = Instant::now() + self.round_timeout;
        loop {
            if let Some(opens) = self.pending_opens.get(&run_id) {
                for (&peer, &(peer_kind, peer_digest)) in opens {
                    if peer_digest != digest || peer_kind != kind {
                        return Err(ProtocolError::ConfigMismatch { peer });
                    }
                }
            }
            let arrived = self.pending_opens.get(&run_id);
            let missing: Vec<ParticipantId> = expected
                .iter()
                .copied()
                .filter(|peer| arrived.map_or(true, |opens| !opens.contains_key(peer)))
                .collect();
            if missing.is_empty() {
                return Ok(());
            }
            if let Some(err) = self.dead_among(0, &missing) {
                return Err(err);
            }
            if let Pump::Exhausted = self.pump(deadline).await {
                return Err(ProtocolError::RoundTimeout { round: 0, missing });
            }
        }
    }

    /// Runs one value-exchange round and returns the peers' contributions
    /// keyed by sender. The local contribution is not included.
    ///
    /// In [`RoundMode::Collect`] mode only the collector waits; everyone
    /// else sends and returns an empty map at once, so a spectator may
    /// run many rounds ahead of the collector.
    pub async fn exchange(
        &mut self,
        run_id: u64,
        round: u64,
        value: Bits,
        mode: RoundMode,
    ) -> Result<HashMap<ParticipantId, Bits>, ProtocolError> {
        let width = value.len();
        match mode {
            RoundMode::Broadcast => {
                for peer in self.config.peers_of(self.local) {
                    self.send_or_mark(
                        peer,
                        WireMessage::RoundValue {
                            run_id,
                            round,
                            value: value.clone(),
                        },
                    )
                    .await;
                }
                self.await_values(run_id, round, width).await
            }
            RoundMode::Collect(collector) if collector == self.local => {
                self.await_values(run_id, round, width).await
            }
            RoundMode::Collect(collector) => {
                self.send_or_mark(
                    collector,
                    WireMessage::RoundValue {
                        run_id,
                        round,
                        value,
                    },
                )
                .await;
                Ok(HashMap::new())
            }
        }
    }

    /// Closes a run. Strict: waits until every peer has also finished, so
    /// run `run_id + 1` cannot open anywhere before run `run_id` is over
    /// everywhere. `final_round` only labels the timeout report.
    pub async fn finish_run(
        &mut self,
        run_id: u64,
        final_round: u64,
    ) -> Result<(), ProtocolError> {
        for peer in self.config.peers_of(self.local) {
            self.send_or_mark(peer, WireMessage::RunFinished { run_id })
                .await;
        }

        let expected = self.expected_peers();
        let deadline = Instant::now() + self.round_timeout;
        loop {
            let arrived = self.pending_finishes.get(&run_id);
            let missing: Vec<ParticipantId> = expected
                .iter()
                .copied()
                .filter(|peer| arrived.map_or(true, |set| !set.contains(peer)))
                .collect();
            if missing.is_empty() {
                self.pending_finishes.remove(&run_id);
                self.pending_opens.retain(|&run, _| run > run_id);
                self.pending_values.retain(|&(run, _), _| run > run_id);
                debug!(participant = self.local, run_id, "run finished");
                return Ok(());
            }
            if let Some(err) = self.dead_among(final_round, &missing) {
                return Err(err);
            }
            if let Pump::Exhausted = self.pump(deadline).await {
                return Err(ProtocolError::RoundTimeout {
                    round: final_round,
                    missing,
                });
            }
        }
    }

    fn expected_peers(&self) -> BTreeSet<ParticipantId> {
        self.config.peers_of(self.local).into_iter().collect()
    }

    /// A missing peer already marked dead will never arrive, so the
    /// barrier fails now instead of waiting out the deadline.
    fn dead_among(&self, round: u64, missing: &[ParticipantId]) -> Option<ProtocolError> {
        let dead: Vec<ParticipantId> = missing
            .iter()
            .copied()
            .filter(|peer| self.dead.contains(peer))
            .collect();
        if dead.is_empty() {
            None
        } else {
            Some(ProtocolError::RoundTimeout {
                round,
                missing: dead,
            })
        }
    }

    async fn await_values(
        &mut self,
        run_id: u64,
        round: u64,
        width: usize,
    ) -> Result<HashMap<ParticipantId, Bits>, ProtocolError> {
        let expected = self.expected_peers();
        let deadline = Instant::now() + self.round_timeout;
        loop {
            let missing = match self.pending_values.get(&(run_id, round)) {
                Some(buffer) => buffer.missing(&expected, width),
                None => expected.iter().copied().collect(),
            };
            if missing.is_empty() {
                let buffer = self.pending_values.remove(&(run_id, round));
                return Ok(buffer.map(RoundBuffer::into_values).unwrap_or_default());
            }
            if let Some(err) = self.dead_among(round, &missing) {
                return Err(err);
            }
            if let Pump::Exhausted = self.pump(deadline).await {
                return Err(ProtocolError::RoundTimeout { round, missing });
            }
        }
    }

    async fn send_or_mark(&mut self, to: ParticipantId, message: WireMessage) {
        if self.dead.contains(&to) {
            return;
        }
        if let Err(err) = self.substrate.send(to, message).await {
            warn!(peer = to, error = %err, "send failed, marking peer dead");
            self.dead.insert(to);
        }
    }

    /// Waits for one inbound event up to `deadline` and files it away.
    async fn pump(&mut self, deadline: Instant) -> Pump {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Pump::Exhausted;
        }
        match time::timeout(remaining, self.substrate.next_event()).await {
            Ok(Some(event)) => {
                self.absorb(event);
                Pump::Absorbed
            }
            Ok(None) => Pump::Exhausted,
            Err(_) => Pump::Exhausted,
        }
    }

    fn absorb(&mut self, event: SubstrateEvent) {
        let (from, message) = match event {
            SubstrateEvent::Disconnected(peer) => {
                warn!(peer, "peer disconnected");
                self.dead.insert(peer);
                return;
            }
            SubstrateEvent::Frame { from, message } => (from, message),
        };
        if !self.config.contains(from) {
            warn!(from, "frame from unknown participant dropped");
            return;
        }
        let run_id = message.run_id();
        if run_id < self.current_run {
            debug!(from, run_id, label = message.label(), "stale frame dropped");
            return;
        }
        // The finish barrier keeps peers within one run of each other.
        if run_id > self.current_run + 1 {
            warn!(
                from,
                run_id,
                current_run = self.current_run,
                "frame beyond the next run dropped"
            );
            return;
        }
        match message {
            WireMessage::RunOpen {
                run_id,
                kind,
                digest,
            } => {
                self.pending_opens
                    .entry(run_id)
                    .or_default()
                    .entry(from)
                    .or_insert((kind, digest));
            }
            WireMessage::RoundValue {
                run_id,
                round,
                value,
            } => {
                self.pending_values
                    .entry((run_id, round))
                    .or_default()
                    .insert(from, value);
            }
            WireMessage::RunFinished { run_id } => {
                self.pending_finishes.entry(run_id).or_default().insert(from);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimNet, SimSubstrate};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn config(ids: &[ParticipantId]) -> Arc<GroupConfig> {
        Arc::new(GroupConfig::new(ids.iter().copied(), 16, 5).unwrap())
    }

    fn coordinator(
        substrate: SimSubstrate,
        config: &Arc<GroupConfig>,
        timeout: Duration,
    ) -> RoundCoordinator {
        RoundCoordinator::new(Arc::new(substrate), config.clone(), timeout).unwrap()
    }

    #[test]
    fn buffer_reports_wrong_width_as_missing() {
        let mut buffer = RoundBuffer::default();
        let expected: BTreeSet<ParticipantId> = [1, 2, 3].into_iter().collect();
        buffer.insert(1, Bits::zeros(8));
        buffer.insert(2, Bits::zeros(7));
        assert_eq!(buffer.missing(&expected, 8), vec![2, 3]);
        buffer.insert(3, Bits::zeros(8));
        assert_eq!(buffer.missing(&expected, 8), vec![2]);
    }

    #[test]
    fn buffer_keeps_the_first_duplicate() {
        let mut buffer = RoundBuffer::default();
        buffer.insert(1, Bits::zeros(4));
        buffer.insert(1, Bits::from_bytes(&[0xFF]).prefix(4));
        assert_eq!(buffer.into_values()[&1], Bits::zeros(4));
    }

    #[tokio::test]
    async fn broadcast_round_full_cycle() {
        let ids = [1, 2, 3];
        let config = config(&ids);
        let (_net, subs) = SimNet::full_mesh(&config);
        let mut subs = subs.into_iter();

        let mut futures = Vec::new();
        for id in ids {
            let substrate = subs.next().unwrap();
            let config = config.clone();
            futures.push(async move {
                let mut coord = coordinator(substrate, &config, TIMEOUT);
                coord.open_run(0, ProtocolKind::Veto).await?;
                let value = Bits::from_bytes(&[id as u8 * 0x11]);
                let got = coord.exchange(0, 0, value, RoundMode::Broadcast).await?;
                coord.finish_run(0, 1).await?;
                Ok::<_, ProtocolError>(got)
            });
        }
        let mut futures = futures.into_iter();
        let (r1, r2, r3) = tokio::join!(
            futures.next().unwrap(),
            futures.next().unwrap(),
            futures.next().unwrap(),
        );
        let (r1, r2, r3) = (r1.unwrap(), r2.unwrap(), r3.unwrap());

        assert_eq!(r1[&2], Bits::from_bytes(&[0x22]));
        assert_eq!(r1[&3], Bits::from_bytes(&[0x33]));
        assert_eq!(r2[&1], Bits::from_bytes(&[0x11]));
        assert_eq!(r2[&3], Bits::from_bytes(&[0x33]));
        assert_eq!(r3[&1], Bits::from_bytes(&[0x11]));
        assert_eq!(r3[&2], Bits::from_bytes(&[0x22]));
    }

    #[tokio::test]
    async fn collect_round_reaches_only_the_collector() {
        let ids = [1, 2, 3];
        let config = config(&ids);
        let (_net, subs) = SimNet::full_mesh(&config);
        let mut subs = subs.into_iter();

        let mut futures = Vec::new();
        for id in ids {
            let substrate = subs.next().unwrap();
            let config = config.clone();
            futures.push(async move {
                let mut coord = coordinator(substrate, &config, TIMEOUT);
                coord.open_run(0, ProtocolKind::Notification).await?;
                let value = Bits::from_bytes(&[id as u8]);
                let got = coord
                    .exchange(0, 0, value, RoundMode::Collect(2))
                    .await?;
                coord.finish_run(0, 1).await?;
                Ok::<_, ProtocolError>(got)
            });
        }
        let mut futures = futures.into_iter();
        let (r1, r2, r3) = tokio::join!(
            futures.next().unwrap(),
            futures.next().unwrap(),
            futures.next().unwrap(),
        );
        let (r1, r2, r3) = (r1.unwrap(), r2.unwrap(), r3.unwrap());

        assert!(r1.is_empty());
        assert!(r3.is_empty());
        assert_eq!(r2[&1], Bits::from_bytes(&[1]));
        assert_eq!(r2[&3], Bits::from_bytes(&[3]));
    }

    #[tokio::test]
    async fn spectator_may_run_ahead_of_the_collector() {
        let ids = [1, 2];
        let config = config(&ids);
        let (_net, subs) = SimNet::full_mesh(&config);
        let mut subs = subs.into_iter();
        let (s1, s2) = (subs.next().unwrap(), subs.next().unwrap());

        let collector = async {
            let mut coord = coordinator(s1, &config, TIMEOUT);
            coord.open_run(0, ProtocolKind::Notification).await?;
            let mut got = Vec::new();
            for round in 0..3u64 {
                // Fall behind on purpose; the values must be waiting.
                time::sleep(Duration::from_millis(20)).await;
                let received = coord
                    .exchange(0, round, Bits::zeros(8), RoundMode::Collect(1))
                    .await?;
                got.push(received[&2].clone());
            }
            coord.finish_run(0, 3).await?;
            Ok::<_, ProtocolError>(got)
        };
        let spectator = async {
            let mut coord = coordinator(s2, &config, TIMEOUT);
            coord.open_run(0, ProtocolKind::Notification).await?;
            for round in 0..3u64 {
                let value = Bits::from_bytes(&[round as u8 + 1]);
                let empty = coord.exchange(0, round, value, RoundMode::Collect(1)).await?;
                assert!(empty.is_empty());
            }
            coord.finish_run(0, 3).await?;
            Ok::<_, ProtocolError>(())
        };

        let (collected, raced) = tokio::join!(collector, spectator);
        raced.unwrap();
        let collected = collected.unwrap();
        for (round, value) in collected.iter().enumerate() {
            assert_eq!(*value, Bits::from_bytes(&[round as u8 + 1]));
        }
    }

    #[tokio::test]
    async fn open_barrier_times_out_naming_the_absentee() {
        let ids = [1, 2];
        let config = config(&ids);
        let (_net, subs) = SimNet::full_mesh(&config);
        let mut subs = subs.into_iter();
        let s1 = subs.next().unwrap();
        let _s2 = subs.next().unwrap();

        let mut coord = coordinator(s1, &config, Duration::from_millis(100));
        match coord.open_run(0, ProtocolKind::Veto).await {
            Err(ProtocolError::RoundTimeout { round: 0, missing }) => {
                assert_eq!(missing, vec![2]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnected_peer_fails_the_barrier_fast() {
        let ids = [1, 2, 3];
        let config = config(&ids);
        let (net, subs) = SimNet::full_mesh(&config);
        let mut subs = subs.into_iter();
        let s1 = subs.next().unwrap();

        net.disconnect(3);
        let mut coord = coordinator(s1, &config, TIMEOUT);
        let result = time::timeout(Duration::from_secs(1), coord.open_run(0, ProtocolKind::Veto))
            .await
            .ok()
            .unwrap_or_else(|| panic!("barrier did not fail fast"));
        match result {
            Err(ProtocolError::RoundTimeout { missing, .. }) => {
                assert_eq!(missing, vec![3]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn mismatched_configurations_abort_the_open() {
        let ids = [1, 2];
        let config_a = config(&ids);
        let config_b = Arc::new(GroupConfig::new(ids.iter().copied(), 16, 8).unwrap());
        let (_net, subs) = SimNet::full_mesh(&config_a);
        let mut subs = subs.into_iter();
        let (s1, s2) = (subs.next().unwrap(), subs.next().unwrap());

        let a = async {
            let mut coord = coordinator(s1, &config_a, Duration::from_secs(1));
            coord.open_run(0, ProtocolKind::Veto).await
        };
        let b = async {
            let mut coord = coordinator(s2, &config_b, Duration::from_secs(1));
            coord.open_run(0, ProtocolKind::Veto).await
        };
        let (ra, rb) = tokio::join!(a, b);
        assert!(matches!(
            ra,
            Err(ProtocolError::ConfigMismatch { peer: 2 })
        ));
        assert!(matches!(
            rb,
            Err(ProtocolError::ConfigMismatch { peer: 1 })
        ));
    }
}
