//! Protocol engine
//!
//! One [`ProtocolEngine`] per participant drives the anonymous
//! communication protocols over a substrate: anonymous transmission,
//! veto, collision detection, notification and the composed message
//! exchange. Every round masks the local contribution with one fresh pad
//! per peer, so each value on the wire is uniformly random on its own;
//! the XOR over all contributions' masked values cancels every pad
//! pairwise and leaves exactly the XOR of the raw contributions.
//!
//! All participants execute the same round schedule in lockstep. Where a
//! protocol's length is data-dependent (the veto early exit, the
//! collision phases) the branch is taken on a group-visible value, so
//! the schedule stays aligned without extra coordination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, MutexGuard};

use crate::amd::{self, AmdParams};
use crate::bits::Bits;
use crate::config::{GroupConfig, ParticipantId};
use crate::error::ProtocolError;
use crate::net::messages::ProtocolKind;
use crate::net::Substrate;
use crate::pads::PadStore;
use crate::round::{RoundCoordinator, RoundMode};
use crate::timing::{RunTiming, TimingSession};

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Per-barrier bound; a peer silent for this long fails the run.
    pub round_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            round_timeout: Duration::from_secs(10),
        }
    }
}

/// Role in an anonymous transmission run.
#[derive(Debug, Clone)]
pub enum TransmissionRole {
    /// Contribute an encoded `message`.
    Sender { message: Bits },
    /// Contribute zeros so the sender's codeword passes through intact.
    Relay,
}

/// What an anonymous transmission run delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message: Bits,
    /// False when the authentication tag failed: the codeword was
    /// manipulated in transit or several participants transmitted at
    /// once. The message must then be discarded.
    pub valid: bool,
}

/// Verdict of a collision-detection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderCount {
    Zero,
    One,
    Many,
}

/// A payload offered to [`ProtocolEngine::run_message_exchange`].
#[derive(Debug, Clone)]
pub struct Outbound {
    pub payload: Bits,
    /// Addressee to tip off before the payload goes out. The payload
    /// itself is readable by the whole group either way.
    pub notify: Option<ParticipantId>,
}

/// Outcome of one composed message-exchange slot. Every participant gets
/// the same variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exchange {
    /// Nobody offered a payload.
    Idle,
    /// More than one sender; nothing was transmitted.
    Collision,
    Delivered {
        message: Bits,
        /// Tag verdict combined with the group confirmation veto.
        valid: bool,
        /// Whether the notification phase addressed this participant.
        addressed_to_me: bool,
    },
}

/// A finished run: its outcome plus the wall-clock span.
#[derive(Debug, Clone)]
pub struct RunReport<T> {
    pub outcome: T,
    pub timing: RunTiming,
}

struct VetoVerdict {
    vetoed: bool,
    /// The local contribution in the round that tripped the veto. Used
    /// by collision detection to separate one sender from several.
    own_bit: bool,
}

/// Drives one participant through protocol runs.
///
/// Runs are numbered locally; the group stays aligned because every
/// member executes the same run sequence and each run opens and closes
/// with a barrier. One run at a time per engine.
pub struct ProtocolEngine {
    config: Arc<GroupConfig>,
    local: ParticipantId,
    pads: Arc<PadStore>,
    params: AmdParams,
    coordinator: Mutex<RoundCoordinator>,
    run_counter: AtomicU64,
}

impl ProtocolEngine {
    /// # Errors
    /// Returns `InvalidParameter` when the substrate's participant is not
    /// a group member or the pad store belongs to a different participant
    /// or configuration.
    pub fn new(
        config: Arc<GroupConfig>,
        pads: Arc<PadStore>,
        substrate: Arc<dyn Substrate>,
        options: EngineOptions,
    ) -> Result<Self, ProtocolError> {
        let local = substrate.local_id();
        if pads.local() != local {
            return Err(ProtocolError::InvalidParameter(format!(
                "pad store belongs to participant {}, the substrate to {local}",
                pads.local()
            )));
        }
        if pads.config().digest() != config.digest() {
            return Err(ProtocolError::InvalidParameter(
                "pad store was provisioned for a different group configuration".to_string(),
            ));
        }
        let params = config.amd_params()?;
        let coordinator =
            RoundCoordinator::new(substrate, config.clone(), options.round_timeout)?;
        Ok(ProtocolEngine {
            config,
            local,
            pads,
            params,
            coordinator: Mutex::new(coordinator),
            run_counter: AtomicU64::new(0),
        })
    }

    pub fn local_id(&self) -> ParticipantId {
        self.local
    }

    pub fn config(&self) -> &Arc<GroupConfig> {
        &self.config
    }

    /// Anonymously transmits one message to the whole group.
    ///
    /// Exactly one participant takes [`TransmissionRole::Sender`] per run;
    /// everyone else relays. Every participant, the sender included,
    /// decodes the same [`Delivery`]. A manipulated codeword surfaces as
    /// `valid == false`; the run itself still completes.
    pub async fn run_transmission(
        &self,
        role: TransmissionRole,
    ) -> Result<RunReport<Delivery>, ProtocolError> {
        let contribution = match role {
            TransmissionRole::Sender { message } => {
                amd::encode(&self.params, &message, &mut rand::rng())?
            }
            TransmissionRole::Relay => Bits::zeros(self.params.codeword_len()),
        };
        let mut ctx = self.begin_run(ProtocolKind::Transmission).await?;
        let combined = ctx.broadcast_round(&contribution).await?;
        let decoded = amd::decode(&self.params, &combined)?;
        let timing = ctx.finish().await?;
        Ok(RunReport {
            outcome: Delivery {
                message: decoded.message,
                valid: decoded.valid,
            },
            timing,
        })
    }

    /// Runs the veto protocol: `true` iff at least one participant vetoed,
    /// with the vetoer staying anonymous. An actual veto goes unseen only
    /// when all `security` rounds cancel, probability at most 2^-security.
    pub async fn run_veto(&self, veto: bool) -> Result<RunReport<bool>, ProtocolError> {
        let mut ctx = self.begin_run(ProtocolKind::Veto).await?;
        let verdict = ctx.veto_rounds(veto).await?;
        let timing = ctx.finish().await?;
        Ok(RunReport {
            outcome: verdict.vetoed,
            timing,
        })
    }

    /// Counts would-be senders anonymously: none, exactly one, or more.
    pub async fn run_collision_detection(
        &self,
        wants_to_send: bool,
    ) -> Result<RunReport<SenderCount>, ProtocolError> {
        let mut ctx = self.begin_run(ProtocolKind::CollisionDetection).await?;
        let outcome = ctx.sender_count(wants_to_send).await?;
        let timing = ctx.finish().await?;
        Ok(RunReport { outcome, timing })
    }

    /// Anonymously notifies one participant. Everyone learns exactly one
    /// bit: whether somebody picked *them*. Only the addressee combines
    /// its rounds, so spectators cannot even tell whether a notification
    /// happened.
    pub async fn run_notification(
        &self,
        notify: Option<ParticipantId>,
    ) -> Result<RunReport<bool>, ProtocolError> {
        self.validate_notify(notify)?;
        let mut ctx = self.begin_run(ProtocolKind::Notification).await?;
        let notified = ctx.notification_rounds(notify).await?;
        let timing = ctx.finish().await?;
        Ok(RunReport {
            outcome: notified,
            timing,
        })
    }

    /// One slot of the composed protocol: a collision gate, then (with a
    /// single sender) notification, anonymous transmission and a closing
    /// group confirmation veto.
    ///
    /// Every participant calls this each slot, passing `None` when it has
    /// nothing to offer. `Delivered { valid: false, .. }` means the
    /// payload was manipulated or several senders slipped through the
    /// gate; such a payload must be discarded.
    pub async fn run_message_exchange(
        &self,
        outbound: Option<Outbound>,
    ) -> Result<RunReport<Exchange>, ProtocolError> {
        let (contribution, notify, wants) = match outbound {
            Some(outbound) => {
                self.validate_notify(outbound.notify)?;
                let codeword = amd::encode(&self.params, &outbound.payload, &mut rand::rng())?;
                (codeword, outbound.notify, true)
            }
            None => (Bits::zeros(self.params.codeword_len()), None, false),
        };

        let mut ctx = self.begin_run(ProtocolKind::MessageExchange).await?;
        let first = ctx.veto_rounds(wants).await?;
        if !first.vetoed {
            let timing = ctx.finish().await?;
            return Ok(RunReport {
                outcome: Exchange::Idle,
                timing,
            });
        }
        let second = ctx.veto_rounds(wants && !first.own_bit).await?;
        if second.vetoed {
            let timing = ctx.finish().await?;
            return Ok(RunReport {
                outcome: Exchange::Collision,
                timing,
            });
        }

        let addressed_to_me = ctx.notification_rounds(notify).await?;
        let combined = ctx.broadcast_round(&contribution).await?;
        let decoded = amd::decode(&self.params, &combined)?;
        let confirm = ctx.veto_rounds(!decoded.valid).await?;
        let valid = decoded.valid && !confirm.vetoed;
        let timing = ctx.finish().await?;
        Ok(RunReport {
            outcome: Exchange::Delivered {
                message: decoded.message,
                valid,
                addressed_to_me,
            },
            timing,
        })
    }

    fn validate_notify(&self, notify: Option<ParticipantId>) -> Result<(), ProtocolError> {
        if let Some(target) = notify {
            if !self.config.contains(target) {
                return Err(ProtocolError::InvalidParameter(format!(
                    "participant {target} is not a group member"
                )));
            }
            if target == self.local {
                return Err(ProtocolError::InvalidParameter(
                    "cannot notify yourself".to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn begin_run(&self, kind: ProtocolKind) -> Result<RunCtx<'_>, ProtocolError> {
        let mut coord = self.coordinator.lock().await;
        // Claimed under the lock, so run ids follow lock-acquisition order
        // and concurrent callers cannot open their runs out of id order.
        let run_id = self.run_counter.fetch_add(1, Ordering::SeqCst);
        let session = TimingSession::begin(kind, run_id, self.config.group_size());
        coord.open_run(run_id, kind).await?;
        Ok(RunCtx {
            engine: self,
            coord,
            run_id,
            round: 0,
            session,
        })
    }
}

/// A run in flight. Holds the coordinator for the whole run, numbers the
/// rounds, and carries the timing session from open to close.
struct RunCtx<'a> {
    engine: &'a ProtocolEngine,
    coord: MutexGuard<'a, RoundCoordinator>,
    run_id: u64,
    round: u64,
    session: TimingSession,
}

impl RunCtx<'_> {
    /// One DC-net broadcast round over `contribution`. Returns the XOR of
    /// every participant's contribution.
    async fn broadcast_round(&mut self, contribution: &Bits) -> Result<Bits, ProtocolError> {
        let masked = self.masked(contribution)?;
        let round = self.round;
        self.round += 1;
        let received = self
            .coord
            .exchange(self.run_id, round, masked.clone(), RoundMode::Broadcast)
            .await?;
        let mut combined = masked;
        for value in received.values() {
            combined.xor_in_place(value);
        }
        Ok(combined)
    }

    /// One DC-net round whose combined value only `collector` learns.
    /// Everyone still consumes pads and contributes; non-collectors get
    /// `None` and move on without waiting.
    async fn collect_round(
        &mut self,
        contribution: &Bits,
        collector: ParticipantId,
    ) -> Result<Option<Bits>, ProtocolError> {
        let masked = self.masked(contribution)?;
        let round = self.round;
        self.round += 1;
        let received = self
            .coord
            .exchange(self.run_id, round, masked.clone(), RoundMode::Collect(collector))
            .await?;
        if self.engine.local != collector {
            return Ok(None);
        }
        let mut combined = masked;
        for value in received.values() {
            combined.xor_in_place(value);
        }
        Ok(Some(combined))
    }

    /// Masks a contribution with one fresh pad per peer. A whole pad is
    /// consumed every round whatever the round width; bit rounds use the
    /// pad's first bit.
    fn masked(&self, contribution: &Bits) -> Result<Bits, ProtocolError> {
        let peers = self.engine.config.peers_of(self.engine.local);
        let pads = self.engine.pads.take_for_round(&peers)?;
        let width = contribution.len();
        let mut masked = contribution.clone();
        for (_, pad) in &pads {
            masked.xor_in_place(&pad.prefix(width));
        }
        Ok(masked)
    }

    /// Up to `security` single-bit rounds. A vetoer contributes a fresh
    /// coin each round and the group reads the XOR; the first round that
    /// combines to one settles the verdict for everyone at once.
    async fn veto_rounds(&mut self, veto: bool) -> Result<VetoVerdict, ProtocolError> {
        for _ in 0..self.engine.config.security() {
            let own = veto && rand::rng().random::<bool>();
            let mut contribution = Bits::zeros(1);
            contribution.set_bit(0, own);
            let combined = self.broadcast_round(&contribution).await?;
            if combined.bit(0) {
                return Ok(VetoVerdict {
                    vetoed: true,
                    own_bit: own,
                });
            }
        }
        Ok(VetoVerdict {
            vetoed: false,
            own_bit: false,
        })
    }

    /// Two veto phases. The first asks "anyone?"; when it trips, each
    /// contender checks whether its own coin decided the tripping round.
    /// A second veto among the contenders whose coin did not decide
    /// separates one sender from several.
    async fn sender_count(&mut self, wants_to_send: bool) -> Result<SenderCount, ProtocolError> {
        let first = self.veto_rounds(wants_to_send).await?;
        if !first.vetoed {
            return Ok(SenderCount::Zero);
        }
        let second = self.veto_rounds(wants_to_send && !first.own_bit).await?;
        if second.vetoed {
            Ok(SenderCount::Many)
        } else {
            Ok(SenderCount::One)
        }
    }

    /// `security` collect rounds towards each participant in id order,
    /// with no early exit: only the addressee could know a round tripped,
    /// so the full schedule always runs. Returns whether this participant
    /// was notified.
    async fn notification_rounds(
        &mut self,
        notify: Option<ParticipantId>,
    ) -> Result<bool, ProtocolError> {
        let engine = self.engine;
        let mut notified = false;
        for target in engine.config.participants() {
            let mut hit = false;
            for _ in 0..engine.config.security() {
                let own = notify == Some(target) && rand::rng().random::<bool>();
                let mut contribution = Bits::zeros(1);
                contribution.set_bit(0, own);
                if let Some(combined) = self.collect_round(&contribution, target).await? {
                    if combined.bit(0) {
                        hit = true;
                    }
                }
            }
            if target == engine.local {
                notified = hit;
            }
        }
        Ok(notified)
    }

    /// Closes the run at the group barrier and settles the timing.
    async fn finish(mut self) -> Result<RunTiming, ProtocolError> {
        self.coord.finish_run(self.run_id, self.round).await?;
        Ok(self.session.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup;
    use crate::sim::SimNet;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const TIMEOUT: Duration = Duration::from_secs(5);
    const PAD_SEED: u64 = 0x0dd5_eed5;

    fn group(
        ids: &[ParticipantId],
        message_len: usize,
        security: u32,
        pads_per_peer: usize,
        timeout: Duration,
    ) -> (SimNet, Vec<Arc<ProtocolEngine>>) {
        let config =
            Arc::new(GroupConfig::new(ids.iter().copied(), message_len, security).unwrap());
        let (net, subs) = SimNet::full_mesh(&config);
        let engines = ids
            .iter()
            .zip(subs)
            .map(|(&id, sub)| {
                let store = Arc::new(PadStore::new(config.clone(), id).unwrap());
                setup::install_session_pads(&store, PAD_SEED, pads_per_peer).unwrap();
                Arc::new(
                    ProtocolEngine::new(
                        config.clone(),
                        store,
                        Arc::new(sub),
                        EngineOptions {
                            round_timeout: timeout,
                        },
                    )
                    .unwrap(),
                )
            })
            .collect();
        (net, engines)
    }

    #[tokio::test]
    async fn transmission_delivers_to_the_whole_group() {
        let (_net, engines) = group(&[1, 2, 3], 24, 8, 1, TIMEOUT);
        let message = Bits::from_bytes(&[0xAB, 0xCD, 0xEF]);
        let mut handles = Vec::new();
        for engine in &engines {
            let engine = engine.clone();
            let role = if engine.local_id() == 2 {
                TransmissionRole::Sender {
                    message: message.clone(),
                }
            } else {
                TransmissionRole::Relay
            };
            handles.push(tokio::spawn(async move { engine.run_transmission(role).await }));
        }
        for handle in handles {
            let report = handle.await.unwrap().unwrap();
            assert_eq!(report.outcome.message, message);
            assert!(report.outcome.valid);
            assert_eq!(report.timing.protocol, "transmission");
            assert_eq!(report.timing.group_size, 3);
        }
    }

    #[tokio::test]
    async fn transmission_works_in_larger_groups() {
        let ids = [2, 3, 5, 8, 13];
        let (_net, engines) = group(&ids, 16, 5, 1, TIMEOUT);
        let message = Bits::from_bytes(&[0x5A, 0xA5]);
        let mut handles = Vec::new();
        for engine in &engines {
            let engine = engine.clone();
            let role = if engine.local_id() == 8 {
                TransmissionRole::Sender {
                    message: message.clone(),
                }
            } else {
                TransmissionRole::Relay
            };
            handles.push(tokio::spawn(async move { engine.run_transmission(role).await }));
        }
        for handle in handles {
            let report = handle.await.unwrap().unwrap();
            assert_eq!(report.outcome.message, message);
            assert!(report.outcome.valid);
        }
    }

    #[tokio::test]
    async fn transmission_works_in_the_smallest_group() {
        let (_net, engines) = group(&[1, 2], 16, 5, 1, TIMEOUT);
        let message = Bits::from_bytes(&[0x3C, 0xC3]);
        let mut handles = Vec::new();
        for engine in &engines {
            let engine = engine.clone();
            let role = if engine.local_id() == 1 {
                TransmissionRole::Sender {
                    message: message.clone(),
                }
            } else {
                TransmissionRole::Relay
            };
            handles.push(tokio::spawn(async move { engine.run_transmission(role).await }));
        }
        for handle in handles {
            let report = handle.await.unwrap().unwrap();
            assert_eq!(report.outcome.message, message);
            assert!(report.outcome.valid);
        }
    }

    #[tokio::test]
    async fn wrong_message_length_is_rejected_before_the_run_opens() {
        let (_net, engines) = group(&[1, 2], 16, 5, 1, TIMEOUT);
        let result = engines[0]
            .run_transmission(TransmissionRole::Sender {
                message: Bits::zeros(17),
            })
            .await;
        assert!(matches!(result, Err(ProtocolError::InvalidParameter(_))));
    }

    async fn veto_outcomes(inputs: &[(ParticipantId, bool)]) -> Vec<bool> {
        let ids: Vec<ParticipantId> = inputs.iter().map(|&(id, _)| id).collect();
        let (_net, engines) = group(&ids, 8, 16, 16, TIMEOUT);
        let mut handles = Vec::new();
        for (engine, &(_, veto)) in engines.iter().zip(inputs) {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move { engine.run_veto(veto).await }));
        }
        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap().unwrap().outcome);
        }
        outcomes
    }

    #[tokio::test]
    async fn veto_silence_is_unanimous() {
        assert_eq!(
            veto_outcomes(&[(1, false), (2, false), (3, false)]).await,
            vec![false, false, false]
        );
    }

    #[tokio::test]
    async fn one_veto_reaches_everyone() {
        assert_eq!(
            veto_outcomes(&[(1, false), (2, true), (3, false)]).await,
            vec![true, true, true]
        );
    }

    #[tokio::test]
    async fn concurrent_vetoes_do_not_cancel() {
        assert_eq!(
            veto_outcomes(&[(1, true), (2, true), (3, false)]).await,
            vec![true, true, true]
        );
    }

    async fn sender_counts(wants: &[(ParticipantId, bool)]) -> Vec<SenderCount> {
        let ids: Vec<ParticipantId> = wants.iter().map(|&(id, _)| id).collect();
        let (_net, engines) = group(&ids, 8, 16, 32, TIMEOUT);
        let mut handles = Vec::new();
        for (engine, &(_, wants_to_send)) in engines.iter().zip(wants) {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine.run_collision_detection(wants_to_send).await
            }));
        }
        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap().unwrap().outcome);
        }
        outcomes
    }

    #[tokio::test]
    async fn collision_detection_counts_zero() {
        let outcomes = sender_counts(&[(1, false), (2, false), (3, false)]).await;
        assert!(outcomes.iter().all(|&c| c == SenderCount::Zero));
    }

    #[tokio::test]
    async fn collision_detection_counts_one() {
        let outcomes = sender_counts(&[(1, false), (2, true), (3, false)]).await;
        assert!(outcomes.iter().all(|&c| c == SenderCount::One));
    }

    #[tokio::test]
    async fn collision_detection_counts_many() {
        let outcomes = sender_counts(&[(1, true), (2, false), (3, true)]).await;
        assert!(outcomes.iter().all(|&c| c == SenderCount::Many));
    }

    #[tokio::test]
    async fn notification_reaches_only_the_addressee() {
        let (_net, engines) = group(&[1, 2, 3], 8, 16, 48, TIMEOUT);
        let mut handles = Vec::new();
        for engine in &engines {
            let engine = engine.clone();
            let notify = (engine.local_id() == 1).then_some(3);
            handles.push(tokio::spawn(async move { engine.run_notification(notify).await }));
        }
        let mut notified = Vec::new();
        for handle in handles {
            notified.push(handle.await.unwrap().unwrap().outcome);
        }
        assert_eq!(notified, vec![false, false, true]);
    }

    #[tokio::test]
    async fn notifying_yourself_is_rejected() {
        let (_net, engines) = group(&[1, 2], 8, 5, 0, TIMEOUT);
        let result = engines[0].run_notification(Some(1)).await;
        assert!(matches!(result, Err(ProtocolError::InvalidParameter(_))));
        let result = engines[0].run_notification(Some(9)).await;
        assert!(matches!(result, Err(ProtocolError::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn exchange_idles_when_nobody_offers() {
        let (_net, engines) = group(&[1, 2, 3], 8, 16, 16, TIMEOUT);
        let mut handles = Vec::new();
        for engine in &engines {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine.run_message_exchange(None).await
            }));
        }
        for handle in handles {
            let report = handle.await.unwrap().unwrap();
            assert_eq!(report.outcome, Exchange::Idle);
        }
    }

    #[tokio::test]
    async fn exchange_delivers_a_single_sender_with_notification() {
        let (_net, engines) = group(&[1, 2, 3], 16, 16, 160, TIMEOUT);
        let payload = Bits::from_bytes(&[0xC0, 0xDE]);
        let mut handles = Vec::new();
        for engine in &engines {
            let engine = engine.clone();
            let outbound = (engine.local_id() == 2).then(|| Outbound {
                payload: payload.clone(),
                notify: Some(1),
            });
            handles.push(tokio::spawn(async move {
                engine.run_message_exchange(outbound).await
            }));
        }
        for (id, handle) in [1, 2, 3].into_iter().zip(handles) {
            let report = handle.await.unwrap().unwrap();
            match report.outcome {
                Exchange::Delivered {
                    message,
                    valid,
                    addressed_to_me,
                } => {
                    assert_eq!(message, payload);
                    assert!(valid);
                    assert_eq!(addressed_to_me, id == 1);
                }
                other => panic!("unexpected outcome for {id}: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn exchange_delivers_between_two_participants() {
        let (_net, engines) = group(&[1, 2], 16, 16, 96, TIMEOUT);
        let payload = Bits::from_bytes(&[0xD1, 0xCE]);
        let mut handles = Vec::new();
        for engine in &engines {
            let engine = engine.clone();
            let outbound = (engine.local_id() == 2).then(|| Outbound {
                payload: payload.clone(),
                notify: Some(1),
            });
            handles.push(tokio::spawn(async move {
                engine.run_message_exchange(outbound).await
            }));
        }
        for (id, handle) in [1, 2].into_iter().zip(handles) {
            let report = handle.await.unwrap().unwrap();
            match report.outcome {
                Exchange::Delivered {
                    message,
                    valid,
                    addressed_to_me,
                } => {
                    assert_eq!(message, payload);
                    assert!(valid);
                    assert_eq!(addressed_to_me, id == 1);
                }
                other => panic!("unexpected outcome for {id}: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn exchange_reports_collisions() {
        let (_net, engines) = group(&[1, 2, 3], 16, 16, 64, TIMEOUT);
        let payload = Bits::from_bytes(&[0xBE, 0xEF]);
        let mut handles = Vec::new();
        for engine in &engines {
            let engine = engine.clone();
            let outbound = (engine.local_id() != 2).then(|| Outbound {
                payload: payload.clone(),
                notify: None,
            });
            handles.push(tokio::spawn(async move {
                engine.run_message_exchange(outbound).await
            }));
        }
        for handle in handles {
            let report = handle.await.unwrap().unwrap();
            assert_eq!(report.outcome, Exchange::Collision);
        }
    }

    #[tokio::test]
    async fn tampering_is_flagged_where_it_landed() {
        let (net, engines) = group(&[1, 2, 3], 16, 10, 1, TIMEOUT);
        net.tamper_bit(3, 1, 7);
        let message = Bits::from_bytes(&[0x42, 0x24]);
        let mut handles = Vec::new();
        for engine in &engines {
            let engine = engine.clone();
            let role = if engine.local_id() == 2 {
                TransmissionRole::Sender {
                    message: message.clone(),
                }
            } else {
                TransmissionRole::Relay
            };
            handles.push(tokio::spawn(async move { engine.run_transmission(role).await }));
        }
        let mut reports = Vec::new();
        for handle in handles {
            reports.push(handle.await.unwrap().unwrap());
        }
        assert!(!reports[0].outcome.valid);
        assert!(reports[1].outcome.valid);
        assert!(reports[2].outcome.valid);
        assert_eq!(reports[1].outcome.message, message);
        assert_eq!(reports[2].outcome.message, message);
    }

    #[tokio::test]
    async fn tampering_every_transcript_is_flagged_by_everyone() {
        let (net, engines) = group(&[1, 2, 3], 16, 10, 1, TIMEOUT);
        // One flip crosses every participant's inbound links.
        net.tamper_bit(3, 1, 7);
        net.tamper_bit(3, 2, 7);
        net.tamper_bit(1, 3, 7);
        let mut handles = Vec::new();
        for engine in &engines {
            let engine = engine.clone();
            let role = if engine.local_id() == 2 {
                TransmissionRole::Sender {
                    message: Bits::from_bytes(&[0x42, 0x24]),
                }
            } else {
                TransmissionRole::Relay
            };
            handles.push(tokio::spawn(async move { engine.run_transmission(role).await }));
        }
        for handle in handles {
            let report = handle.await.unwrap().unwrap();
            assert!(!report.outcome.valid);
        }
    }

    #[tokio::test]
    async fn silenced_peer_times_out_the_group() {
        let (net, engines) = group(&[1, 2, 3], 8, 5, 8, Duration::from_millis(300));
        net.silence(3);
        let mut handles = Vec::new();
        for engine in &engines {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move { engine.run_veto(false).await }));
        }
        for handle in handles {
            let result = handle.await.unwrap();
            assert!(matches!(result, Err(ProtocolError::RoundTimeout { .. })));
        }
    }

    #[tokio::test]
    async fn exhausted_pads_abort_the_run() {
        let (_net, engines) = group(&[1, 2, 3], 8, 5, 0, TIMEOUT);
        let mut handles = Vec::new();
        for engine in &engines {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move { engine.run_veto(true).await }));
        }
        for handle in handles {
            let result = handle.await.unwrap();
            assert!(matches!(result, Err(ProtocolError::KeyExhausted { .. })));
        }
    }

    #[tokio::test]
    async fn sequential_runs_stay_aligned() {
        let (_net, engines) = group(&[1, 2], 8, 16, 32, TIMEOUT);
        let mut handles = Vec::new();
        for engine in &engines {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                let quiet = engine.run_veto(false).await?.outcome;
                let loud = engine.run_veto(engine.local_id() == 1).await?.outcome;
                Ok::<_, ProtocolError>((quiet, loud))
            }));
        }
        for handle in handles {
            let (quiet, loud) = handle.await.unwrap().unwrap();
            assert!(!quiet);
            assert!(loud);
        }
    }

    #[tokio::test]
    async fn concurrent_runs_on_one_engine_serialize() {
        let (_net, engines) = group(&[1, 2], 8, 16, 32, TIMEOUT);
        let mut handles = Vec::new();
        for engine in &engines {
            for _ in 0..2 {
                let engine = engine.clone();
                handles.push(tokio::spawn(async move { engine.run_veto(false).await }));
            }
        }
        let mut run_ids = vec![Vec::new(), Vec::new()];
        for (slot, handle) in handles.into_iter().enumerate() {
            let report = handle.await.unwrap().unwrap();
            assert!(!report.outcome);
            run_ids[slot / 2].push(report.timing.run_id);
        }
        // Each engine must have served its two callers as runs 0 and 1,
        // whichever caller reached the coordinator first.
        for ids in &mut run_ids {
            ids.sort_unstable();
            assert_eq!(*ids, vec![0, 1]);
        }
    }

    /// The DC-net identity and its anonymity: an adversary controlling
    /// participant 3 sees every broadcast value and its own two pads, and
    /// can solve for the one pad it cannot see under either hypothesis
    /// about who sent. Both solutions satisfy the whole transcript, so
    /// the view pins down no sender.
    #[test]
    fn coalition_view_fits_every_sender_hypothesis() {
        let mut rng = StdRng::seed_from_u64(9);
        let width = 64;
        let p12 = Bits::random(width, &mut rng);
        let p13 = Bits::random(width, &mut rng);
        let p23 = Bits::random(width, &mut rng);
        let codeword = Bits::random(width, &mut rng);

        // Participant 1 is the true sender; 2 relays; 3 relays.
        let xor = |parts: &[&Bits]| {
            let mut acc = Bits::zeros(width);
            for part in parts {
                acc.xor_in_place(part);
            }
            acc
        };
        let x1 = xor(&[&codeword, &p12, &p13]);
        let x2 = xor(&[&p12, &p23]);
        let x3 = xor(&[&p13, &p23]);

        // The grand XOR cancels every pad pairwise.
        assert_eq!(xor(&[&x1, &x2, &x3]), codeword);

        // Hypothesis A: participant 1 sent. Solve p12 from x1, check x2.
        let solved = xor(&[&x1, &codeword, &p13]);
        assert_eq!(xor(&[&solved, &p23]), x2);

        // Hypothesis B: participant 2 sent. Solve p12 from x1 with a zero
        // contribution, check that x2 then carries the codeword.
        let solved = xor(&[&x1, &p13]);
        assert_eq!(xor(&[&solved, &codeword, &p23]), x2);
    }
}
