//! Wire messages exchanged between participants
//!
//! Three frame kinds cover the whole protocol surface: a run-open barrier
//! carrying the configuration digest, one masked value per round, and a
//! run-finished barrier. Everything else (who contributes what, how values
//! combine) is local protocol logic and never touches the wire.

use serde::{Deserialize, Serialize};

use crate::bits::Bits;
use crate::config::ConfigDigest;

/// The protocol a run executes. Sent in the run-open barrier so a
/// misconfigured peer driving a different protocol is caught before any
/// round runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolKind {
    Transmission,
    Veto,
    CollisionDetection,
    Notification,
    MessageExchange,
}

impl ProtocolKind {
    /// Stable lowercase label used in logs and timing records.
    pub fn label(&self) -> &'static str {
        match self {
            ProtocolKind::Transmission => "transmission",
            ProtocolKind::Veto => "veto",
            ProtocolKind::CollisionDetection => "collision-detection",
            ProtocolKind::Notification => "notification",
            ProtocolKind::MessageExchange => "message-exchange",
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A frame on the wire between two participants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    /// Run-open barrier: agreement on run id, protocol and configuration
    /// before any pad is consumed.
    RunOpen {
        run_id: u64,
        kind: ProtocolKind,
        digest: ConfigDigest,
    },
    /// One participant's masked value for one round of a run.
    RoundValue { run_id: u64, round: u64, value: Bits },
    /// Run-finished barrier closing a run on every participant.
    RunFinished { run_id: u64 },
}

impl WireMessage {
    /// The run this frame belongs to.
    pub fn run_id(&self) -> u64 {
        match self {
            WireMessage::RunOpen { run_id, .. }
            | WireMessage::RoundValue { run_id, .. }
            | WireMessage::RunFinished { run_id } => *run_id,
        }
    }

    /// Short frame-kind label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            WireMessage::RunOpen { .. } => "run-open",
            WireMessage::RoundValue { .. } => "round-value",
            WireMessage::RunFinished { .. } => "run-finished",
        }
    }
}
