//! Anonymous group communication with information-theoretic security
//!
//! This library implements the anonymous communication protocols of
//! Broadbent and Tapp (ASIACRYPT 2007) for small peer-to-peer groups:
//! anonymous transmission, veto, collision detection, notification, and
//! a composed message exchange built from the four.
//!
//! ## Overview
//!
//! Each pair of participants holds a stock of shared one-time pads. In a
//! round, every participant XORs its contribution with one fresh pad per
//! peer and publishes the result; each published value is uniformly
//! random on its own, while the XOR over all of them cancels every pad
//! pairwise and leaves exactly the XOR of the contributions. Sender
//! anonymity therefore holds against any coalition and any computational
//! power, as long as the pads are fresh. Payloads are wrapped in an
//! algebraic manipulation detection code, so tampering by the network or
//! by participants is caught except with probability 2^-beta.
//!
//! ## Key Components
//!
//! - **Configuration**: the agreed membership and protocol parameters,
//!   digest-checked at every handshake and run boundary
//! - **Pads**: per-pair one-time pad stores with strict take-once
//!   semantics
//! - **Rounds**: barriers and value exchange keeping the group in
//!   lockstep over TCP or an in-process simulator
//! - **Engine**: the five protocols themselves
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use anoncast::bits::Bits;
//! use anoncast::config::GroupConfig;
//! use anoncast::engine::{EngineOptions, ProtocolEngine, TransmissionRole};
//! use anoncast::pads::PadStore;
//! use anoncast::setup::install_session_pads;
//! use anoncast::sim::SimNet;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(GroupConfig::new([1, 2, 3], 64, 5)?);
//!     let (_net, substrates) = SimNet::full_mesh(&config);
//!
//!     let mut engines = Vec::new();
//!     for (id, substrate) in config.participants().zip(substrates) {
//!         let store = Arc::new(PadStore::new(config.clone(), id)?);
//!         install_session_pads(&store, 7, 1)?;
//!         engines.push(Arc::new(ProtocolEngine::new(
//!             config.clone(),
//!             store,
//!             Arc::new(substrate),
//!             EngineOptions::default(),
//!         )?));
//!     }
//!
//!     // Participant 2 transmits; the transcript does not reveal which
//!     // participant it was.
//!     let mut runs = Vec::new();
//!     for engine in engines {
//!         let role = if engine.local_id() == 2 {
//!             TransmissionRole::Sender {
//!                 message: Bits::from_bytes(&[7; 8]),
//!             }
//!         } else {
//!             TransmissionRole::Relay
//!         };
//!         runs.push(tokio::spawn(async move { engine.run_transmission(role).await }));
//!     }
//!     for run in runs {
//!         let report = run.await??;
//!         assert!(report.outcome.valid);
//!     }
//!     Ok(())
//! }
//! ```

pub mod amd;
pub mod bits;
pub mod config;
pub mod engine;
pub mod error;
pub mod net;
pub mod pads;
pub mod round;
pub mod setup;
pub mod sim;
pub mod timing;

pub use error::ProtocolError;
