use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anoncast::bits::Bits;
use anoncast::config::{GroupConfig, ParticipantId};
use anoncast::engine::{
    EngineOptions, Exchange, Outbound, ProtocolEngine, TransmissionRole,
};
use anoncast::net::messages::ProtocolKind;
use anoncast::net::transport::TcpMesh;
use anoncast::pads::PadStore;
use anoncast::setup::{install_session_pads, pads_required};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    about = "Run one participant of an anonymous communication group",
    author,
    version
)]
struct Cli {
    /// Local participant id (must appear in --members)
    #[arg(long)]
    id: ParticipantId,

    /// Group membership, comma separated; identical on every participant
    #[arg(long, value_delimiter = ',')]
    members: Vec<ParticipantId>,

    /// Host every participant listens on
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Base TCP port; participant i listens on base-port + i
    #[arg(long = "base-port", default_value_t = 20000)]
    base_port: u16,

    /// Application message length in bits
    #[arg(long = "message-len", default_value_t = 64)]
    message_len: usize,

    /// Security parameter; a manipulation or veto slips through with
    /// probability at most 2^-security
    #[arg(long, default_value_t = 5)]
    security: u32,

    /// Shared seed for the demo pad derivation; real deployments replace
    /// this with a key agreement per pair
    #[arg(long = "session-seed", default_value_t = 7)]
    session_seed: u64,

    /// Seconds to wait for the full mesh and for each protocol round
    #[arg(long = "timeout-secs", default_value_t = 30)]
    timeout_secs: u64,

    #[command(subcommand)]
    protocol: Protocol,
}

#[derive(Subcommand, Debug)]
enum Protocol {
    /// Anonymously broadcast a message to the whole group
    Transmission {
        /// UTF-8 payload; omit it to relay for an anonymous sender
        #[arg(long)]
        message: Option<String>,
    },
    /// Joint veto; the group learns only whether anybody objected
    Veto {
        /// Object to the proposal at hand
        #[arg(long, default_value_t = false)]
        veto: bool,
    },
    /// Classify the number of would-be senders as zero, one or many
    CollisionDetection {
        /// Declare the wish to send
        #[arg(long, default_value_t = false)]
        sending: bool,
    },
    /// Anonymously tip off one participant
    Notification {
        /// Addressee; omit it to participate without notifying anyone
        #[arg(long)]
        target: Option<ParticipantId>,
    },
    /// Full exchange slot: collision gate, notification, delivery and
    /// group confirmation
    Exchange {
        /// UTF-8 payload; omit it to participate without offering one
        #[arg(long)]
        message: Option<String>,
        /// Addressee to tip off before delivery
        #[arg(long, requires = "message")]
        notify: Option<ParticipantId>,
    },
}

impl Protocol {
    fn kind(&self) -> ProtocolKind {
        match self {
            Protocol::Transmission { .. } => ProtocolKind::Transmission,
            Protocol::Veto { .. } => ProtocolKind::Veto,
            Protocol::CollisionDetection { .. } => ProtocolKind::CollisionDetection,
            Protocol::Notification { .. } => ProtocolKind::Notification,
            Protocol::Exchange { .. } => ProtocolKind::MessageExchange,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    let config = Arc::new(GroupConfig::new(
        cli.members.iter().copied(),
        cli.message_len,
        cli.security,
    )?);
    if !config.contains(cli.id) {
        return Err(format!("--id {} is not listed in --members", cli.id).into());
    }

    let mut addresses = HashMap::new();
    for member in config.participants() {
        addresses.insert(member, SocketAddr::new(cli.host, listen_port(cli.base_port, member)?));
    }

    let timeout = Duration::from_secs(cli.timeout_secs);
    let mesh = Arc::new(TcpMesh::establish(config.clone(), cli.id, &addresses, timeout).await?);

    let kind = cli.protocol.kind();
    let pads = Arc::new(PadStore::new(config.clone(), cli.id)?);
    let budget = pads_required(kind, config.group_size(), config.security());
    install_session_pads(&pads, cli.session_seed, budget)?;

    let engine = ProtocolEngine::new(
        config,
        pads,
        mesh.clone(),
        EngineOptions {
            round_timeout: timeout,
        },
    )?;

    let timing = match cli.protocol {
        Protocol::Transmission { message } => {
            let role = match &message {
                Some(text) => TransmissionRole::Sender {
                    message: message_bits(text, cli.message_len)?,
                },
                None => TransmissionRole::Relay,
            };
            let report = engine.run_transmission(role).await?;
            println!(
                "delivered {:?} (hex {}), valid: {}",
                message_text(&report.outcome.message),
                hex::encode(report.outcome.message.as_bytes()),
                report.outcome.valid
            );
            report.timing
        }
        Protocol::Veto { veto } => {
            let report = engine.run_veto(veto).await?;
            println!("vetoed: {}", report.outcome);
            report.timing
        }
        Protocol::CollisionDetection { sending } => {
            let report = engine.run_collision_detection(sending).await?;
            println!("senders: {:?}", report.outcome);
            report.timing
        }
        Protocol::Notification { target } => {
            let report = engine.run_notification(target).await?;
            println!("notified: {}", report.outcome);
            report.timing
        }
        Protocol::Exchange { message, notify } => {
            let outbound = match &message {
                Some(text) => Some(Outbound {
                    payload: message_bits(text, cli.message_len)?,
                    notify,
                }),
                None => None,
            };
            let report = engine.run_message_exchange(outbound).await?;
            match report.outcome {
                Exchange::Idle => println!("idle slot, nobody offered a payload"),
                Exchange::Collision => println!("collision, nothing was delivered"),
                Exchange::Delivered {
                    message,
                    valid,
                    addressed_to_me,
                } => println!(
                    "delivered {:?}, valid: {valid}, addressed to me: {addressed_to_me}",
                    message_text(&message)
                ),
            }
            report.timing
        }
    };

    println!("{}", serde_json::to_string(&timing)?);
    mesh.shutdown().await;
    Ok(())
}

fn listen_port(base: u16, id: ParticipantId) -> Result<u16, Box<dyn std::error::Error>> {
    u16::try_from(id)
        .ok()
        .and_then(|offset| base.checked_add(offset))
        .ok_or_else(|| format!("--base-port {base} + id {id} leaves the TCP port range").into())
}

fn message_bits(text: &str, message_len: usize) -> Result<Bits, Box<dyn std::error::Error>> {
    let bits = Bits::from_bytes(text.as_bytes());
    if bits.len() > message_len {
        return Err(format!(
            "message needs {} bits but --message-len grants {message_len}",
            bits.len()
        )
        .into());
    }
    Ok(bits.resized(message_len))
}

/// Text rendering of a delivered payload; padding NULs are dropped.
fn message_text(bits: &Bits) -> String {
    let text: Vec<u8> = bits
        .as_bytes()
        .iter()
        .copied()
        .take_while(|byte| *byte != 0)
        .collect();
    String::from_utf8_lossy(&text).into_owned()
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();
    });
}
