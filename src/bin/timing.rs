use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anoncast::bits::Bits;
use anoncast::config::{GroupConfig, ParticipantId};
use anoncast::engine::{EngineOptions, Outbound, ProtocolEngine, TransmissionRole};
use anoncast::net::messages::ProtocolKind;
use anoncast::net::transport::TcpMesh;
use anoncast::pads::PadStore;
use anoncast::setup::{install_session_pads, pads_required};
use anoncast::timing::{scale_points, RunTiming};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::process::Command;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    about = "Measure protocol wall-clock time across group sizes",
    author,
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sweep group sizes, spawning one OS process per participant
    Run(Sweep),
    /// Run as one measured participant; spawned by `run`, not meant for
    /// direct use
    Participant(Leg),
}

#[derive(Args, Debug)]
struct Sweep {
    /// Protocol to measure
    #[arg(long, value_enum, default_value_t = ProtocolArg::Transmission)]
    protocol: ProtocolArg,

    /// Largest group size in the sweep
    #[arg(long, default_value_t = 10)]
    participants: usize,

    /// Number of group sizes measured between 2 and --participants
    #[arg(long, default_value_t = 5)]
    datapoints: usize,

    /// Space the group sizes logarithmically instead of linearly
    #[arg(long = "log-scale", default_value_t = false)]
    log_scale: bool,

    /// Application message length in bits
    #[arg(long = "message-len", default_value_t = 64)]
    message_len: usize,

    /// Security parameter shared by every measured run
    #[arg(long, default_value_t = 5)]
    security: u32,

    /// First TCP port of the sweep; every scale point gets its own range
    #[arg(long = "base-port", default_value_t = 21000)]
    base_port: u16,

    /// Seconds each participant waits for the mesh and for each round
    #[arg(long = "timeout-secs", default_value_t = 60)]
    timeout_secs: u64,

    /// Summary destination
    #[arg(long, value_name = "FILE", default_value = "timing_summary.json")]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct Leg {
    #[arg(long, value_enum)]
    protocol: ProtocolArg,

    #[arg(long)]
    id: ParticipantId,

    #[arg(long = "group-size")]
    group_size: usize,

    #[arg(long = "base-port")]
    base_port: u16,

    #[arg(long = "message-len")]
    message_len: usize,

    #[arg(long)]
    security: u32,

    #[arg(long = "session-seed")]
    session_seed: u64,

    #[arg(long = "timeout-secs")]
    timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProtocolArg {
    Transmission,
    Veto,
    CollisionDetection,
    Notification,
    Exchange,
}

impl ProtocolArg {
    fn as_flag(self) -> &'static str {
        match self {
            ProtocolArg::Transmission => "transmission",
            ProtocolArg::Veto => "veto",
            ProtocolArg::CollisionDetection => "collision-detection",
            ProtocolArg::Notification => "notification",
            ProtocolArg::Exchange => "exchange",
        }
    }
}

impl From<ProtocolArg> for ProtocolKind {
    fn from(value: ProtocolArg) -> Self {
        match value {
            ProtocolArg::Transmission => ProtocolKind::Transmission,
            ProtocolArg::Veto => ProtocolKind::Veto,
            ProtocolArg::CollisionDetection => ProtocolKind::CollisionDetection,
            ProtocolArg::Notification => ProtocolKind::Notification,
            ProtocolArg::Exchange => ProtocolKind::MessageExchange,
        }
    }
}

/// Mirrors the record layout of the measurement campaign this harness
/// replaces: per scale point the fastest and the mean participant time.
#[derive(Debug, Serialize)]
struct TimingSummary {
    protocol: String,
    security: u32,
    scale: Vec<usize>,
    results_min: Vec<f64>,
    results_mean: Vec<f64>,
    datapoints: usize,
    participants: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(sweep) => {
            init_tracing();
            run_sweep(sweep).await
        }
        // Participants stay quiet on stdout apart from the timing record.
        Commands::Participant(leg) => run_leg(leg).await,
    }
}

async fn run_sweep(sweep: Sweep) -> Result<(), Box<dyn std::error::Error>> {
    let scale = scale_points(2, sweep.participants, sweep.datapoints, sweep.log_scale);
    if scale.is_empty() {
        return Err("nothing to measure: need --datapoints >= 1 and --participants >= 2".into());
    }

    let exe = std::env::current_exe()?;
    let mut results_min = Vec::with_capacity(scale.len());
    let mut results_mean = Vec::with_capacity(scale.len());

    for (point, &group_size) in scale.iter().enumerate() {
        // A fresh port range per point so sockets lingering from the
        // previous point cannot collide with new listeners.
        let point_base = point_port_base(sweep.base_port, sweep.participants, point)?;
        let session_seed = 0x5eed ^ point as u64;
        info!(group_size, point_base, protocol = sweep.protocol.as_flag(), "measuring scale point");

        let mut children = Vec::with_capacity(group_size);
        for id in 1..=group_size {
            let child = Command::new(&exe)
                .arg("participant")
                .arg("--protocol")
                .arg(sweep.protocol.as_flag())
                .arg("--id")
                .arg(id.to_string())
                .arg("--group-size")
                .arg(group_size.to_string())
                .arg("--base-port")
                .arg(point_base.to_string())
                .arg("--message-len")
                .arg(sweep.message_len.to_string())
                .arg("--security")
                .arg(sweep.security.to_string())
                .arg("--session-seed")
                .arg(session_seed.to_string())
                .arg("--timeout-secs")
                .arg(sweep.timeout_secs.to_string())
                .stdout(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;
            children.push((id, child));
        }

        let mut elapsed = Vec::with_capacity(group_size);
        for (id, child) in children {
            let output = child.wait_with_output().await?;
            if !output.status.success() {
                return Err(format!(
                    "participant {id} of the {group_size}-strong point exited with {}",
                    output.status
                )
                .into());
            }
            let timing = parse_timing(&output.stdout)
                .ok_or_else(|| format!("participant {id} printed no timing record"))?;
            elapsed.push(timing.elapsed().as_secs_f64());
        }

        let min = elapsed.iter().copied().fold(f64::INFINITY, f64::min);
        let mean = elapsed.iter().sum::<f64>() / elapsed.len() as f64;
        info!(group_size, min, mean, "scale point finished");
        results_min.push(min);
        results_mean.push(mean);
    }

    let summary = TimingSummary {
        protocol: ProtocolKind::from(sweep.protocol).label().to_string(),
        security: sweep.security,
        scale: scale.clone(),
        results_min,
        results_mean,
        datapoints: sweep.datapoints,
        participants: sweep.participants,
    };
    std::fs::write(&sweep.output, serde_json::to_string_pretty(&summary)?)?;
    println!("Wrote {} scale points to {}", scale.len(), sweep.output.display());
    Ok(())
}

async fn run_leg(leg: Leg) -> Result<(), Box<dyn std::error::Error>> {
    let members = 1..=u32::try_from(leg.group_size)?;
    let config = Arc::new(GroupConfig::new(members, leg.message_len, leg.security)?);

    let mut addresses = HashMap::new();
    for member in config.participants() {
        let port = u16::try_from(member)
            .ok()
            .and_then(|offset| leg.base_port.checked_add(offset))
            .ok_or("listener port out of range")?;
        addresses.insert(member, SocketAddr::new(IpAddr::from([127, 0, 0, 1]), port));
    }

    let timeout = Duration::from_secs(leg.timeout_secs);
    let mesh = Arc::new(TcpMesh::establish(config.clone(), leg.id, &addresses, timeout).await?);

    let kind = ProtocolKind::from(leg.protocol);
    let pads = Arc::new(PadStore::new(config.clone(), leg.id)?);
    let budget = pads_required(kind, config.group_size(), leg.security);
    install_session_pads(&pads, leg.session_seed, budget)?;

    let engine = ProtocolEngine::new(
        config,
        pads,
        mesh.clone(),
        EngineOptions {
            round_timeout: timeout,
        },
    )?;

    // Participant 1 carries the active role; everyone else relays. The
    // veto stays quiet so its measured run covers all security rounds.
    let timing = match leg.protocol {
        ProtocolArg::Transmission => {
            let role = if leg.id == 1 {
                TransmissionRole::Sender {
                    message: measurement_payload(leg.message_len),
                }
            } else {
                TransmissionRole::Relay
            };
            engine.run_transmission(role).await?.timing
        }
        ProtocolArg::Veto => engine.run_veto(false).await?.timing,
        ProtocolArg::CollisionDetection => {
            engine.run_collision_detection(leg.id == 1).await?.timing
        }
        ProtocolArg::Notification => {
            let target = (leg.id == 1).then_some(2);
            engine.run_notification(target).await?.timing
        }
        ProtocolArg::Exchange => {
            let outbound = (leg.id == 1).then(|| Outbound {
                payload: measurement_payload(leg.message_len),
                notify: Some(2),
            });
            engine.run_message_exchange(outbound).await?.timing
        }
    };

    println!("{}", serde_json::to_string(&timing)?);
    mesh.shutdown().await;
    Ok(())
}

fn point_port_base(base: u16, participants: usize, point: usize) -> Result<u16, String> {
    let offset = (participants + 1)
        .checked_mul(point)
        .ok_or("port offset overflow")?;
    u16::try_from(usize::from(base) + offset)
        .map_err(|_| format!("scale point {point} leaves the TCP port range"))
}

/// Last line of a participant's stdout that parses as a timing record.
fn parse_timing(stdout: &[u8]) -> Option<RunTiming> {
    String::from_utf8_lossy(stdout)
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str(line.trim()).ok())
}

fn measurement_payload(message_len: usize) -> Bits {
    let mut bits = Bits::zeros(message_len);
    for i in (0..message_len).step_by(3) {
        bits.set_bit(i, true);
    }
    bits
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
