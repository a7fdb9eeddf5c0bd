//! TCP full-mesh substrate
//!
//! Every participant holds one TCP connection to every other member. The
//! mesh is oriented by participant id so each pair connects exactly once:
//! a node dials every peer with a lower id and accepts from every peer
//! with a higher one. The handshake exchanges participant id and group
//! configuration digest; a digest mismatch is rejected on both sides
//! before any protocol frame is exchanged.
//!
//! Frames are bincode payloads behind a u32 big-endian length prefix,
//! capped at [`MAX_FRAME_SIZE`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::config::{ConfigDigest, GroupConfig, ParticipantId};

use super::messages::WireMessage;
use super::{NetError, Substrate, SubstrateEvent};

/// Upper bound on a serialized frame. Codewords are a few dozen bytes;
/// anything near this limit is a corrupt or hostile peer.
pub(crate) const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Backoff between connection attempts while a peer is still starting up.
const DIAL_RETRY: Duration = Duration::from_millis(250);

/// First frame on every connection, in both directions.
#[derive(Clone, Copy, Serialize, Deserialize)]
struct Hello {
    participant: ParticipantId,
    digest: ConfigDigest,
}

/// Serializes `value` and writes it as one length-prefixed frame.
pub(crate) async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), NetError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload =
        bincode::serialize(value).map_err(|err| NetError::Serialization(err.to_string()))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(NetError::FrameTooLarge {
            size: payload.len(),
        });
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame and deserializes it.
pub(crate) async fn read_frame<R, T>(reader: &mut R) -> Result<T, NetError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(NetError::FrameTooLarge { size: len });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    bincode::deserialize(&payload).map_err(|err| NetError::Serialization(err.to_string()))
}

/// A fully-connected TCP substrate for one participant.
///
/// Built with [`TcpMesh::establish`], which blocks until the connection to
/// every group member is up or the deadline passes. Once established the
/// mesh never reconnects; a lost peer surfaces as
/// [`SubstrateEvent::Disconnected`] and stays lost for the session.
pub struct TcpMesh {
    local: ParticipantId,
    writers: Arc<RwLock<HashMap<ParticipantId, Arc<Mutex<OwnedWriteHalf>>>>>,
    events: Mutex<mpsc::UnboundedReceiver<SubstrateEvent>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl TcpMesh {
    /// Connects this participant to every other group member.
    ///
    /// Binds the local listener at `addresses[&local]`, dials every peer
    /// with a lower id (retrying while the peer is not yet up) and accepts
    /// from every peer with a higher id.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Config`] when `local` is not a group member or
    /// an address is missing, [`NetError::Handshake`] when a peer presents
    /// a different configuration digest, and [`NetError::MeshTimeout`]
    /// when the mesh is still incomplete at the deadline.
    pub async fn establish(
        config: Arc<GroupConfig>,
        local: ParticipantId,
        addresses: &HashMap<ParticipantId, SocketAddr>,
        timeout: Duration,
    ) -> Result<Self, NetError> {
        if !config.contains(local) {
            return Err(NetError::Config(format!(
                "participant {local} is not a group member"
            )));
        }
        for peer in config.participants() {
            if !addresses.contains_key(&peer) {
                return Err(NetError::Config(format!("no address for participant {peer}")));
            }
        }

        let digest = config.digest();
        let listener = TcpListener::bind(addresses[&local]).await?;
        info!(participant = local, addr = %listener.local_addr()?, "mesh endpoint listening");

        let (accept_tx, mut accept_rx) = mpsc::unbounded_channel();
        let accept_config = config.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                let tx = accept_tx.clone();
                let config = accept_config.clone();
                tokio::spawn(async move {
                    match accept_handshake(stream, local, digest, &config).await {
                        Ok(pair) => {
                            let _ = tx.send(pair);
                        }
                        Err(err) => warn!(%addr, error = %err, "rejected inbound connection"),
                    }
                });
            }
        });

        let mut dials = JoinSet::new();
        for peer in config.peers_of(local) {
            if peer < local {
                let addr = addresses[&peer];
                dials.spawn(dial_peer(
                    addr,
                    peer,
                    Hello {
                        participant: local,
                        digest,
                    },
                ));
            }
        }

        let peer_count = config.group_size() - 1;
        let deadline = Instant::now() + timeout;
        let collected =
            collect_streams(peer_count, &mut dials, &mut accept_rx, deadline).await;
        accept_task.abort();
        let streams = collected?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let writers = Arc::new(RwLock::new(HashMap::with_capacity(peer_count)));
        let mut tasks = Vec::with_capacity(peer_count);
        for (peer, stream) in streams {
            let _ = stream.set_nodelay(true);
            let (read_half, write_half) = stream.into_split();
            writers
                .write()
                .await
                .insert(peer, Arc::new(Mutex::new(write_half)));
            tasks.push(spawn_reader(
                peer,
                read_half,
                writers.clone(),
                event_tx.clone(),
            ));
        }
        info!(participant = local, peers = peer_count, "mesh established");

        Ok(TcpMesh {
            local,
            writers,
            events: Mutex::new(event_rx),
            tasks: std::sync::Mutex::new(tasks),
        })
    }

    /// Tears the mesh down locally. Peers observe the closed connections
    /// as [`SubstrateEvent::Disconnected`].
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = match self.tasks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *tasks)
        };
        for handle in &handles {
            handle.abort();
        }
        self.writers.write().await.clear();
        debug!(participant = self.local, "mesh shut down");
    }
}

impl Drop for TcpMesh {
    fn drop(&mut self) {
        let tasks = match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for handle in tasks.iter() {
            handle.abort();
        }
    }
}

#[async_trait::async_trait]
impl Substrate for TcpMesh {
    fn local_id(&self) -> ParticipantId {
        self.local
    }

    async fn send(&self, to: ParticipantId, message: WireMessage) -> Result<(), NetError> {
        let writer = {
            let writers = self.writers.read().await;
            writers
                .get(&to)
                .cloned()
                .ok_or(NetError::PeerUnreachable { peer: to })?
        };
        let mut guard = writer.lock().await;
        write_frame(&mut *guard, &message).await
    }

    async fn next_event(&self) -> Option<SubstrateEvent> {
        self.events.lock().await.recv().await
    }
}

/// Dials `peer`, retrying while the connection is refused, then runs the
/// handshake. Handshake failures do not retry.
async fn dial_peer(
    addr: SocketAddr,
    peer: ParticipantId,
    hello: Hello,
) -> Result<(ParticipantId, TcpStream), NetError> {
    let mut stream = loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => break stream,
            Err(err) => {
                debug!(peer, %addr, error = %err, "dial failed, retrying");
                time::sleep(DIAL_RETRY).await;
            }
        }
    };
    write_frame(&mut stream, &hello).await?;
    let reply: Hello = read_frame(&mut stream).await?;
    if reply.digest != hello.digest {
        return Err(NetError::Handshake {
            addr: addr.to_string(),
            reason: "group configuration digest mismatch".into(),
        });
    }
    if reply.participant != peer {
        return Err(NetError::Handshake {
            addr: addr.to_string(),
            reason: format!("expected participant {peer}, got {}", reply.participant),
        });
    }
    debug!(peer, %addr, "outbound connection established");
    Ok((peer, stream))
}

/// Acceptor half of the handshake. The reply goes out before validation
/// so a dialer with a mismatched digest learns why it was dropped.
async fn accept_handshake(
    mut stream: TcpStream,
    local: ParticipantId,
    digest: ConfigDigest,
    config: &GroupConfig,
) -> Result<(ParticipantId, TcpStream), NetError> {
    let addr = match stream.peer_addr() {
        Ok(addr) => addr.to_string(),
        Err(_) => "unknown".into(),
    };
    let hello: Hello = read_frame(&mut stream).await?;
    write_frame(
        &mut stream,
        &Hello {
            participant: local,
            digest,
        },
    )
    .await?;
    if hello.digest != digest {
        return Err(NetError::Handshake {
            addr,
            reason: "group configuration digest mismatch".into(),
        });
    }
    if !config.contains(hello.participant) {
        return Err(NetError::Handshake {
            addr,
            reason: format!("participant {} is not a group member", hello.participant),
        });
    }
    if hello.participant <= local {
        return Err(NetError::Handshake {
            addr,
            reason: format!(
                "participant {} must be dialed, not accepted",
                hello.participant
            ),
        });
    }
    debug!(peer = hello.participant, %addr, "inbound connection established");
    Ok((hello.participant, stream))
}

/// Waits until a stream per peer is present or the deadline passes.
async fn collect_streams(
    peer_count: usize,
    dials: &mut JoinSet<Result<(ParticipantId, TcpStream), NetError>>,
    accepts: &mut mpsc::UnboundedReceiver<(ParticipantId, TcpStream)>,
    deadline: Instant,
) -> Result<HashMap<ParticipantId, TcpStream>, NetError> {
    let mut streams = HashMap::with_capacity(peer_count);
    while streams.len() < peer_count {
        tokio::select! {
            joined = dials.join_next(), if !dials.is_empty() => {
                match joined {
                    Some(Ok(Ok((peer, stream)))) => {
                        streams.insert(peer, stream);
                    }
                    Some(Ok(Err(err))) => return Err(err),
                    Some(Err(err)) => {
                        return Err(NetError::Config(format!("dial task failed: {err}")))
                    }
                    None => {}
                }
            }
            accepted = accepts.recv() => {
                match accepted {
                    Some((peer, stream)) => {
                        if streams.contains_key(&peer) {
                            warn!(peer, "duplicate connection, keeping the first");
                        } else {
                            streams.insert(peer, stream);
                        }
                    }
                    None => return Err(NetError::Config("listener stopped".into())),
                }
            }
            _ = time::sleep_until(deadline) => {
                return Err(NetError::MeshTimeout {
                    connected: streams.len(),
                    expected: peer_count,
                });
            }
        }
    }
    Ok(streams)
}

/// Pumps inbound frames into the event channel until the connection dies,
/// then removes the writer and reports the disconnect.
fn spawn_reader(
    peer: ParticipantId,
    mut read_half: OwnedReadHalf,
    writers: Arc<RwLock<HashMap<ParticipantId, Arc<Mutex<OwnedWriteHalf>>>>>,
    events: mpsc::UnboundedSender<SubstrateEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match read_frame::<_, WireMessage>(&mut read_half).await {
                Ok(message) => {
                    if events
                        .send(SubstrateEvent::Frame {
                            from: peer,
                            message,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(err) => {
                    debug!(peer, error = %err, "connection closed");
                    writers.write().await.remove(&peer);
                    let _ = events.send(SubstrateEvent::Disconnected(peer));
                    break;
                }
            }
        }
    })
}
