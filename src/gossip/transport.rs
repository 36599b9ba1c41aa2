//! TCP mesh transport for the gossip overlay.
//!
//! Frames are a u32 big-endian length prefix followed by a JSON envelope.
//! Every peer link is bidirectional: the listener accepts inbound dials, and
//! each configured bootstrap peer gets a dialer task that reconnects with
//! capped exponential backoff. There is no durable queue; messages to a dead
//! peer are dropped.

use eyre::{eyre, Result, WrapErr};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use super::Envelope;
use crate::metrics;

const MAX_FRAME_SIZE: usize = 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

type PeerWriter = Arc<Mutex<OwnedWriteHalf>>;

pub struct MeshTransport {
    listen_port: u16,
    bootstrap_peers: Vec<String>,
    /// Peer address -> write half of the open connection.
    connections: Arc<RwLock<HashMap<String, PeerWriter>>>,
    inbound: mpsc::Sender<Envelope>,
    shutdown: Arc<RwLock<bool>>,
}

impl MeshTransport {
    pub fn new(listen_port: u16, bootstrap_peers: Vec<String>, inbound: mpsc::Sender<Envelope>) -> Self {
        Self {
            listen_port,
            bootstrap_peers,
            connections: Arc::new(RwLock::new(HashMap::new())),
            inbound,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Start the listener task and one dialer task per bootstrap peer.
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.listen_port))
            .await
            .wrap_err_with(|| format!("Failed to bind overlay port {}", self.listen_port))?;
        info!(port = self.listen_port, "Overlay listening");

        let connections = self.connections.clone();
        let inbound = self.inbound.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                if *shutdown.read().await {
                    break;
                }
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let addr = addr.to_string();
                        debug!(peer = %addr, "Inbound overlay connection");
                        Self::adopt_connection(stream, addr, connections.clone(), inbound.clone());
                    }
                    Err(e) => {
                        warn!(error = %e, "Overlay accept error");
                    }
                }
            }
        });

        for peer in &self.bootstrap_peers {
            let peer = peer.clone();
            let connections = self.connections.clone();
            let inbound = self.inbound.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                let mut delay = RECONNECT_BASE;
                loop {
                    if *shutdown.read().await {
                        break;
                    }
                    if connections.read().await.contains_key(&peer) {
                        tokio::time::sleep(RECONNECT_CAP).await;
                        continue;
                    }
                    match Self::dial(&peer).await {
                        Ok(stream) => {
                            info!(peer = %peer, "Connected to bootstrap peer");
                            delay = RECONNECT_BASE;
                            Self::adopt_connection(
                                stream,
                                peer.clone(),
                                connections.clone(),
                                inbound.clone(),
                            );
                        }
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "Bootstrap dial failed");
                        }
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RECONNECT_CAP);
                }
            });
        }

        Ok(())
    }

    async fn dial(peer: &str) -> Result<TcpStream> {
        tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(peer))
            .await
            .map_err(|_| eyre!("Connect timeout to {}", peer))?
            .wrap_err_with(|| format!("Connect failed to {}", peer))
    }

    /// Register a connection and spawn its reader task. The reader owns the
    /// read half; the write half goes into the shared connection map.
    fn adopt_connection(
        stream: TcpStream,
        addr: String,
        connections: Arc<RwLock<HashMap<String, PeerWriter>>>,
        inbound: mpsc::Sender<Envelope>,
    ) {
        let (mut reader, writer) = stream.into_split();

        tokio::spawn(async move {
            {
                let mut conns = connections.write().await;
                conns.insert(addr.clone(), Arc::new(Mutex::new(writer)));
                metrics::GOSSIP_PEERS.set(conns.len() as f64);
            }

            loop {
                match read_frame(&mut reader).await {
                    Ok(envelope) => {
                        if inbound.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(peer = %addr, error = %e, "Overlay read ended");
                        break;
                    }
                }
            }

            let mut conns = connections.write().await;
            conns.remove(&addr);
            metrics::GOSSIP_PEERS.set(conns.len() as f64);
        });
    }

    /// Send an envelope to every connected peer, dropping dead connections.
    pub async fn broadcast(&self, envelope: &Envelope) {
        let frame = match encode_frame(envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Failed to encode gossip frame");
                return;
            }
        };

        let peers: Vec<(String, PeerWriter)> = {
            let conns = self.connections.read().await;
            conns.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut dead = Vec::new();
        for (addr, writer) in peers {
            let mut guard = writer.lock().await;
            if guard.write_all(&frame).await.is_err() {
                dead.push(addr);
            }
        }

        if !dead.is_empty() {
            let mut conns = self.connections.write().await;
            for addr in dead {
                conns.remove(&addr);
            }
            metrics::GOSSIP_PEERS.set(conns.len() as f64);
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn shutdown(&self) {
        *self.shutdown.write().await = true;
        self.connections.write().await.clear();
        metrics::GOSSIP_PEERS.set(0.0);
    }
}

fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(envelope).wrap_err("Envelope serialization failed")?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(eyre!("Envelope too large: {} bytes", body.len()));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Envelope> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .wrap_err("Frame length read failed")?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(eyre!("Frame too large: {} bytes", len));
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .wrap_err("Frame body read failed")?;
    serde_json::from_slice(&body).wrap_err("Frame decode failed")
}
