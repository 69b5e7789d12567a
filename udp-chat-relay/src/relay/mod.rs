//! Server side of the chat: a single UDP socket, the session registry, room
//! membership and the router that turns each inbound datagram into sends.

pub mod registry;
pub mod rooms;
pub mod router;

use std::{future::Future, net::SocketAddr, sync::Arc, time::Instant};

use anyhow::{Context, Result};
use tokio::{net::UdpSocket, select, sync::Mutex, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{config::RelayConfig, message::ChatMessage};

pub use registry::{RegistryStats, Session, SessionRegistry};
pub use rooms::RoomMembership;
pub use router::{Outbound, RelayState, RouteError, evict_idle, presence_broadcast, route};

/// Largest payload a UDP datagram can carry.
const MAX_DATAGRAM: usize = 65_507;

pub struct Relay {
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<RelayState>>,
    config: RelayConfig,
}

impl Relay {
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind relay socket on {}", config.listen))?;
        Ok(Self {
            socket: Arc::new(socket),
            state: Arc::new(Mutex::new(RelayState::new())),
            config,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Read-only view for the operator console.
    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Receives and routes datagrams until `shutdown` resolves. Each datagram
    /// is routed and all of its sends are issued before the next one is read.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay {
            socket,
            state,
            config,
        } = self;
        tokio::pin!(shutdown);

        let sweeper = spawn_sweeper(Arc::clone(&socket), Arc::clone(&state), config);
        let mut buffer = vec![0u8; MAX_DATAGRAM];

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("relay shutting down");
                    break;
                }
                received = socket.recv_from(&mut buffer) => match received {
                    Ok((len, peer)) => handle_datagram(&socket, &state, &buffer[..len], peer).await,
                    Err(err) => warn!(error = ?err, "failed to receive datagram"),
                }
            }
        }

        sweeper.abort();
        Ok(())
    }
}

/// Shared, cloneable access to relay counters and sessions.
#[derive(Clone)]
pub struct RelayHandle {
    state: Arc<Mutex<RelayState>>,
}

impl RelayHandle {
    pub async fn stats(&self) -> RegistryStats {
        self.state.lock().await.registry.stats()
    }

    pub async fn sessions(&self) -> Vec<Session> {
        self.state.lock().await.registry.active_sessions()
    }

    pub async fn room_count(&self) -> usize {
        self.state.lock().await.rooms.room_count()
    }
}

async fn handle_datagram(
    socket: &UdpSocket,
    state: &Mutex<RelayState>,
    datagram: &[u8],
    peer: SocketAddr,
) {
    let message = match ChatMessage::decode(datagram) {
        Ok(message) => message,
        Err(err) => {
            warn!(peer = %peer, error = %err, "dropping undecodable datagram");
            return;
        }
    };
    debug!(peer = %peer, kind = %message.kind, source = %message.source_id, "received");

    let outbound = {
        let mut state = state.lock().await;
        route(&mut state, message, peer)
    };
    send_all(socket, outbound).await;
}

fn spawn_sweeper(
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<RelayState>>,
    config: RelayConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; nothing can be idle yet.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let outbound = {
                let mut state = state.lock().await;
                evict_idle(&mut state, Instant::now(), config.idle_timeout)
            };
            send_all(&socket, outbound).await;
        }
    })
}

async fn send_all(socket: &UdpSocket, outbound: Vec<Outbound>) {
    for Outbound { message, address } in outbound {
        if let Err(err) = socket.send_to(&message.encode(), address).await {
            warn!(peer = %address, error = ?err, "failed to send datagram");
        }
    }
}
