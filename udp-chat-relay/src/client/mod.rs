//! Client side of the chat.
//!
//! [`ChatClient::connect`] binds a UDP socket, announces itself with HELLO and
//! spawns three tasks that share the client state behind one mutex:
//!
//! - the receive loop, which settles ACKs, suppresses duplicates and answers
//!   every accepted MSG with an ACK;
//! - the heartbeat, which sends PING on a fixed interval;
//! - the retry sweeper, which expires unacknowledged messages according to the
//!   configured [`RetryPolicy`].
//!
//! Everything the presentation layer needs to know arrives as a
//! [`ClientEvent`] on the channel returned by `connect`.

pub mod reliability;

use std::{
    collections::HashSet,
    net::{Ipv6Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use tokio::{
    net::UdpSocket,
    select,
    sync::{Mutex, mpsc, watch},
    task::AbortHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{
    config::ClientConfig,
    history::{ChatHistory, DEFAULT_RETENTION_DAYS, HistoryEntry},
    message::{
        BROADCAST, ChatMessage, Directive, MessageKind, PresenceEntry, SERVER, parse_presence,
    },
};

pub use reliability::{ReliabilityLayer, RetryPolicy, SweepOutcome};

const MAX_DATAGRAM: usize = 65_507;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// HELLO has been handed to the transport.
    Connected,
    /// The relay acknowledged our HELLO.
    Registered,
    Disconnected,
    /// A transport error; the receive loop may have stopped.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub sender_id: String,
    pub sender_nickname: Option<String>,
    pub destination_id: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    MessageReceived(ReceivedMessage),
    PresenceUpdated(Vec<PresenceEntry>),
    Status(ConnectionStatus),
    Notice(String),
    Delivered { message_id: String },
    DeliveryFailed { message_id: String },
}

/// Handle to a connected client. Cheap to clone; all clones share one
/// socket and one state. [`ChatClient::disconnect`] stops the background
/// tasks and saves the history; dropping the last clone also stops the tasks.
#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<Inner>,
    _tasks: Arc<TaskGuard>,
}

/// Shared by every `ChatClient` clone. The tasks keep `Inner` alive, so they
/// are aborted here once no handle is left.
struct TaskGuard {
    inner: Arc<Inner>,
    tasks: Vec<AbortHandle>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.inner.shutdown.send_replace(true);
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct Inner {
    socket: UdpSocket,
    server: SocketAddr,
    client_id: String,
    nickname: String,
    history_path: Option<PathBuf>,
    state: Mutex<ClientState>,
    events: mpsc::UnboundedSender<ClientEvent>,
    shutdown: watch::Sender<bool>,
}

struct ClientState {
    reliability: ReliabilityLayer,
    blocked: HashSet<String>,
    rooms: HashSet<String>,
    peers: Vec<PresenceEntry>,
    history: Option<ChatHistory>,
    pending_hello: Option<String>,
}

impl ChatClient {
    pub async fn connect(
        config: ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        let bind_addr = if config.server.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .context("failed to bind client socket")?;

        let client_id = nanoid::nanoid!();
        let history = match &config.history_path {
            Some(path) => {
                let mut history = ChatHistory::load_or_new(path, &client_id)?;
                history.prune_older_than(
                    Utc::now(),
                    chrono::Duration::days(DEFAULT_RETENTION_DAYS),
                );
                Some(history)
            }
            None => None,
        };

        let hello = ChatMessage::hello(&client_id, &config.nickname);
        let (events, event_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            socket,
            server: config.server,
            client_id,
            nickname: config.nickname.clone(),
            history_path: config.history_path.clone(),
            state: Mutex::new(ClientState {
                reliability: ReliabilityLayer::new(
                    config.retry_policy,
                    config.ack_timeout,
                    config.recent_ids,
                ),
                blocked: HashSet::new(),
                rooms: HashSet::new(),
                peers: Vec::new(),
                history,
                pending_hello: Some(hello.message_id.clone()),
            }),
            events,
            shutdown,
        });

        inner.transmit(&hello).await?;
        info!(client_id = %inner.client_id, server = %inner.server, "hello sent");
        inner.emit(ClientEvent::Status(ConnectionStatus::Connected));

        let tasks = vec![
            tokio::spawn(receive_loop(Arc::clone(&inner), inner.shutdown.subscribe()))
                .abort_handle(),
            tokio::spawn(heartbeat(
                Arc::clone(&inner),
                config.ping_interval,
                inner.shutdown.subscribe(),
            ))
            .abort_handle(),
            tokio::spawn(retry_sweeper(
                Arc::clone(&inner),
                config.retry_scan_interval,
                inner.shutdown.subscribe(),
            ))
            .abort_handle(),
        ];
        let guard = TaskGuard {
            inner: Arc::clone(&inner),
            tasks,
        };

        Ok((
            Self {
                inner,
                _tasks: Arc::new(guard),
            },
            event_rx,
        ))
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn nickname(&self) -> &str {
        &self.inner.nickname
    }

    pub fn is_connected(&self) -> bool {
        !*self.inner.shutdown.borrow()
    }

    /// Sends `text` to every other active session. Returns the message id.
    pub async fn send_to_all(&self, text: &str) -> Result<String> {
        self.inner.send_text(BROADCAST, text.to_string(), Some(text)).await
    }

    pub async fn send_to_user(&self, destination_id: &str, text: &str) -> Result<String> {
        self.inner
            .send_text(destination_id, text.to_string(), Some(text))
            .await
    }

    /// Sends `text` to the members of `room`. Rooms that were not joined
    /// produce a notice instead of a datagram and return `None`.
    pub async fn send_to_room(&self, room: &str, text: &str) -> Result<Option<String>> {
        if !self.inner.state.lock().await.rooms.contains(room) {
            self.inner
                .emit(ClientEvent::Notice(format!("you are not in room {room}")));
            return Ok(None);
        }
        let body = Directive::Group { room, text }.to_body();
        let message_id = self.inner.send_text(SERVER, body, Some(text)).await?;
        Ok(Some(message_id))
    }

    /// Returns `false` without sending anything when the room was already
    /// joined.
    pub async fn join_room(&self, room: &str) -> Result<bool> {
        validate_room(room)?;
        if !self.inner.state.lock().await.rooms.insert(room.to_string()) {
            return Ok(false);
        }
        self.inner
            .send_text(SERVER, Directive::Join(room).to_body(), None)
            .await?;
        Ok(true)
    }

    pub async fn leave_room(&self, room: &str) -> Result<bool> {
        if !self.inner.state.lock().await.rooms.remove(room) {
            return Ok(false);
        }
        self.inner
            .send_text(SERVER, Directive::Leave(room).to_body(), None)
            .await?;
        Ok(true)
    }

    pub async fn rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.inner.state.lock().await.rooms.iter().cloned().collect();
        rooms.sort();
        rooms
    }

    pub async fn block(&self, identity: &str) -> bool {
        self.inner.state.lock().await.blocked.insert(identity.to_string())
    }

    pub async fn unblock(&self, identity: &str) -> bool {
        self.inner.state.lock().await.blocked.remove(identity)
    }

    pub async fn is_blocked(&self, identity: &str) -> bool {
        self.inner.state.lock().await.blocked.contains(identity)
    }

    /// The presence list most recently published by the relay.
    pub async fn peers(&self) -> Vec<PresenceEntry> {
        self.inner.state.lock().await.peers.clone()
    }

    pub async fn peer_id_by_nickname(&self, nickname: &str) -> Option<String> {
        self.inner
            .state
            .lock()
            .await
            .peers
            .iter()
            .find(|peer| peer.nickname == nickname)
            .map(|peer| peer.id.clone())
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.state.lock().await.reliability.pending_count()
    }

    pub async fn recent_history(&self, count: usize) -> Vec<HistoryEntry> {
        match &self.inner.state.lock().await.history {
            Some(history) => history.recent(count).to_vec(),
            None => Vec::new(),
        }
    }

    pub async fn save_history(&self) -> Result<()> {
        self.inner.save_history().await
    }

    /// Stops the heartbeat, the retry sweeper and the receive loop, then saves
    /// the history. Calling it again is a no-op.
    pub async fn disconnect(&self) -> Result<()> {
        let stopped = self.inner.shutdown.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        });
        if !stopped {
            return Ok(());
        }

        info!(client_id = %self.inner.client_id, "disconnecting");
        let saved = self.inner.save_history().await;
        self.inner
            .emit(ClientEvent::Status(ConnectionStatus::Disconnected));
        saved
    }
}

impl Inner {
    fn emit(&self, event: ClientEvent) {
        // The presentation layer may have gone away; events are best effort.
        let _ = self.events.send(event);
    }

    async fn transmit(&self, message: &ChatMessage) -> Result<()> {
        self.transmit_datagram(&message.encode())
            .await
            .with_context(|| format!("failed to send {} to {}", message.kind, self.server))
    }

    /// Every outbound datagram goes through here; a send error is reported
    /// as [`ConnectionStatus::Failed`].
    async fn transmit_datagram(&self, datagram: &[u8]) -> std::io::Result<()> {
        if let Err(err) = self.socket.send_to(datagram, self.server).await {
            self.emit(ClientEvent::Status(ConnectionStatus::Failed(format!(
                "send failed: {err}"
            ))));
            return Err(err);
        }
        Ok(())
    }

    /// Sends a MSG and tracks it until acknowledged. `record` is the text
    /// written to the history, if any.
    async fn send_text(
        &self,
        destination_id: &str,
        body: String,
        record: Option<&str>,
    ) -> Result<String> {
        if *self.shutdown.borrow() {
            bail!("client is disconnected");
        }

        let message = ChatMessage::text(&self.client_id, destination_id, body);
        {
            let mut state = self.state.lock().await;
            state.reliability.track(&message, Instant::now());
            if let (Some(text), Some(history)) = (record, state.history.as_mut()) {
                history.record(&self.client_id, &self.nickname, text, &message.message_id, false);
            }
        }

        self.transmit(&message).await?;
        debug!(message_id = %message.message_id, destination = %destination_id, "message sent");
        Ok(message.message_id)
    }

    async fn save_history(&self) -> Result<()> {
        let Some(path) = self.history_path.clone() else {
            return Ok(());
        };
        let Some(history) = self.state.lock().await.history.clone() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || history.save(&path))
            .await
            .context("history writer panicked")?
    }

    async fn handle_datagram(&self, datagram: &[u8]) {
        let message = match ChatMessage::decode(datagram) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "dropping undecodable datagram");
                return;
            }
        };

        match message.kind {
            MessageKind::Ack => self.handle_ack(&message).await,
            MessageKind::Msg => self.handle_text(message).await,
            MessageKind::Hello | MessageKind::Ping => {
                debug!(kind = %message.kind, "ignoring message kind not meant for clients");
            }
        }
    }

    async fn handle_ack(&self, ack: &ChatMessage) {
        let mut state = self.state.lock().await;
        if state.reliability.acknowledge(&ack.message_id) {
            if let Some(history) = state.history.as_mut() {
                history.mark_delivered(&ack.message_id);
            }
            drop(state);
            self.emit(ClientEvent::Delivered {
                message_id: ack.message_id.clone(),
            });
        } else if state.pending_hello.as_deref() == Some(ack.message_id.as_str()) {
            state.pending_hello = None;
            drop(state);
            info!("registered with relay");
            self.emit(ClientEvent::Status(ConnectionStatus::Registered));
        } else {
            debug!(message_id = %ack.message_id, "ack for unknown or settled message");
        }
    }

    async fn handle_text(&self, message: ChatMessage) {
        let mut state = self.state.lock().await;
        if state.blocked.contains(&message.source_id) {
            debug!(source = %message.source_id, "dropping message from blocked sender");
            return;
        }
        if message.source_id == self.client_id {
            return;
        }
        if message.source_id == SERVER {
            if let Some(peers) = parse_presence(&message.body) {
                state.peers = peers.clone();
                drop(state);
                self.emit(ClientEvent::PresenceUpdated(peers));
                return;
            }
        }

        if state.reliability.first_sighting(&message.message_id) {
            let sender_nickname = state
                .peers
                .iter()
                .find(|peer| peer.id == message.source_id)
                .map(|peer| peer.nickname.clone());
            if let Some(history) = state.history.as_mut() {
                history.record(
                    &message.source_id,
                    sender_nickname.as_deref().unwrap_or(&message.source_id),
                    &message.body,
                    &message.message_id,
                    true,
                );
            }
            drop(state);
            self.emit(ClientEvent::MessageReceived(ReceivedMessage {
                message_id: message.message_id.clone(),
                sender_id: message.source_id.clone(),
                sender_nickname,
                destination_id: message.destination_id.clone(),
                body: message.body.clone(),
                received_at: Utc::now(),
            }));
        } else {
            drop(state);
            debug!(message_id = %message.message_id, "duplicate message suppressed");
        }

        // Duplicates are acknowledged again: the first ACK may have been lost.
        let ack = ChatMessage::ack(&message, &self.client_id);
        if let Err(err) = self.transmit(&ack).await {
            warn!(error = ?err, "failed to acknowledge message");
        }
    }
}

fn validate_room(room: &str) -> Result<()> {
    if room.is_empty() || room.contains(':') {
        bail!("room names must be non-empty and must not contain ':'");
    }
    Ok(())
}

async fn receive_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut buffer = vec![0u8; MAX_DATAGRAM];
    loop {
        select! {
            _ = shutdown.changed() => {
                debug!("receive loop stopped");
                break;
            }
            received = inner.socket.recv_from(&mut buffer) => match received {
                Ok((len, peer)) if peer == inner.server => {
                    inner.handle_datagram(&buffer[..len]).await;
                }
                Ok((_, peer)) => debug!(peer = %peer, "ignoring datagram from unknown peer"),
                Err(err) => {
                    warn!(error = ?err, "receive failed, reconnect required");
                    inner.emit(ClientEvent::Status(ConnectionStatus::Failed(format!(
                        "receive failed: {err}"
                    ))));
                    break;
                }
            }
        }
    }
}

async fn heartbeat(inner: Arc<Inner>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let ping = ChatMessage::ping(&inner.client_id);
                if let Err(err) = inner.transmit(&ping).await {
                    warn!(error = ?err, "failed to send heartbeat");
                }
            }
        }
    }
}

async fn retry_sweeper(inner: Arc<Inner>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let SweepOutcome { failed, resend } = {
                    let mut state = inner.state.lock().await;
                    state.reliability.sweep(Instant::now())
                };
                for datagram in resend {
                    if let Err(err) = inner.transmit_datagram(&datagram).await {
                        warn!(error = ?err, "failed to retransmit message");
                    }
                }
                for message_id in failed {
                    warn!(%message_id, "message was not delivered");
                    inner.emit(ClientEvent::DeliveryFailed { message_id });
                }
            }
        }
    }
}
