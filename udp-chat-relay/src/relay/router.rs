use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::message::{
    BROADCAST, ChatMessage, Directive, DirectiveError, MessageKind, SERVER, presence_body,
};

use super::{registry::SessionRegistry, rooms::RoomMembership};

/// Everything the relay knows about connected clients. Owned by the relay and
/// lent to the router one datagram at a time.
#[derive(Debug, Default)]
pub struct RelayState {
    pub registry: SessionRegistry,
    pub rooms: RoomMembership,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A datagram the relay has decided to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub message: ChatMessage,
    pub address: SocketAddr,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("no session for destination `{0}`")]
    UnknownDestination(String),
    #[error(transparent)]
    Directive(#[from] DirectiveError),
}

/// Decides every send triggered by one inbound message.
///
/// Precedence: HELLO registers and publishes presence, PING refreshes a known
/// session, MSG is broadcast and/or applied as a room directive and otherwise
/// forwarded directly. Every MSG is acknowledged to `from` exactly once, even
/// when it could not be delivered. ACKs end here.
pub fn route(state: &mut RelayState, message: ChatMessage, from: SocketAddr) -> Vec<Outbound> {
    let mut outbound = Vec::new();
    match message.kind {
        MessageKind::Hello => route_hello(state, &message, from, &mut outbound),
        MessageKind::Ping => route_ping(state, &message, from, &mut outbound),
        MessageKind::Msg => route_text(state, &message, from, &mut outbound),
        MessageKind::Ack => {}
    }
    outbound
}

fn route_hello(
    state: &mut RelayState,
    message: &ChatMessage,
    from: SocketAddr,
    outbound: &mut Vec<Outbound>,
) {
    let session = state
        .registry
        .register(&message.source_id, &message.body, from);
    info!(
        identity = %session.identity,
        nickname = %session.nickname,
        peer = %from,
        "client registered"
    );

    outbound.push(acknowledge(message, from));
    outbound.extend(presence_broadcast(&state.registry));
}

fn route_ping(
    state: &mut RelayState,
    message: &ChatMessage,
    from: SocketAddr,
    outbound: &mut Vec<Outbound>,
) {
    if state.registry.lookup(&message.source_id).is_none() {
        debug!(
            identity = %message.source_id,
            peer = %from,
            "ping from unregistered identity ignored"
        );
        return;
    }
    state.registry.touch(&message.source_id);
    outbound.push(acknowledge(message, from));
}

fn route_text(
    state: &mut RelayState,
    message: &ChatMessage,
    from: SocketAddr,
    outbound: &mut Vec<Outbound>,
) {
    state.registry.touch(&message.source_id);

    // Broadcast and directives are evaluated independently: a message to ALL
    // that carries a directive does both.
    let mut handled = false;
    if message.is_broadcast() {
        let delivered = fan_out(&state.registry, message, outbound);
        debug!(source = %message.source_id, delivered, "broadcast message");
        handled = true;
    }

    match Directive::parse(&message.body) {
        Ok(Some(directive)) => {
            apply_directive(state, message, directive, outbound);
            handled = true;
        }
        Ok(None) => {}
        Err(err) => {
            warn!(
                source = %message.source_id,
                error = %RouteError::from(err),
                "ignoring malformed directive"
            );
            handled = true;
        }
    }

    if !handled {
        match forward_direct(&state.registry, message) {
            Ok(send) => {
                debug!(
                    source = %message.source_id,
                    destination = %message.destination_id,
                    "direct message"
                );
                outbound.push(send);
            }
            Err(err) => {
                warn!(source = %message.source_id, error = %err, "dropping undeliverable message");
            }
        }
    }

    outbound.push(acknowledge(message, from));
}

fn apply_directive(
    state: &mut RelayState,
    message: &ChatMessage,
    directive: Directive<'_>,
    outbound: &mut Vec<Outbound>,
) {
    let sender = message.source_id.as_str();
    match directive {
        Directive::Join(room) => {
            state.rooms.join(room, sender);
            info!(identity = %sender, room, "joined room");
        }
        Directive::Leave(room) => {
            state.rooms.leave(room, sender);
            info!(identity = %sender, room, "left room");
        }
        Directive::Group { room, text } => {
            let mut delivered = 0;
            for member in state.rooms.members_of(room) {
                if member == sender {
                    continue;
                }
                let Some(session) = state.registry.lookup(&member) else {
                    continue;
                };
                outbound.push(Outbound {
                    message: ChatMessage::text(sender, &member, text),
                    address: session.address,
                });
                delivered += 1;
            }
            debug!(identity = %sender, room, delivered, "group message");
        }
    }
}

fn forward_direct(
    registry: &SessionRegistry,
    message: &ChatMessage,
) -> Result<Outbound, RouteError> {
    registry
        .lookup(&message.destination_id)
        .filter(|session| session.active)
        .map(|session| Outbound {
            message: message.clone(),
            address: session.address,
        })
        .ok_or_else(|| RouteError::UnknownDestination(message.destination_id.clone()))
}

/// Sends `message` to every active session except its source. Returns the
/// number of recipients.
fn fan_out(
    registry: &SessionRegistry,
    message: &ChatMessage,
    outbound: &mut Vec<Outbound>,
) -> usize {
    let before = outbound.len();
    outbound.extend(
        registry
            .active_sessions()
            .into_iter()
            .filter(|session| session.identity != message.source_id)
            .map(|session| Outbound {
                message: message.clone(),
                address: session.address,
            }),
    );
    outbound.len() - before
}

fn acknowledge(message: &ChatMessage, from: SocketAddr) -> Outbound {
    Outbound {
        message: ChatMessage::ack(message, SERVER),
        address: from,
    }
}

/// The current presence list, addressed to every active session.
pub fn presence_broadcast(registry: &SessionRegistry) -> Vec<Outbound> {
    let presence = ChatMessage::text(SERVER, BROADCAST, presence_body(&registry.presence_list()));
    let mut outbound = Vec::new();
    fan_out(registry, &presence, &mut outbound);
    outbound
}

/// Evicts idle sessions. When at least one session was removed, the returned
/// sends carry a single presence update to the survivors.
pub fn evict_idle(state: &mut RelayState, now: Instant, threshold: Duration) -> Vec<Outbound> {
    let removed = state.registry.sweep_expired(now, threshold);
    if removed.is_empty() {
        return Vec::new();
    }
    for identity in &removed {
        info!(%identity, "session expired");
    }
    presence_broadcast(&state.registry)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::message::parse_presence;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn hello(state: &mut RelayState, id: &str, nickname: &str, port: u16) {
        route(state, ChatMessage::hello(id, nickname), addr(port));
    }

    fn acks_to(outbound: &[Outbound], address: SocketAddr) -> Vec<&ChatMessage> {
        outbound
            .iter()
            .filter(|send| send.address == address && send.message.kind == MessageKind::Ack)
            .map(|send| &send.message)
            .collect()
    }

    fn texts(outbound: &[Outbound]) -> Vec<&Outbound> {
        outbound
            .iter()
            .filter(|send| send.message.kind == MessageKind::Msg)
            .collect()
    }

    #[test]
    fn hello_registers_acks_and_publishes_presence() {
        let mut state = RelayState::new();
        hello(&mut state, "u1", "alice", 1001);

        let greeting = ChatMessage::hello("u2", "bob");
        let outbound = route(&mut state, greeting.clone(), addr(1002));

        let acks = acks_to(&outbound, addr(1002));
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].message_id, greeting.message_id);

        let presence = texts(&outbound);
        let recipients: HashSet<SocketAddr> = presence.iter().map(|send| send.address).collect();
        assert_eq!(recipients, HashSet::from([addr(1001), addr(1002)]));
        let entries = parse_presence(&presence[0].message.body).expect("presence payload");
        assert_eq!(entries.len(), 2);
        assert_eq!(presence[0].message.source_id, SERVER);
    }

    #[test]
    fn ping_from_unknown_identity_is_ignored() {
        let mut state = RelayState::new();
        let outbound = route(&mut state, ChatMessage::ping("ghost"), addr(1001));
        assert!(outbound.is_empty());
    }

    #[test]
    fn ping_from_known_identity_is_acked() {
        let mut state = RelayState::new();
        hello(&mut state, "u1", "alice", 1001);
        let ping = ChatMessage::ping("u1");
        let outbound = route(&mut state, ping.clone(), addr(1001));
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].message, ChatMessage::ack(&ping, SERVER));
    }

    #[test]
    fn direct_message_is_forwarded_and_acked() {
        let mut state = RelayState::new();
        hello(&mut state, "u1", "alice", 1001);
        hello(&mut state, "u2", "bob", 1002);

        let message = ChatMessage::text("u1", "u2", "hi");
        let outbound = route(&mut state, message.clone(), addr(1001));

        assert_eq!(
            texts(&outbound),
            vec![&Outbound {
                message: message.clone(),
                address: addr(1002)
            }]
        );
        let acks = acks_to(&outbound, addr(1001));
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].message_id, message.message_id);
    }

    #[test]
    fn broadcast_skips_sender() {
        let mut state = RelayState::new();
        hello(&mut state, "u1", "alice", 1001);
        hello(&mut state, "u2", "bob", 1002);
        hello(&mut state, "u3", "carol", 1003);

        let outbound = route(&mut state, ChatMessage::text("u1", BROADCAST, "hey"), addr(1001));
        let recipients: HashSet<SocketAddr> =
            texts(&outbound).iter().map(|send| send.address).collect();
        assert_eq!(recipients, HashSet::from([addr(1002), addr(1003)]));
        assert_eq!(acks_to(&outbound, addr(1001)).len(), 1);
    }

    #[test]
    fn unknown_destination_is_dropped_but_acked() {
        let mut state = RelayState::new();
        hello(&mut state, "u1", "alice", 1001);

        let message = ChatMessage::text("u1", "nobody", "hello?");
        let outbound = route(&mut state, message.clone(), addr(1001));
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].message, ChatMessage::ack(&message, SERVER));
    }

    #[test]
    fn group_fans_out_to_other_members() {
        let mut state = RelayState::new();
        hello(&mut state, "a", "alice", 1001);
        hello(&mut state, "b", "bob", 1002);
        hello(&mut state, "c", "carol", 1003);
        route(&mut state, ChatMessage::text("a", SERVER, "JOIN:team"), addr(1001));
        route(&mut state, ChatMessage::text("b", SERVER, "JOIN:team"), addr(1002));

        let outbound = route(
            &mut state,
            ChatMessage::text("a", SERVER, "GROUP:team:hello"),
            addr(1001),
        );
        let sends = texts(&outbound);
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].address, addr(1002));
        assert_eq!(sends[0].message.source_id, "a");
        assert_eq!(sends[0].message.destination_id, "b");
        assert_eq!(sends[0].message.body, "hello");
        assert_eq!(acks_to(&outbound, addr(1001)).len(), 1);
    }

    #[test]
    fn leave_stops_group_delivery() {
        let mut state = RelayState::new();
        hello(&mut state, "a", "alice", 1001);
        hello(&mut state, "b", "bob", 1002);
        route(&mut state, ChatMessage::text("a", SERVER, "JOIN:team"), addr(1001));
        route(&mut state, ChatMessage::text("b", SERVER, "JOIN:team"), addr(1002));
        route(&mut state, ChatMessage::text("b", SERVER, "LEAVE:team"), addr(1002));

        let outbound = route(
            &mut state,
            ChatMessage::text("a", SERVER, "GROUP:team:anyone?"),
            addr(1001),
        );
        assert!(texts(&outbound).is_empty());
        assert_eq!(acks_to(&outbound, addr(1001)).len(), 1);
    }

    #[test]
    fn broadcast_directive_does_both() {
        let mut state = RelayState::new();
        hello(&mut state, "a", "alice", 1001);
        hello(&mut state, "b", "bob", 1002);

        let outbound = route(
            &mut state,
            ChatMessage::text("a", BROADCAST, "JOIN:team"),
            addr(1001),
        );

        assert_eq!(texts(&outbound).len(), 1);
        assert_eq!(
            state.rooms.members_of("team"),
            HashSet::from(["a".to_string()])
        );
    }

    #[test]
    fn directive_to_a_session_is_not_forwarded() {
        let mut state = RelayState::new();
        hello(&mut state, "a", "alice", 1001);
        hello(&mut state, "b", "bob", 1002);

        let outbound = route(&mut state, ChatMessage::text("a", "b", "JOIN:team"), addr(1001));
        assert!(texts(&outbound).is_empty());
        assert_eq!(acks_to(&outbound, addr(1001)).len(), 1);
    }

    #[test]
    fn malformed_directive_is_acked_only() {
        let mut state = RelayState::new();
        hello(&mut state, "a", "alice", 1001);
        hello(&mut state, "b", "bob", 1002);

        let outbound = route(&mut state, ChatMessage::text("a", "b", "GROUP:team"), addr(1001));
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].message.kind, MessageKind::Ack);
    }

    #[test]
    fn ack_has_no_effect() {
        let mut state = RelayState::new();
        hello(&mut state, "a", "alice", 1001);
        let ack = ChatMessage::ack(&ChatMessage::text("b", "a", "x"), "a");
        assert!(route(&mut state, ack, addr(1001)).is_empty());
    }

    #[test]
    fn eviction_publishes_presence_once() {
        let mut state = RelayState::new();
        let start = Instant::now();
        state.registry.register_at("a", "alice", addr(1001), start);
        state.registry.register_at("b", "bob", addr(1002), start);
        state.registry.register_at("c", "carol", addr(1003), start);
        state.registry.touch_at("c", start + Duration::from_secs(110));

        let outbound = evict_idle(
            &mut state,
            start + Duration::from_secs(130),
            Duration::from_secs(120),
        );

        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].address, addr(1003));
        let entries = parse_presence(&outbound[0].message.body).expect("presence payload");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "c");

        let quiet = evict_idle(
            &mut state,
            start + Duration::from_secs(131),
            Duration::from_secs(120),
        );
        assert!(quiet.is_empty());
    }
}
