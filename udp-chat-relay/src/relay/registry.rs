use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    time::{Duration, Instant},
};

use crate::message::PresenceEntry;

/// Sessions idle for longer than this are evicted by the sweep.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub identity: String,
    pub nickname: String,
    pub address: SocketAddr,
    pub registered_at: Instant,
    pub last_activity: Instant,
    pub active: bool,
}

impl Session {
    pub fn presence(&self) -> PresenceEntry {
        PresenceEntry {
            nickname: self.nickname.clone(),
            id: self.identity.clone(),
        }
    }
}

/// Point-in-time counters for the operator console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryStats {
    pub active_sessions: usize,
    pub total_registered: u64,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
    total_registered: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, identity: &str, nickname: &str, address: SocketAddr) -> &Session {
        self.register_at(identity, nickname, address, Instant::now())
    }

    /// Inserts or replaces the session for `identity`. A repeated HELLO reuses
    /// the identity and picks up the new nickname and address.
    pub fn register_at(
        &mut self,
        identity: &str,
        nickname: &str,
        address: SocketAddr,
        now: Instant,
    ) -> &Session {
        let registered_at = match self.sessions.get(identity) {
            Some(existing) => existing.registered_at,
            None => {
                self.total_registered += 1;
                now
            }
        };

        let session = Session {
            identity: identity.to_string(),
            nickname: nickname.to_string(),
            address,
            registered_at,
            last_activity: now,
            active: true,
        };
        self.sessions.insert(identity.to_string(), session);
        &self.sessions[identity]
    }

    pub fn touch(&mut self, identity: &str) {
        self.touch_at(identity, Instant::now());
    }

    pub fn touch_at(&mut self, identity: &str, now: Instant) {
        if let Some(session) = self.sessions.get_mut(identity) {
            session.last_activity = now;
            session.active = true;
        }
    }

    /// Removes every session idle for longer than `threshold` and returns
    /// their identities.
    pub fn sweep_expired(&mut self, now: Instant, threshold: Duration) -> HashSet<String> {
        let mut expired = HashSet::new();
        self.sessions.retain(|identity, session| {
            let idle = now.saturating_duration_since(session.last_activity) > threshold;
            if idle {
                expired.insert(identity.clone());
            }
            !idle
        });
        expired
    }

    pub fn lookup(&self, identity: &str) -> Option<&Session> {
        self.sessions.get(identity)
    }

    pub fn active_sessions(&self) -> Vec<Session> {
        self.sessions
            .values()
            .filter(|session| session.active)
            .cloned()
            .collect()
    }

    pub fn presence_list(&self) -> Vec<PresenceEntry> {
        self.sessions
            .values()
            .filter(|session| session.active)
            .map(Session::presence)
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_sessions: self.sessions.values().filter(|session| session.active).count(),
            total_registered: self.total_registered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn register_replaces_stale_entry() {
        let mut registry = SessionRegistry::new();
        registry.register("u1", "alice", addr(1000));
        let session = registry.register("u1", "alice2", addr(2000));

        assert_eq!(session.nickname, "alice2");
        assert_eq!(session.address, addr(2000));
        assert_eq!(registry.active_sessions().len(), 1);
        assert_eq!(registry.stats().total_registered, 1);
    }

    #[test]
    fn touch_unknown_identity_is_noop() {
        let mut registry = SessionRegistry::new();
        registry.touch("ghost");
        assert!(registry.lookup("ghost").is_none());
        assert_eq!(registry.stats(), RegistryStats::default());
    }

    #[test]
    fn sweep_evicts_only_idle_sessions() {
        let mut registry = SessionRegistry::new();
        let start = Instant::now();
        registry.register_at("u1", "alice", addr(1000), start);
        registry.register_at("u2", "bob", addr(1001), start);
        registry.touch_at("u2", start + Duration::from_secs(100));

        let removed =
            registry.sweep_expired(start + Duration::from_secs(150), DEFAULT_IDLE_TIMEOUT);

        assert_eq!(removed, HashSet::from(["u1".to_string()]));
        let remaining: Vec<String> = registry
            .active_sessions()
            .into_iter()
            .map(|session| session.identity)
            .collect();
        assert_eq!(remaining, vec!["u2".to_string()]);
    }

    #[test]
    fn sweep_keeps_sessions_at_threshold() {
        let mut registry = SessionRegistry::new();
        let start = Instant::now();
        registry.register_at("u1", "alice", addr(1000), start);

        let removed = registry.sweep_expired(start + DEFAULT_IDLE_TIMEOUT, DEFAULT_IDLE_TIMEOUT);
        assert!(removed.is_empty());
        assert!(registry.lookup("u1").is_some());
    }

    #[test]
    fn stats_count_every_new_identity() {
        let mut registry = SessionRegistry::new();
        let start = Instant::now();
        registry.register_at("u1", "alice", addr(1000), start);
        registry.register_at("u2", "bob", addr(1001), start);
        registry.sweep_expired(start + Duration::from_secs(500), DEFAULT_IDLE_TIMEOUT);
        registry.register_at("u3", "carol", addr(1002), start + Duration::from_secs(500));

        assert_eq!(
            registry.stats(),
            RegistryStats {
                active_sessions: 1,
                total_registered: 3,
            }
        );
    }
}
