//! Acknowledgement tracking, timeouts and duplicate suppression for the
//! client. Pure bookkeeping: callers supply the clock and perform the I/O.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    time::{Duration, Instant},
};

use crate::message::ChatMessage;

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_SCAN_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_RECENT_IDS: usize = 256;

/// What happens to a message whose acknowledgement did not arrive in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Drop the pending entry and report the failure. Nothing is resent.
    #[default]
    ReportOnly,
    /// Resend the original datagram, keeping its message id, until
    /// `max_attempts` sends have been made; then report the failure.
    Retransmit { max_attempts: u32 },
}

#[derive(Debug)]
struct PendingSend {
    sent_at: Instant,
    datagram: Vec<u8>,
    attempts: u32,
}

/// Result of one timeout scan.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Message ids given up on; each is reported exactly once.
    pub failed: Vec<String>,
    /// Datagrams to put back on the wire.
    pub resend: Vec<Vec<u8>>,
}

#[derive(Debug)]
pub struct ReliabilityLayer {
    pending: HashMap<String, PendingSend>,
    seen: RecentIds,
    policy: RetryPolicy,
    ack_timeout: Duration,
}

impl ReliabilityLayer {
    pub fn new(policy: RetryPolicy, ack_timeout: Duration, recent_capacity: usize) -> Self {
        Self {
            pending: HashMap::new(),
            seen: RecentIds::new(recent_capacity),
            policy,
            ack_timeout,
        }
    }

    pub fn track(&mut self, message: &ChatMessage, now: Instant) {
        self.pending.insert(
            message.message_id.clone(),
            PendingSend {
                sent_at: now,
                datagram: message.encode(),
                attempts: 1,
            },
        );
    }

    /// Clears the pending entry for `message_id`. Returns `false` for unknown
    /// or already settled ids.
    pub fn acknowledge(&mut self, message_id: &str) -> bool {
        self.pending.remove(message_id).is_some()
    }

    pub fn sweep(&mut self, now: Instant) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let timeout = self.ack_timeout;
        let max_attempts = match self.policy {
            RetryPolicy::ReportOnly => 1,
            RetryPolicy::Retransmit { max_attempts } => max_attempts.max(1),
        };

        self.pending.retain(|message_id, pending| {
            if now.saturating_duration_since(pending.sent_at) <= timeout {
                return true;
            }
            if pending.attempts < max_attempts {
                pending.attempts += 1;
                pending.sent_at = now;
                outcome.resend.push(pending.datagram.clone());
                return true;
            }
            outcome.failed.push(message_id.clone());
            false
        });

        outcome
    }

    /// Records an inbound message id. Returns `true` the first time an id is
    /// seen within the recent window.
    pub fn first_sighting(&mut self, message_id: &str) -> bool {
        self.seen.insert(message_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Bounded set of recently seen ids; the oldest id is forgotten first.
#[derive(Debug)]
struct RecentIds {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    fn insert(&mut self, id: &str) -> bool {
        if self.members.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.members.insert(id.to_string());
        true
    }
}
