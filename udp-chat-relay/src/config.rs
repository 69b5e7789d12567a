use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::{
    cli::{ClientArgs, RelayArgs},
    client::reliability::{
        DEFAULT_ACK_TIMEOUT, DEFAULT_RECENT_IDS, DEFAULT_RETRY_SCAN_INTERVAL, RetryPolicy,
    },
    relay::registry::DEFAULT_IDLE_TIMEOUT,
};

pub const DEFAULT_PORT: u16 = 9000;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub sweep_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl From<&RelayArgs> for RelayConfig {
    fn from(args: &RelayArgs) -> Self {
        Self {
            listen: args.listen,
            sweep_interval: Duration::from_secs(args.sweep_interval_secs.max(1)),
            idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub nickname: String,
    pub server: SocketAddr,
    pub ping_interval: Duration,
    pub ack_timeout: Duration,
    pub retry_scan_interval: Duration,
    pub retry_policy: RetryPolicy,
    pub recent_ids: usize,
    pub history_path: Option<PathBuf>,
}

impl ClientConfig {
    pub fn new(nickname: &str, server: SocketAddr) -> Self {
        Self {
            nickname: nickname.to_string(),
            server,
            ping_interval: DEFAULT_PING_INTERVAL,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            retry_scan_interval: DEFAULT_RETRY_SCAN_INTERVAL,
            retry_policy: RetryPolicy::default(),
            recent_ids: DEFAULT_RECENT_IDS,
            history_path: None,
        }
    }
}

impl From<&ClientArgs> for ClientConfig {
    fn from(args: &ClientArgs) -> Self {
        let retry_policy = match args.retransmit {
            Some(max_attempts) => RetryPolicy::Retransmit { max_attempts },
            None => RetryPolicy::ReportOnly,
        };
        Self {
            ping_interval: Duration::from_secs(args.ping_interval_secs.max(1)),
            ack_timeout: Duration::from_secs(args.ack_timeout_secs),
            retry_scan_interval: Duration::from_secs(args.retry_scan_secs.max(1)),
            retry_policy,
            history_path: args.history.clone(),
            ..Self::new(&args.nickname, args.server)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_args_select_retry_policy() {
        let args = ClientArgs {
            nickname: "alice".into(),
            server: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            ping_interval_secs: 30,
            ack_timeout_secs: 10,
            retry_scan_secs: 0,
            retransmit: Some(4),
            history: None,
        };
        let config = ClientConfig::from(&args);
        assert_eq!(config.retry_policy, RetryPolicy::Retransmit { max_attempts: 4 });
        assert_eq!(config.retry_scan_interval, Duration::from_secs(1));
        assert_eq!(config.ack_timeout, DEFAULT_ACK_TIMEOUT);
    }

    #[test]
    fn relay_defaults_match_heartbeat_contract() {
        let config = RelayConfig::default();
        // Several missed pings must fit inside the idle timeout.
        assert!(config.idle_timeout >= DEFAULT_PING_INTERVAL * 3);
        assert_eq!(config.listen.port(), DEFAULT_PORT);
    }
}
