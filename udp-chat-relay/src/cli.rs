use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, routing datagrams between registered clients.
    Relay(RelayArgs),
    /// Register with a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:9000")]
    pub listen: SocketAddr,

    /// Seconds between idle-session sweeps.
    #[arg(long, default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Seconds of silence after which a session is evicted.
    #[arg(long, default_value_t = 120)]
    pub idle_timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Nickname announced to the relay.
    #[arg(long)]
    pub nickname: String,

    /// Address of the relay.
    #[arg(long, default_value = "127.0.0.1:9000")]
    pub server: SocketAddr,

    /// Seconds between heartbeat pings.
    #[arg(long, default_value_t = 30)]
    pub ping_interval_secs: u64,

    /// Seconds to wait for an acknowledgement before a message counts as lost.
    #[arg(long, default_value_t = 10)]
    pub ack_timeout_secs: u64,

    /// Seconds between scans for unacknowledged messages.
    #[arg(long, default_value_t = 5)]
    pub retry_scan_secs: u64,

    /// Resend unacknowledged messages up to this many sends in total instead
    /// of only reporting them as undelivered.
    #[arg(long, value_name = "ATTEMPTS")]
    pub retransmit: Option<u32>,

    /// JSON file used to keep the chat history between runs.
    #[arg(long, value_name = "PATH")]
    pub history: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_defaults() {
        let cli = Cli::try_parse_from(["udp_chat_relay", "relay"]).expect("parse");
        let Command::Relay(args) = cli.command else {
            panic!("expected relay command");
        };
        assert_eq!(args.listen, "127.0.0.1:9000".parse().expect("addr"));
        assert_eq!(args.sweep_interval_secs, 60);
        assert_eq!(args.idle_timeout_secs, 120);
    }

    #[test]
    fn client_requires_nickname() {
        assert!(Cli::try_parse_from(["udp_chat_relay", "client"]).is_err());

        let cli = Cli::try_parse_from([
            "udp_chat_relay",
            "client",
            "--nickname",
            "alice",
            "--retransmit",
            "3",
        ])
        .expect("parse");
        let Command::Client(args) = cli.command else {
            panic!("expected client command");
        };
        assert_eq!(args.nickname, "alice");
        assert_eq!(args.retransmit, Some(3));
        assert!(args.history.is_none());
    }
}
