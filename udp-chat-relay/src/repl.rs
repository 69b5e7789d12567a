//! Terminal front ends: the relay operator console and the chat client.

use anyhow::{Result, anyhow};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin},
    select,
    sync::{mpsc, oneshot},
};
use tracing::{debug, warn};

use crate::{
    client::{ChatClient, ClientEvent, ConnectionStatus, ReceivedMessage},
    config::ClientConfig,
    console::{ChatCommand, OperatorCommand},
    message::BROADCAST,
    relay::{Relay, RelayHandle},
};

/// History entries replayed when the client starts.
const REPLAY_ON_START: usize = 20;

const OPERATOR_HELP: &str = "commands: stats, clients, help, quit";

const CLIENT_HELP: &str = "\
text               send to everyone
/msg <nick> <text> private message
/join <room>       join a room
/leave <room>      leave a room
/room <room> <text> send to a room
/block <nick>      ignore messages from a user
/unblock <nick>    stop ignoring a user
/users             list who is online
/quit              leave the chat";

/// Runs the relay until ctrl-c or a `quit` typed on stdin.
pub async fn run_relay(relay: Relay) -> Result<()> {
    let (quit_tx, quit_rx) = oneshot::channel();
    let console = tokio::spawn(operator_console(relay.handle(), quit_tx));

    let result = relay
        .run_until(async move {
            select! {
                ctrl_c = tokio::signal::ctrl_c() => handle_ctrl_c(ctrl_c),
                // A closed stdin drops the sender; only an explicit quit stops the relay.
                Ok(()) = quit_rx => {}
            }
        })
        .await;

    console.abort();
    result
}

async fn operator_console(handle: RelayHandle, quit: oneshot::Sender<()>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match OperatorCommand::parse(&line) {
            Ok(OperatorCommand::Stats) => {
                let stats = handle.stats().await;
                write_stdout(&format!(
                    "active sessions: {}, total registered: {}",
                    stats.active_sessions, stats.total_registered
                ))
                .await?;
                write_stdout(&format!("rooms: {}", handle.room_count().await)).await?;
            }
            Ok(OperatorCommand::Clients) => {
                let mut sessions = handle.sessions().await;
                if sessions.is_empty() {
                    write_stdout("no active sessions").await?;
                }
                sessions.sort_by(|a, b| a.nickname.cmp(&b.nickname));
                for session in sessions {
                    write_stdout(&format!(
                        "{} ({}) at {}, registered {}s ago, idle {}s",
                        session.nickname,
                        session.identity,
                        session.address,
                        session.registered_at.elapsed().as_secs(),
                        session.last_activity.elapsed().as_secs(),
                    ))
                    .await?;
                }
            }
            Ok(OperatorCommand::Help) => write_stdout(OPERATOR_HELP).await?,
            Ok(OperatorCommand::Quit) => {
                let _ = quit.send(());
                return Ok(());
            }
            Err(err) => write_stderr(&format!("!!! {err}")).await?,
        }
    }
    Ok(())
}

/// Connects, replays recent history and then chats until `/quit`, ctrl-c or
/// end of input.
pub async fn run_client(config: ClientConfig) -> Result<()> {
    let (client, mut events) = ChatClient::connect(config).await?;

    for entry in client.recent_history(REPLAY_ON_START).await {
        write_stdout(&format!(
            "[{}] <{}> {}",
            entry.timestamp.format("%Y-%m-%d %H:%M"),
            entry.sender_nickname,
            entry.body
        ))
        .await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let result = run_client_loop(&client, &mut events, &mut lines).await;
    client.disconnect().await?;
    result
}

async fn run_client_loop(
    client: &ChatClient,
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    lines: &mut Lines<BufReader<Stdin>>,
) -> Result<()> {
    loop {
        select! {
            event = events.recv() => match event {
                Some(event) => render_event(event).await?,
                None => break,
            },
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !handle_line(client, &line).await? {
                        break;
                    }
                }
                None => break,
            },
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_line(client: &ChatClient, line: &str) -> Result<bool> {
    if line.trim().is_empty() {
        return Ok(true);
    }

    let command = match ChatCommand::parse(line) {
        Ok(ChatCommand::Quit) => {
            write_stdout("*** leaving chat").await?;
            return Ok(false);
        }
        Ok(command) => command,
        Err(err) => {
            write_stderr(&format!("!!! {err}")).await?;
            return Ok(true);
        }
    };

    match execute(client, command).await {
        Ok(Some(reply)) => write_stdout(&reply).await?,
        Ok(None) => {}
        Err(err) => write_stderr(&format!("!!! {err:#}")).await?,
    }
    Ok(true)
}

async fn execute(client: &ChatClient, command: ChatCommand) -> Result<Option<String>> {
    let reply = match command {
        ChatCommand::Broadcast(text) => {
            client.send_to_all(&text).await?;
            None
        }
        ChatCommand::Direct { nickname, text } => {
            let id = resolve(client, &nickname).await?;
            client.send_to_user(&id, &text).await?;
            None
        }
        ChatCommand::Room { room, text } => {
            client.send_to_room(&room, &text).await?;
            None
        }
        ChatCommand::Join(room) => Some(if client.join_room(&room).await? {
            format!("*** joined {room}")
        } else {
            format!("*** already in {room}")
        }),
        ChatCommand::Leave(room) => Some(if client.leave_room(&room).await? {
            format!("*** left {room}")
        } else {
            format!("*** you are not in {room}")
        }),
        ChatCommand::Block(nickname) => {
            let id = resolve(client, &nickname).await?;
            client.block(&id).await;
            Some(format!("*** blocked {nickname}"))
        }
        ChatCommand::Unblock(nickname) => {
            // Blocked users may have gone offline; fall back to a raw id.
            let id = client
                .peer_id_by_nickname(&nickname)
                .await
                .unwrap_or_else(|| nickname.clone());
            Some(if client.unblock(&id).await {
                format!("*** unblocked {nickname}")
            } else {
                format!("*** {nickname} was not blocked")
            })
        }
        ChatCommand::Users => {
            let peers = client.peers().await;
            Some(if peers.is_empty() {
                "*** nobody is online".to_string()
            } else {
                let names: Vec<&str> = peers.iter().map(|peer| peer.nickname.as_str()).collect();
                format!("*** online: {}", names.join(", "))
            })
        }
        ChatCommand::Help => Some(CLIENT_HELP.to_string()),
        ChatCommand::Quit => None,
    };
    Ok(reply)
}

async fn resolve(client: &ChatClient, nickname: &str) -> Result<String> {
    client
        .peer_id_by_nickname(nickname)
        .await
        .ok_or_else(|| anyhow!("no user named {nickname} is online"))
}

async fn render_event(event: ClientEvent) -> io::Result<()> {
    match event {
        ClientEvent::MessageReceived(message) => render_message(&message).await,
        ClientEvent::PresenceUpdated(peers) => {
            let names: Vec<&str> = peers.iter().map(|peer| peer.nickname.as_str()).collect();
            write_stdout(&format!("*** online: {}", names.join(", "))).await
        }
        ClientEvent::Status(ConnectionStatus::Connected) => {
            write_stdout("*** hello sent, waiting for the relay").await
        }
        ClientEvent::Status(ConnectionStatus::Registered) => {
            write_stdout("*** registered with relay").await
        }
        ClientEvent::Status(ConnectionStatus::Disconnected) => {
            write_stdout("*** disconnected").await
        }
        ClientEvent::Status(ConnectionStatus::Failed(reason)) => {
            write_stderr(&format!("!!! {reason}")).await
        }
        ClientEvent::Notice(text) => write_stdout(&format!("*** {text}")).await,
        ClientEvent::Delivered { message_id } => {
            debug!(%message_id, "delivered");
            Ok(())
        }
        ClientEvent::DeliveryFailed { message_id } => {
            write_stderr(&format!("!!! message {message_id} was not delivered")).await
        }
    }
}

async fn render_message(message: &ReceivedMessage) -> io::Result<()> {
    let sender = message
        .sender_nickname
        .as_deref()
        .unwrap_or(&message.sender_id);
    if message.destination_id == BROADCAST {
        write_stdout(&format!("<{sender}> {}", message.body)).await
    } else {
        write_stdout(&format!("[{sender}] {}", message.body)).await
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
