//! Line commands for the two interactive front ends: the relay operator
//! console and the terminal chat client.

use anyhow::{Result, anyhow, bail};

/// Commands read from the relay's stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Stats,
    Clients,
    Help,
    Quit,
}

impl OperatorCommand {
    /// Case-insensitive; accepts the first letter of each command as an alias.
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            bail!("empty command");
        }

        match trimmed.to_lowercase().as_str() {
            "stats" | "s" => Ok(OperatorCommand::Stats),
            "clients" | "c" => Ok(OperatorCommand::Clients),
            "help" | "h" => Ok(OperatorCommand::Help),
            "quit" | "q" | "exit" => Ok(OperatorCommand::Quit),
            _ => Err(anyhow!("unknown command. Try: stats, clients, help, quit")),
        }
    }
}

/// Commands typed into the terminal client. Lines that do not start with `/`
/// are sent to everyone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Broadcast(String),
    Direct { nickname: String, text: String },
    Room { room: String, text: String },
    Join(String),
    Leave(String),
    Block(String),
    Unblock(String),
    Users,
    Help,
    Quit,
}

impl ChatCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            bail!("empty command");
        }
        let Some(command) = trimmed.strip_prefix('/') else {
            return Ok(ChatCommand::Broadcast(trimmed.to_string()));
        };

        let (name, rest) = match command.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (command, ""),
        };

        match name.to_lowercase().as_str() {
            "quit" | "exit" => Ok(ChatCommand::Quit),
            "users" | "who" => Ok(ChatCommand::Users),
            "help" => Ok(ChatCommand::Help),
            "join" => single_word(rest, "/join <room>").map(ChatCommand::Join),
            "leave" => single_word(rest, "/leave <room>").map(ChatCommand::Leave),
            "block" => single_word(rest, "/block <nickname>").map(ChatCommand::Block),
            "unblock" => single_word(rest, "/unblock <nickname>").map(ChatCommand::Unblock),
            "msg" => {
                let (nickname, text) = word_and_text(rest, "/msg <nickname> <text>")?;
                Ok(ChatCommand::Direct { nickname, text })
            }
            "room" => {
                let (room, text) = word_and_text(rest, "/room <room> <text>")?;
                Ok(ChatCommand::Room { room, text })
            }
            other => Err(anyhow!("unknown command /{other}. Try /help")),
        }
    }
}

fn single_word(rest: &str, usage: &str) -> Result<String> {
    let mut words = rest.split_whitespace();
    match (words.next(), words.next()) {
        (Some(word), None) => Ok(word.to_string()),
        _ => Err(anyhow!("usage: {usage}")),
    }
}

fn word_and_text(rest: &str, usage: &str) -> Result<(String, String)> {
    match rest.split_once(char::is_whitespace) {
        Some((word, text)) if !text.trim().is_empty() => {
            Ok((word.to_string(), text.trim().to_string()))
        }
        _ => Err(anyhow!("usage: {usage}")),
    }
}
