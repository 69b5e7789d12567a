use std::{fmt, str::FromStr};

use thiserror::Error;

/// Destination marker for messages fanned out to every active session.
pub const BROADCAST: &str = "ALL";
/// Identity used by the relay itself, both as a destination and as a source.
pub const SERVER: &str = "SERVER";

const DELIMITER: char = '|';
const FIELD_COUNT: usize = 5;
const ACK_BODY: &str = "OK";
const PING_BODY: &str = "PING";

const JOIN_PREFIX: &str = "JOIN:";
const LEAVE_PREFIX: &str = "LEAVE:";
const GROUP_PREFIX: &str = "GROUP:";
const PRESENCE_PREFIX: &str = "USERS:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Hello,
    Ping,
    Msg,
    Ack,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Hello => "HELLO",
            MessageKind::Ping => "PING",
            MessageKind::Msg => "MSG",
            MessageKind::Ack => "ACK",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = DecodeError;

    fn from_str(literal: &str) -> Result<Self, Self::Err> {
        match literal {
            "HELLO" => Ok(MessageKind::Hello),
            "PING" => Ok(MessageKind::Ping),
            "MSG" => Ok(MessageKind::Msg),
            "ACK" => Ok(MessageKind::Ack),
            other => Err(DecodeError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("datagram is not valid UTF-8")]
    InvalidUtf8,
    #[error("expected 5 `|`-separated fields, found {0}")]
    MissingFields(usize),
    #[error("unknown message kind `{0}`")]
    UnknownKind(String),
}

/// A single datagram on the wire: `kind|source|destination|message_id|body`.
///
/// The body is the trailing field and is never escaped. Decoding splits on
/// the first four delimiters only, so a body may itself contain `|`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub kind: MessageKind,
    pub source_id: String,
    pub destination_id: String,
    pub message_id: String,
    pub body: String,
}

impl ChatMessage {
    pub fn hello(client_id: &str, nickname: &str) -> Self {
        Self::new(MessageKind::Hello, client_id, SERVER, nickname)
    }

    pub fn ping(client_id: &str) -> Self {
        Self::new(MessageKind::Ping, client_id, SERVER, PING_BODY)
    }

    pub fn text(source_id: &str, destination_id: &str, body: impl Into<String>) -> Self {
        Self::new(MessageKind::Msg, source_id, destination_id, body)
    }

    /// Builds the acknowledgement for `original`, sent by `acker` back to the
    /// original source and correlated on the original message id.
    pub fn ack(original: &ChatMessage, acker: &str) -> Self {
        Self {
            kind: MessageKind::Ack,
            source_id: acker.to_string(),
            destination_id: original.source_id.clone(),
            message_id: original.message_id.clone(),
            body: ACK_BODY.to_string(),
        }
    }

    fn new(
        kind: MessageKind,
        source_id: &str,
        destination_id: &str,
        body: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            source_id: source_id.to_string(),
            destination_id: destination_id.to_string(),
            message_id: new_message_id(),
            body: body.into(),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination_id == BROADCAST
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, DecodeError> {
        std::str::from_utf8(datagram)
            .map_err(|_| DecodeError::InvalidUtf8)?
            .parse()
    }
}

impl fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{DELIMITER}{}{DELIMITER}{}{DELIMITER}{}{DELIMITER}{}",
            self.kind, self.source_id, self.destination_id, self.message_id, self.body
        )
    }
}

impl FromStr for ChatMessage {
    type Err = DecodeError;

    fn from_str(wire: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = wire.splitn(FIELD_COUNT, DELIMITER).collect();
        let &[kind, source_id, destination_id, message_id, body] = fields.as_slice() else {
            return Err(DecodeError::MissingFields(fields.len()));
        };

        Ok(Self {
            kind: kind.parse()?,
            source_id: source_id.to_string(),
            destination_id: destination_id.to_string(),
            message_id: message_id.to_string(),
            body: body.to_string(),
        })
    }
}

/// Generates a fresh message id. Ids never contain the wire delimiter.
pub fn new_message_id() -> String {
    nanoid::nanoid!()
}

/// Room sub-commands carried in the body of a MSG addressed to the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive<'a> {
    Join(&'a str),
    Leave(&'a str),
    Group { room: &'a str, text: &'a str },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectiveError {
    #[error("{0} directive is missing a room name")]
    MissingRoom(&'static str),
    #[error("GROUP directive for room `{0}` has no text")]
    MissingText(String),
}

impl<'a> Directive<'a> {
    /// Returns `Ok(None)` for plain text, and an error when the body starts
    /// with a directive prefix but cannot be used.
    pub fn parse(body: &'a str) -> Result<Option<Self>, DirectiveError> {
        if let Some(room) = body.strip_prefix(JOIN_PREFIX) {
            return non_empty(room, "JOIN").map(|room| Some(Directive::Join(room)));
        }
        if let Some(room) = body.strip_prefix(LEAVE_PREFIX) {
            return non_empty(room, "LEAVE").map(|room| Some(Directive::Leave(room)));
        }
        if let Some(rest) = body.strip_prefix(GROUP_PREFIX) {
            let Some((room, text)) = rest.split_once(':') else {
                return Err(DirectiveError::MissingText(rest.to_string()));
            };
            let room = non_empty(room, "GROUP")?;
            return Ok(Some(Directive::Group { room, text }));
        }
        Ok(None)
    }

    pub fn to_body(self) -> String {
        match self {
            Directive::Join(room) => format!("{JOIN_PREFIX}{room}"),
            Directive::Leave(room) => format!("{LEAVE_PREFIX}{room}"),
            Directive::Group { room, text } => format!("{GROUP_PREFIX}{room}:{text}"),
        }
    }
}

/// `JOIN:`, `LEAVE:` and `GROUP::text` name the empty room on some relays.
/// This protocol has no empty room; such directives are malformed.
fn non_empty<'a>(room: &'a str, directive: &'static str) -> Result<&'a str, DirectiveError> {
    if room.is_empty() {
        Err(DirectiveError::MissingRoom(directive))
    } else {
        Ok(room)
    }
}

/// One `nickname:id` pair of a presence list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub nickname: String,
    pub id: String,
}

pub fn presence_body<'a>(entries: impl IntoIterator<Item = &'a PresenceEntry>) -> String {
    let list: Vec<String> = entries
        .into_iter()
        .map(|entry| format!("{}:{}", entry.nickname, entry.id))
        .collect();
    format!("{PRESENCE_PREFIX}{}", list.join(","))
}

/// Parses a `USERS:` payload. Returns `None` when the body is not one;
/// entries that are not exactly `nickname:id` are skipped.
pub fn parse_presence(body: &str) -> Option<Vec<PresenceEntry>> {
    let list = body.strip_prefix(PRESENCE_PREFIX)?;
    let entries = list
        .split(',')
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let mut parts = entry.split(':');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(nickname), Some(id), None) => Some(PresenceEntry {
                    nickname: nickname.to_string(),
                    id: id.to_string(),
                }),
                _ => None,
            }
        })
        .collect();
    Some(entries)
}
