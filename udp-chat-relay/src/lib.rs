//! Chat over UDP through a central relay.
//!
//! Clients register with the relay using HELLO, keep their session alive
//! with PING and exchange MSG datagrams that the relay forwards to one peer,
//! to every peer, or to the members of a room. Every MSG is acknowledged.
//!
//! - [`message`] is the `kind|src|dst|id|body` wire codec plus the room
//!   directives and presence lists carried in message bodies.
//! - [`relay`] owns the socket, the session registry, room membership and
//!   the router.
//! - [`client`] registers, heartbeats, tracks acknowledgements and reports
//!   everything as [`client::ClientEvent`]s.
//! - [`history`] persists a client's chat log as JSON.
//! - [`cli`], [`config`], [`console`] and [`repl`] make up the binary.

pub mod cli;
pub mod client;
pub mod config;
pub mod console;
pub mod history;
pub mod message;
pub mod relay;
pub mod repl;
