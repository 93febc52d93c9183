//! Single-room websocket chat relay.
//!
//! Every message a client sends is fanned out to every connected client. The
//! modules, leaves first:
//!
//! - [`message`] defines [`message::ChatMessage`] and its JSON wire codec.
//! - [`error`] holds the error taxonomy shared by the relay.
//! - [`connection`] abstracts one accepted websocket as a split
//!   send/receive handle.
//! - [`hub`] owns the registry of live sessions and serializes join, leave
//!   and broadcast through a single task.
//! - [`session`] runs one worker per client: a read loop feeding the hub and
//!   a delivery task draining the session's mailbox.
//! - [`server`] accepts websocket upgrades and spawns sessions.
//! - [`client`] is the terminal client.
//! - [`cli`] and [`config`] parse arguments into explicit configuration.
//!
//! Unit tests live next to each module; the `tests/` directory drives the
//! hub through its public handle and the server over real websockets.

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod message;
pub mod server;
pub mod session;
