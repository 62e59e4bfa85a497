//! Multi-user chat server speaking newline-delimited JSON over TCP.
//!
//! Each module focuses on one responsibility:
//!
//! - [`codec`] splits the byte stream into bounded JSON frames.
//! - [`message`] defines the client and server frame shapes.
//! - [`session`] runs one connection through login, chat and teardown.
//! - [`registry`] tracks who is online and delivers frames to them.
//! - [`router`] turns chat commands into replies and fan-out.
//! - [`store`] persists accounts with argon2 password hashes.
//! - [`server`] accepts connections and owns the shutdown signal.
//! - [`operator`] implements the server console commands.
//! - [`client`] is a terminal client for the same protocol.
//!
//! Integration tests drive the server over real TCP sockets.

pub mod cli;
pub mod client;
pub mod codec;
pub mod command;
pub mod config;
pub mod console;
pub mod error;
pub mod message;
pub mod operator;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod store;
