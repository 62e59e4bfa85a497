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
    /// Run the chat server, with an operator console on stdin.
    Serve(ServeArgs),
    /// Connect to a server and participate in the chat.
    Connect(ConnectArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub listen: SocketAddr,

    /// JSON file holding registered accounts. Created on first registration.
    #[arg(long, default_value = "accounts.json")]
    pub accounts: PathBuf,

    /// Largest accepted inbound frame in bytes; larger frames disconnect the client.
    #[arg(long, default_value_t = 64 * 1024)]
    pub max_frame_bytes: usize,

    /// Outbound frames that may queue per client before deliveries start waiting.
    #[arg(long, default_value_t = 256)]
    pub outbox_capacity: usize,

    /// Milliseconds a delivery may wait on a full queue before the client is dropped.
    #[arg(long, default_value_t = 1000)]
    pub delivery_timeout_ms: u64,

    /// Milliseconds allowed for flushing a closing client's queued frames.
    #[arg(long, default_value_t = 2000)]
    pub close_grace_ms: u64,

    /// Do not read operator commands from stdin.
    #[arg(long)]
    pub no_console: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Account name to log in or register as.
    #[arg(long)]
    pub username: String,

    /// Account password.
    #[arg(long)]
    pub password: String,

    /// Create the account instead of logging in.
    #[arg(long)]
    pub register: bool,

    /// Address of the server to connect to.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub server: SocketAddr,
}
