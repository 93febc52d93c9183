use std::{net::IpAddr, num::NonZeroUsize};

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, accepting websocket connections.
    Server(ServerArgs),
    /// Connect to a relay server and participate in the chat.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address the server should bind to.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = 8888)]
    pub port: u16,

    /// Require clients to present this password before joining.
    #[arg(long)]
    pub password: Option<String>,

    /// Messages buffered per session before a slow client is dropped.
    #[arg(long, default_value = "64")]
    pub mailbox_capacity: NonZeroUsize,

    /// Do not echo messages back to their sender.
    #[arg(long)]
    pub no_echo: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Host of the relay server.
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Port of the relay server.
    #[arg(long, default_value_t = 8888)]
    pub port: u16,

    /// Nickname shown next to your messages. Prompted for when omitted.
    #[arg(long)]
    pub nick: Option<String>,

    /// Password expected by the server, if any.
    #[arg(long)]
    pub password: Option<String>,
}
