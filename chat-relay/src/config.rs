//! Explicit configuration handed to each component at construction.

use std::net::{IpAddr, SocketAddr};

use crate::cli::{ClientArgs, ServerArgs};

/// Header carrying the room password on the websocket upgrade request.
pub const PASSWORD_HEADER: &str = "x-chat-password";

const DEFAULT_REQUEST_CAPACITY: usize = 256;
const DEFAULT_MAILBOX_CAPACITY: usize = 64;

/// Whether a broadcast is echoed back to the session that sent it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BroadcastPolicy {
    #[default]
    IncludeSender,
    ExcludeSender,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Requests that may queue at the hub before submitters wait.
    pub request_capacity: usize,
    pub policy: BroadcastPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            request_capacity: DEFAULT_REQUEST_CAPACITY,
            policy: BroadcastPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Messages buffered for a session before the hub treats it as stalled.
    pub mailbox_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub password: Option<String>,
    pub hub: HubConfig,
    pub session: SessionConfig,
}

impl ServerConfig {
    pub fn new(bind: IpAddr, port: u16) -> Self {
        Self {
            listen: SocketAddr::new(bind, port),
            password: None,
            hub: HubConfig::default(),
            session: SessionConfig::default(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Checks a password presented by a connecting client.
    pub fn admits(&self, presented: Option<&str>) -> bool {
        match &self.password {
            None => true,
            Some(expected) => presented == Some(expected.as_str()),
        }
    }
}

impl From<ServerArgs> for ServerConfig {
    fn from(args: ServerArgs) -> Self {
        let policy = if args.no_echo {
            BroadcastPolicy::ExcludeSender
        } else {
            BroadcastPolicy::IncludeSender
        };

        Self {
            listen: SocketAddr::new(args.bind, args.port),
            password: args.password.filter(|password| !password.is_empty()),
            hub: HubConfig {
                policy,
                ..HubConfig::default()
            },
            session: SessionConfig {
                mailbox_capacity: args.mailbox_capacity.get(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub nick: Option<String>,
    pub password: Option<String>,
}

impl ClientConfig {
    pub fn url(&self) -> String {
        format!("ws://{}:{}/", self.host, self.port)
    }
}

impl From<ClientArgs> for ClientConfig {
    fn from(args: ClientArgs) -> Self {
        Self {
            host: args.host,
            port: args.port,
            nick: args
                .nick
                .map(|nick| nick.trim().to_string())
                .filter(|nick| !nick.is_empty()),
            password: args.password,
        }
    }
}
