// Direct message relay
//
// Pairwise conversations between authenticated users: every message is
// persisted before it is fanned out to the sessions joined to its channel,
// and joining a channel backfills the stored history.

pub mod error;
pub mod message;
pub mod channel;
pub mod storage;
pub mod auth;
pub mod client;
pub mod registry;
pub mod engine;
pub mod broker;
pub mod config;
pub mod server;
pub mod cli;
pub mod commands;

pub use error::{RelayError, RelayResult};
pub use message::{Message, ProtocolMessage, UserId};
pub use channel::ChannelId;
pub use storage::{MessageStore, SqliteMessageStore};
pub use auth::{generate_secret, TokenAuthority, TokenVerifier};
pub use client::{ClientConnection, ConnectionId, DeliveryError, RelayClient};
pub use registry::{Member, ReleasedSession, SessionId, SessionRegistry};
pub use engine::{DeliveryConfig, DeliveryEngine, FanOutReport, JoinOutcome};
pub use broker::{ConnectionState, MessageBroker};
pub use config::{RelayConfig, TOKEN_SECRET_ENV};
pub use server::RelayServer;
pub use cli::{DuoChatCli, DuoChatCommand};
pub use commands::execute_command;
