//! duochat - Real-time direct messages with durable conversation history
//!
//! This library provides the relay core (pairwise channel addressing, a
//! session registry, persist-then-broadcast delivery and history backfill)
//! together with a SQLite message store and a line-delimited JSON transport.

pub mod relay;

pub use relay::{ChannelId, DeliveryEngine, Message, MessageBroker, RelayError, SessionRegistry, UserId};
