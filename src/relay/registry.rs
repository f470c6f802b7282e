// Session registry: live connections and their channel memberships

use crate::relay::channel::ChannelId;
use crate::relay::client::{ClientConnection, ConnectionId};
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::message::UserId;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Identifies one authenticated session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A channel member as seen by a fan-out snapshot
#[derive(Debug, Clone)]
pub struct Member {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub connection: ClientConnection,
}

/// What was released when a session went away
#[derive(Debug, Clone)]
pub struct ReleasedSession {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub channels: Vec<ChannelId>,
}

struct SessionEntry {
    user_id: UserId,
    connection: ClientConnection,
    channels: HashSet<ChannelId>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, SessionEntry>,
    connections: HashMap<ConnectionId, SessionId>,
    channels: HashMap<ChannelId, HashSet<SessionId>>,
}

impl RegistryState {
    /// Drop `session_id` from `channel`'s member list, forgetting empty channels
    fn remove_member(&mut self, channel: &ChannelId, session_id: &SessionId) {
        if let Some(members) = self.channels.get_mut(channel) {
            members.remove(session_id);
            if members.is_empty() {
                self.channels.remove(channel);
            }
        }
    }

    fn release(&mut self, session_id: SessionId) -> Option<ReleasedSession> {
        let entry = self.sessions.remove(&session_id)?;
        self.connections.remove(&entry.connection.id());

        for channel in &entry.channels {
            self.remove_member(channel, &session_id);
        }

        Some(ReleasedSession {
            session_id,
            user_id: entry.user_id,
            channels: entry.channels.into_iter().collect(),
        })
    }
}

/// Tracks every live session and which channels it has joined
///
/// All maps sit behind one lock, so no reader ever sees a session that is
/// half registered or half removed. No I/O happens under the lock.
#[derive(Default)]
pub struct SessionRegistry {
    state: RwLock<RegistryState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `connection` to an authenticated user
    pub async fn register(
        &self,
        connection: ClientConnection,
        user_id: UserId,
    ) -> RelayResult<SessionId> {
        let mut state = self.state.write().await;

        let connection_id = connection.id();
        if state.connections.contains_key(&connection_id) {
            return Err(RelayError::DuplicateConnection(connection_id.to_string()));
        }

        let session_id = SessionId::new();
        state.connections.insert(connection_id, session_id);
        state.sessions.insert(
            session_id,
            SessionEntry {
                user_id,
                connection,
                channels: HashSet::new(),
            },
        );

        tracing::debug!("Session {} registered for user {}", session_id, user_id);
        Ok(session_id)
    }

    /// Add the session to `channel`; returns false if it was already a member
    pub async fn join(&self, session_id: SessionId, channel: ChannelId) -> RelayResult<bool> {
        let mut state = self.state.write().await;

        let entry = state
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| RelayError::UnknownSession(session_id.to_string()))?;

        if !channel.includes(entry.user_id) {
            return Err(RelayError::Unauthorized(format!(
                "user {} is not a participant of channel {}",
                entry.user_id, channel
            )));
        }

        if !entry.channels.insert(channel) {
            return Ok(false);
        }

        state.channels.entry(channel).or_default().insert(session_id);
        Ok(true)
    }

    /// Remove the session from `channel`; returns false if it was not a member
    pub async fn leave(&self, session_id: SessionId, channel: ChannelId) -> RelayResult<bool> {
        let mut state = self.state.write().await;

        let entry = state
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| RelayError::UnknownSession(session_id.to_string()))?;

        if !entry.channels.remove(&channel) {
            return Ok(false);
        }

        state.remove_member(&channel, &session_id);
        Ok(true)
    }

    /// Point-in-time snapshot of the members of `channel`
    pub async fn members_of(&self, channel: &ChannelId) -> Vec<Member> {
        let state = self.state.read().await;

        let Some(members) = state.channels.get(channel) else {
            return Vec::new();
        };

        members
            .iter()
            .filter_map(|session_id| {
                state.sessions.get(session_id).map(|entry| Member {
                    session_id: *session_id,
                    user_id: entry.user_id,
                    connection: entry.connection.clone(),
                })
            })
            .collect()
    }

    /// Remove the session bound to `connection_id` from every channel
    pub async fn unregister(&self, connection_id: ConnectionId) -> Option<ReleasedSession> {
        let mut state = self.state.write().await;

        let session_id = *state.connections.get(&connection_id)?;
        let released = state.release(session_id);

        if let Some(released) = &released {
            tracing::debug!(
                "Session {} released from {} channel(s)",
                released.session_id,
                released.channels.len()
            );
        }
        released
    }

    /// Release every session at once
    pub async fn clear(&self) -> Vec<ReleasedSession> {
        let mut state = self.state.write().await;

        let session_ids: Vec<SessionId> = state.sessions.keys().copied().collect();
        let released = session_ids
            .into_iter()
            .filter_map(|session_id| state.release(session_id))
            .collect();

        debug_assert!(state.connections.is_empty());
        debug_assert!(state.channels.is_empty());
        released
    }

    /// User bound to `session_id`
    pub async fn user_of(&self, session_id: SessionId) -> RelayResult<UserId> {
        let state = self.state.read().await;
        state
            .sessions
            .get(&session_id)
            .map(|entry| entry.user_id)
            .ok_or_else(|| RelayError::UnknownSession(session_id.to_string()))
    }

    /// Connection handle of `session_id`
    pub async fn connection_of(&self, session_id: SessionId) -> RelayResult<ClientConnection> {
        let state = self.state.read().await;
        state
            .sessions
            .get(&session_id)
            .map(|entry| entry.connection.clone())
            .ok_or_else(|| RelayError::UnknownSession(session_id.to_string()))
    }

    /// Session bound to `connection_id`, if any
    pub async fn session_for(&self, connection_id: ConnectionId) -> Option<SessionId> {
        let state = self.state.read().await;
        state.connections.get(&connection_id).copied()
    }

    /// Channels `session_id` is currently joined to
    pub async fn channels_of(&self, session_id: SessionId) -> RelayResult<Vec<ChannelId>> {
        let state = self.state.read().await;
        state
            .sessions
            .get(&session_id)
            .map(|entry| entry.channels.iter().copied().collect())
            .ok_or_else(|| RelayError::UnknownSession(session_id.to_string()))
    }

    /// Get number of live sessions
    pub async fn session_count(&self) -> usize {
        let state = self.state.read().await;
        state.sessions.len()
    }

    /// Get number of channels with at least one member
    pub async fn channel_count(&self) -> usize {
        let state = self.state.read().await;
        state.channels.len()
    }
}
