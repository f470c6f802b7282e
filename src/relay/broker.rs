// Message broker: the connection layer's entry point into the relay core

use crate::relay::auth::TokenVerifier;
use crate::relay::channel::ChannelId;
use crate::relay::client::{ClientConnection, InboundFrame};
use crate::relay::engine::{DeliveryConfig, DeliveryEngine, JoinOutcome};
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::message::{Message, ProtocolMessage, UserId};
use crate::relay::registry::{ReleasedSession, SessionId, SessionRegistry};
use crate::relay::storage::MessageStore;
use std::sync::Arc;

/// Per-connection state owned by the connection's task
pub struct ConnectionState {
    connection: ClientConnection,
    session: Option<SessionId>,
}

impl ConnectionState {
    pub fn new(connection: ClientConnection) -> Self {
        Self {
            connection,
            session: None,
        }
    }

    pub fn connection(&self) -> &ClientConnection {
        &self.connection
    }

    /// Session bound to this connection once authenticated
    pub fn session(&self) -> Option<SessionId> {
        self.session
    }
}

/// Process-wide relay: one registry and one delivery engine
///
/// Built once at startup and shared by every connection task; `shutdown`
/// releases all sessions.
#[derive(Clone)]
pub struct MessageBroker {
    engine: Arc<DeliveryEngine>,
    registry: Arc<SessionRegistry>,
    verifier: Arc<dyn TokenVerifier>,
}

impl MessageBroker {
    /// Create a new message broker
    pub fn new(
        store: Arc<dyn MessageStore>,
        verifier: Arc<dyn TokenVerifier>,
        config: DeliveryConfig,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let engine = Arc::new(DeliveryEngine::new(store, registry.clone(), config));

        Self {
            engine,
            registry,
            verifier,
        }
    }

    /// Get the session registry
    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Get the delivery engine
    pub fn engine(&self) -> Arc<DeliveryEngine> {
        self.engine.clone()
    }

    /// Bind a verified identity to `connection`
    pub async fn on_connect(
        &self,
        connection: ClientConnection,
        user_id: UserId,
    ) -> RelayResult<SessionId> {
        let connection_id = connection.id();
        let session_id = self.registry.register(connection, user_id).await?;
        tracing::info!(
            "User {} connected on {} (session {})",
            user_id,
            connection_id,
            session_id
        );
        Ok(session_id)
    }

    /// Verify `token` and bind the resulting identity to `connection`
    pub async fn authenticate(
        &self,
        connection: ClientConnection,
        token: &str,
    ) -> RelayResult<(SessionId, UserId)> {
        let user_id = self.verifier.verify(token)?;
        let session_id = self.on_connect(connection, user_id).await?;
        Ok((session_id, user_id))
    }

    /// Join the conversation with `peer_id`; the `joined` frame is queued to the session
    pub async fn on_join_request(
        &self,
        session_id: SessionId,
        peer_id: UserId,
    ) -> RelayResult<JoinOutcome> {
        self.engine.join(session_id, peer_id).await
    }

    pub async fn on_leave_request(
        &self,
        session_id: SessionId,
        peer_id: UserId,
    ) -> RelayResult<ChannelId> {
        self.engine.leave(session_id, peer_id).await
    }

    /// Persist and fan out a message from the session's user to `peer_id`
    pub async fn on_send_request(
        &self,
        session_id: SessionId,
        peer_id: UserId,
        content: &str,
    ) -> RelayResult<Message> {
        let sender_id = self.registry.user_of(session_id).await?;
        self.engine.send(sender_id, peer_id, content).await
    }

    /// Release the session bound to `state`'s connection, if any
    pub async fn on_disconnect(&self, state: &mut ConnectionState) -> Option<ReleasedSession> {
        state.session = None;
        let released = self.registry.unregister(state.connection.id()).await;

        match &released {
            Some(released) => tracing::info!(
                "User {} disconnected (session {}, {} channel(s) released)",
                released.user_id,
                released.session_id,
                released.channels.len()
            ),
            None => tracing::debug!(
                "Unauthenticated connection {} closed",
                state.connection.id()
            ),
        }
        released
    }

    /// Release every session
    pub async fn shutdown(&self) -> usize {
        let released = self.registry.clear().await;
        tracing::info!("Message broker stopped, {} session(s) released", released.len());
        released.len()
    }

    /// Handle one inbound frame from a connection
    pub async fn handle_client_message(&self, state: &mut ConnectionState, frame: InboundFrame) {
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                let err = RelayError::InvalidMessage(format!("malformed frame: {}", e));
                self.reply(state, ProtocolMessage::from_error(&err)).await;
                return;
            }
        };

        if let Err(e) = self.dispatch(state, message).await {
            tracing::debug!("Request on {} rejected: {}", state.connection.id(), e);
            self.reply(state, ProtocolMessage::from_error(&e)).await;
        }
    }

    async fn dispatch(&self, state: &mut ConnectionState, message: ProtocolMessage) -> RelayResult<()> {
        if let ProtocolMessage::Auth { token } = &message {
            return self.handle_auth(state, token).await;
        }

        if let ProtocolMessage::Ping = message {
            self.reply(state, ProtocolMessage::Pong).await;
            return Ok(());
        }

        let session_id = state
            .session
            .ok_or_else(|| RelayError::Unauthorized("authenticate first".to_string()))?;

        match message {
            ProtocolMessage::Join { peer_id } => {
                // The engine queues the `joined` frame itself
                self.on_join_request(session_id, peer_id).await?;
            }
            ProtocolMessage::Leave { peer_id } => {
                let channel = self.on_leave_request(session_id, peer_id).await?;
                self.reply(state, ProtocolMessage::Left { channel }).await;
            }
            ProtocolMessage::Send { peer_id, content } => {
                let message = self.on_send_request(session_id, peer_id, &content).await?;
                self.reply(state, ProtocolMessage::Sent { message }).await;
            }
            other => {
                tracing::warn!(
                    "Unexpected frame from connection {}: {:?}",
                    state.connection.id(),
                    other
                );
                return Err(RelayError::InvalidMessage(
                    "frame type is not accepted from clients".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Handle authentication request
    async fn handle_auth(&self, state: &mut ConnectionState, token: &str) -> RelayResult<()> {
        if state.session.is_some() {
            return Err(RelayError::DuplicateConnection(state.connection.id().to_string()));
        }

        match self.authenticate(state.connection.clone(), token).await {
            Ok((session_id, user_id)) => {
                state.session = Some(session_id);
                self.reply(
                    state,
                    ProtocolMessage::AuthResponse {
                        success: true,
                        user_id: Some(user_id),
                        message: "Authenticated".to_string(),
                    },
                )
                .await;
                Ok(())
            }
            Err(RelayError::Unauthorized(reason)) => {
                tracing::warn!(
                    "Authentication failed on {}: {}",
                    state.connection.id(),
                    reason
                );
                self.reply(
                    state,
                    ProtocolMessage::AuthResponse {
                        success: false,
                        user_id: None,
                        message: reason,
                    },
                )
                .await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Queue a frame for this connection
    async fn reply(&self, state: &ConnectionState, message: ProtocolMessage) {
        let timeout = self.engine.config().delivery_timeout;
        if let Err(e) = state.connection.deliver(message, timeout).await {
            tracing::warn!("Reply to {} dropped: {}", state.connection.id(), e);
        }
    }
}
