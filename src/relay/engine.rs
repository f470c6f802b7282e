// Delivery engine: persist, then fan out; history backfill on join

use crate::relay::channel::ChannelId;
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::message::{Message, ProtocolMessage, UserId};
use crate::relay::registry::{Member, SessionId, SessionRegistry};
use crate::relay::storage::MessageStore;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Tunables for validation and fan-out
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// How long one member's outbox may stay full before its delivery is dropped
    pub delivery_timeout: Duration,
    /// Maximum message length in characters
    pub max_content_len: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            delivery_timeout: Duration::from_millis(2000),
            max_content_len: 4096,
        }
    }
}

/// Outcome of fanning one message out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Result of a successful join
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub channel: ChannelId,
    /// Full backlog, oldest first
    pub history: Vec<Message>,
    /// False if the session was already joined
    pub newly_joined: bool,
}

/// Persists messages and fans them out to channel members
pub struct DeliveryEngine {
    store: Arc<dyn MessageStore>,
    registry: Arc<SessionRegistry>,
    config: DeliveryConfig,
    // Serializes persist+fan-out (and join backfill) per channel
    ordering: Mutex<HashMap<ChannelId, Arc<tokio::sync::Mutex<()>>>>,
}

impl DeliveryEngine {
    pub fn new(
        store: Arc<dyn MessageStore>,
        registry: Arc<SessionRegistry>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            ordering: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Reject anything that must never reach the store
    pub fn validate(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: &str,
    ) -> RelayResult<()> {
        if sender_id == receiver_id {
            return Err(RelayError::InvalidMessage(format!(
                "user {} cannot message themselves",
                sender_id
            )));
        }

        if content.trim().is_empty() {
            return Err(RelayError::InvalidMessage("content is empty".to_string()));
        }

        let len = content.chars().count();
        if len > self.config.max_content_len {
            return Err(RelayError::InvalidMessage(format!(
                "content is {} characters, limit is {}",
                len, self.config.max_content_len
            )));
        }

        Ok(())
    }

    /// Persist a message, then deliver it to every member of its channel
    ///
    /// Nothing is delivered unless the store accepted the message. Failed
    /// deliveries to individual members do not fail the send.
    pub async fn send(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: &str,
    ) -> RelayResult<Message> {
        self.validate(sender_id, receiver_id, content)?;
        let channel = ChannelId::between(sender_id, receiver_id)?;

        let lock = self.ordering_lock(channel);
        let result = {
            let _guard = lock.lock().await;

            match self.store.insert_message(sender_id, receiver_id, content).await {
                Ok(message) => {
                    tracing::info!(
                        "Message {} persisted on channel {} ({} -> {})",
                        message.id,
                        channel,
                        sender_id,
                        receiver_id
                    );
                    let report = self.fan_out(&channel, &message).await;
                    tracing::debug!(
                        "Message {} delivered to {} member(s), {} dropped",
                        message.id,
                        report.delivered,
                        report.dropped
                    );
                    Ok(message)
                }
                Err(e) => {
                    tracing::error!("Failed to persist message on channel {}: {}", channel, e);
                    Err(e)
                }
            }
        };
        drop(lock);
        self.prune_ordering_lock(&channel);

        result
    }

    /// Full conversation between `user_id` and `friend_id`, oldest first
    pub async fn history(&self, user_id: UserId, friend_id: UserId) -> RelayResult<Vec<Message>> {
        ChannelId::between(user_id, friend_id)?;
        self.store.select_messages(user_id, friend_id).await
    }

    /// Subscribe `session_id` to its conversation with `peer_id` and backfill it
    ///
    /// Membership and the backlog read happen under the channel's ordering
    /// lock and the `joined` frame is queued before it is released, so the
    /// session sees every earlier message in the backlog and every later one
    /// live, in order. If the backlog cannot be read or the `joined` frame
    /// cannot be queued, a fresh membership is rolled back.
    pub async fn join(&self, session_id: SessionId, peer_id: UserId) -> RelayResult<JoinOutcome> {
        let user_id = self.registry.user_of(session_id).await?;
        let channel = ChannelId::between(user_id, peer_id)?;

        let lock = self.ordering_lock(channel);
        let result = {
            let _guard = lock.lock().await;
            self.join_locked(session_id, user_id, peer_id, channel).await
        };
        drop(lock);
        self.prune_ordering_lock(&channel);

        result
    }

    async fn join_locked(
        &self,
        session_id: SessionId,
        user_id: UserId,
        peer_id: UserId,
        channel: ChannelId,
    ) -> RelayResult<JoinOutcome> {
        let newly_joined = self.registry.join(session_id, channel).await?;

        let history = match self.store.select_messages(user_id, peer_id).await {
            Ok(history) => history,
            Err(e) => {
                if newly_joined {
                    // Never leave a session joined without its backlog
                    let _ = self.registry.leave(session_id, channel).await;
                }
                tracing::error!("Failed to load history for channel {}: {}", channel, e);
                return Err(e);
            }
        };

        let connection = self.registry.connection_of(session_id).await?;
        let frame = ProtocolMessage::Joined {
            channel,
            history: history.clone(),
        };
        if let Err(e) = connection.deliver(frame, self.config.delivery_timeout).await {
            if newly_joined {
                let _ = self.registry.leave(session_id, channel).await;
            }
            tracing::warn!("Join confirmation for session {} not queued: {}", session_id, e);
            return Err(RelayError::Delivery(format!(
                "join confirmation for channel {} not queued: {}",
                channel, e
            )));
        }

        tracing::info!(
            "Session {} joined channel {} with {} message(s) of history",
            session_id,
            channel,
            history.len()
        );

        Ok(JoinOutcome {
            channel,
            history,
            newly_joined,
        })
    }

    /// Stop live delivery of `peer_id`'s conversation to `session_id`
    pub async fn leave(&self, session_id: SessionId, peer_id: UserId) -> RelayResult<ChannelId> {
        let user_id = self.registry.user_of(session_id).await?;
        let channel = ChannelId::between(user_id, peer_id)?;

        if self.registry.leave(session_id, channel).await? {
            tracing::info!("Session {} left channel {}", session_id, channel);
        }
        Ok(channel)
    }

    /// Deliver `message` to a snapshot of the channel's members
    ///
    /// The registry lock is released before any write; members are written
    /// concurrently. A member that already timed out is skipped without
    /// waiting until its outbox drains, so it cannot hold the channel's
    /// ordering lock for one timeout per message.
    async fn fan_out(&self, channel: &ChannelId, message: &Message) -> FanOutReport {
        let members: Vec<Member> = self.registry.members_of(channel).await;
        let timeout = self.config.delivery_timeout;

        let results = join_all(members.iter().map(|member| {
            let frame = ProtocolMessage::Deliver {
                message: message.clone(),
            };
            member.connection.deliver(frame, timeout)
        }))
        .await;

        let mut report = FanOutReport::default();
        for (member, result) in members.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.dropped += 1;
                    tracing::warn!(
                        "Dropped message {} for session {} (user {}): {}",
                        message.id,
                        member.session_id,
                        member.user_id,
                        e
                    );
                }
            }
        }

        report
    }

    fn ordering_lock(&self, channel: ChannelId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .ordering
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(channel).or_default().clone()
    }

    /// Forget the channel's lock once nobody holds or waits on it
    fn prune_ordering_lock(&self, channel: &ChannelId) {
        let mut locks = self
            .ordering
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(lock) = locks.get(channel) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(channel);
            }
        }
    }

    #[cfg(test)]
    fn ordering_lock_count(&self) -> usize {
        self.ordering
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::client::ClientConnection;
    use crate::relay::storage::SqliteMessageStore;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    fn uid(raw: u64) -> UserId {
        UserId::new(raw).unwrap()
    }

    /// Store that is always down
    struct UnreachableStore;

    #[async_trait]
    impl MessageStore for UnreachableStore {
        async fn insert_message(&self, _: UserId, _: UserId, _: &str) -> RelayResult<Message> {
            Err(RelayError::Persistence("store unreachable".to_string()))
        }

        async fn select_messages(&self, _: UserId, _: UserId) -> RelayResult<Vec<Message>> {
            Err(RelayError::Persistence("store unreachable".to_string()))
        }
    }

    fn engine_with(store: Arc<dyn MessageStore>, config: DeliveryConfig) -> DeliveryEngine {
        DeliveryEngine::new(store, Arc::new(SessionRegistry::new()), config)
    }

    fn sqlite_engine() -> DeliveryEngine {
        engine_with(
            Arc::new(SqliteMessageStore::open_in_memory().unwrap()),
            DeliveryConfig::default(),
        )
    }

    async fn connect(
        engine: &DeliveryEngine,
        user: u64,
        capacity: usize,
    ) -> (SessionId, mpsc::Receiver<ProtocolMessage>) {
        let (conn, rx) = ClientConnection::new(capacity);
        let session = engine.registry.register(conn, uid(user)).await.unwrap();
        (session, rx)
    }

    fn expect_delivery(frame: Option<ProtocolMessage>) -> Message {
        match frame {
            Some(ProtocolMessage::Deliver { message }) => message,
            other => panic!("expected deliver frame, got {:?}", other),
        }
    }

    fn expect_joined(frame: Option<ProtocolMessage>) -> (ChannelId, Vec<Message>) {
        match frame {
            Some(ProtocolMessage::Joined { channel, history }) => (channel, history),
            other => panic!("expected joined frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_then_history() {
        let engine = sqlite_engine();

        let sent = engine.send(uid(1), uid(2), "hello").await.unwrap();

        for (a, b) in [(1, 2), (2, 1)] {
            let history = engine.history(uid(a), uid(b)).await.unwrap();
            let hellos: Vec<_> = history.iter().filter(|m| m.content == "hello").collect();
            assert_eq!(hellos.len(), 1);
            assert_eq!(hellos[0], &sent);
            assert_eq!(hellos[0].sender_id, uid(1));
            assert_eq!(hellos[0].receiver_id, uid(2));
        }
    }

    #[tokio::test]
    async fn test_validation_rejects_before_store() {
        // The store is down, so reaching it would surface Persistence instead
        let engine = engine_with(Arc::new(UnreachableStore), DeliveryConfig::default());

        for content in ["", "   ", "\n\t"] {
            let err = engine.send(uid(1), uid(2), content).await.unwrap_err();
            assert!(matches!(err, RelayError::InvalidMessage(_)), "{:?}", content);
        }

        let err = engine.send(uid(1), uid(1), "x").await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidMessage(_)));

        let long = "x".repeat(DeliveryConfig::default().max_content_len + 1);
        let err = engine.send(uid(1), uid(2), &long).await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidMessage(_)));
    }

    #[tokio::test]
    async fn test_self_send_persists_and_broadcasts_nothing() {
        let engine = sqlite_engine();
        let (_session, mut rx) = connect(&engine, 1, 8).await;

        assert!(engine.send(uid(1), uid(1), "x").await.is_err());
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            engine.history(uid(1), uid(1)).await,
            Err(RelayError::InvalidPair(1))
        ));
    }

    #[tokio::test]
    async fn test_failed_persist_broadcasts_nothing() {
        let engine = engine_with(Arc::new(UnreachableStore), DeliveryConfig::default());
        let (conn, mut rx) = ClientConnection::new(8);
        let session = engine.registry.register(conn, uid(2)).await.unwrap();
        let channel = ChannelId::between(uid(1), uid(2)).unwrap();
        engine.registry.join(session, channel).await.unwrap();

        let err = engine.send(uid(1), uid(2), "x").await.unwrap_err();
        assert!(matches!(err, RelayError::Persistence(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_join_backfills_then_streams_in_order() {
        let engine = sqlite_engine();
        engine.send(uid(1), uid(2), "before").await.unwrap();

        let (alice, mut alice_rx) = connect(&engine, 1, 16).await;
        let (bob, mut bob_rx) = connect(&engine, 2, 16).await;

        let outcome = engine.join(alice, uid(2)).await.unwrap();
        assert!(outcome.newly_joined);
        assert_eq!(outcome.channel.to_string(), "1-2");
        assert_eq!(outcome.history.len(), 1);
        engine.join(bob, uid(1)).await.unwrap();

        let (channel, history) = expect_joined(alice_rx.recv().await);
        assert_eq!(channel.to_string(), "1-2");
        assert_eq!(history[0].content, "before");
        expect_joined(bob_rx.recv().await);

        engine.send(uid(1), uid(2), "a").await.unwrap();
        engine.send(uid(1), uid(2), "b").await.unwrap();

        for rx in [&mut alice_rx, &mut bob_rx] {
            let first = expect_delivery(rx.recv().await);
            let second = expect_delivery(rx.recv().await);
            assert_eq!(first.content, "a");
            assert_eq!(second.content, "b");
            assert!(first.id < second.id);
        }
    }

    #[tokio::test]
    async fn test_rejoin_is_idempotent() {
        let engine = sqlite_engine();
        let (alice, _rx) = connect(&engine, 1, 16).await;

        assert!(engine.join(alice, uid(2)).await.unwrap().newly_joined);
        assert!(!engine.join(alice, uid(2)).await.unwrap().newly_joined);

        let channel = ChannelId::between(uid(1), uid(2)).unwrap();
        assert_eq!(engine.registry.members_of(&channel).await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_backfill_rolls_back_membership() {
        let engine = engine_with(Arc::new(UnreachableStore), DeliveryConfig::default());
        let (alice, mut rx) = connect(&engine, 1, 8).await;

        let err = engine.join(alice, uid(2)).await.unwrap_err();
        assert!(matches!(err, RelayError::Persistence(_)));

        let channel = ChannelId::between(uid(1), uid(2)).unwrap();
        assert!(engine.registry.members_of(&channel).await.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_join_self_is_invalid_pair() {
        let engine = sqlite_engine();
        let (alice, _rx) = connect(&engine, 1, 8).await;

        let err = engine.join(alice, uid(1)).await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidPair(1)));
    }

    #[tokio::test]
    async fn test_left_session_gets_nothing() {
        let engine = sqlite_engine();
        let (alice, mut rx) = connect(&engine, 1, 8).await;

        engine.join(alice, uid(2)).await.unwrap();
        expect_joined(rx.recv().await);
        engine.leave(alice, uid(2)).await.unwrap();

        engine.send(uid(2), uid(1), "unseen").await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stalled_member_does_not_block_others() {
        let config = DeliveryConfig {
            delivery_timeout: Duration::from_millis(100),
            ..DeliveryConfig::default()
        };
        let engine = engine_with(Arc::new(SqliteMessageStore::open_in_memory().unwrap()), config);

        // Capacity 1 and never drained after the join frame
        let (stalled, _stalled_rx) = connect(&engine, 1, 1).await;
        let (healthy, mut healthy_rx) = connect(&engine, 2, 16).await;
        engine.join(stalled, uid(2)).await.unwrap();
        engine.join(healthy, uid(1)).await.unwrap();
        expect_joined(healthy_rx.recv().await);

        let started = std::time::Instant::now();
        let message = engine.send(uid(2), uid(1), "still sent").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        let delivered = expect_delivery(healthy_rx.recv().await);
        assert_eq!(delivered, message);
    }

    #[tokio::test]
    async fn test_stalled_member_costs_at_most_one_timeout() {
        let timeout = Duration::from_millis(300);
        let config = DeliveryConfig {
            delivery_timeout: timeout,
            ..DeliveryConfig::default()
        };
        let engine = engine_with(Arc::new(SqliteMessageStore::open_in_memory().unwrap()), config);

        let (stalled, _stalled_rx) = connect(&engine, 1, 1).await;
        let (healthy, mut healthy_rx) = connect(&engine, 2, 16).await;
        engine.join(stalled, uid(2)).await.unwrap();
        engine.join(healthy, uid(1)).await.unwrap();
        expect_joined(healthy_rx.recv().await);

        let started = std::time::Instant::now();
        for i in 0..5 {
            engine.send(uid(2), uid(1), &format!("m{}", i)).await.unwrap();
        }
        let elapsed = started.elapsed();
        assert!(elapsed < timeout * 2, "five sends took {:?}", elapsed);

        for i in 0..5 {
            let delivered = expect_delivery(healthy_rx.recv().await);
            assert_eq!(delivered.content, format!("m{}", i));
        }
    }

    #[tokio::test]
    async fn test_unqueued_join_confirmation_rolls_back_membership() {
        let config = DeliveryConfig {
            delivery_timeout: Duration::from_millis(50),
            ..DeliveryConfig::default()
        };
        let engine = engine_with(Arc::new(SqliteMessageStore::open_in_memory().unwrap()), config);
        let (conn, _rx) = ClientConnection::new(1);
        conn.deliver(ProtocolMessage::Pong, Duration::from_millis(50))
            .await
            .unwrap();
        let alice = engine.registry.register(conn, uid(1)).await.unwrap();

        let err = engine.join(alice, uid(2)).await.unwrap_err();
        assert!(matches!(err, RelayError::Delivery(_)), "{:?}", err);

        let channel = ChannelId::between(uid(1), uid(2)).unwrap();
        assert!(engine.registry.members_of(&channel).await.is_empty());
        assert!(engine.registry.channels_of(alice).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_largest_user_id_round_trips() {
        let engine = sqlite_engine();
        let largest = uid(UserId::MAX);

        let sent = engine.send(uid(1), largest, "edge").await.unwrap();
        assert_eq!(sent.receiver_id, largest);
        assert_eq!(engine.history(largest, uid(1)).await.unwrap(), vec![sent]);
    }

    #[tokio::test]
    async fn test_disconnected_member_is_skipped() {
        let engine = sqlite_engine();
        let (conn, rx) = ClientConnection::new(8);
        let connection_id = conn.id();
        let session = engine.registry.register(conn, uid(1)).await.unwrap();
        engine.join(session, uid(2)).await.unwrap();
        drop(rx);

        engine.registry.unregister(connection_id).await.unwrap();
        let channel = ChannelId::between(uid(1), uid(2)).unwrap();
        assert!(engine.registry.members_of(&channel).await.is_empty());

        engine.send(uid(2), uid(1), "after disconnect").await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_sends_keep_persist_order() {
        let engine = Arc::new(sqlite_engine());
        let (alice, mut rx) = connect(&engine, 1, 256).await;
        engine.join(alice, uid(2)).await.unwrap();
        expect_joined(rx.recv().await);

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    let (from, to) = if i % 2 == 0 { (1, 2) } else { (2, 1) };
                    engine.send(uid(from), uid(to), &format!("m{}", i)).await.unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let mut ids = Vec::new();
        for _ in 0..20 {
            ids.push(expect_delivery(rx.recv().await).id);
        }
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(engine.ordering_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_join_during_sends_sees_each_message_once() {
        let engine = Arc::new(sqlite_engine());
        let (bob, mut bob_rx) = connect(&engine, 2, 256).await;

        let senders: Vec<_> = (0..40)
            .map(|i| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    let (from, to) = if i % 2 == 0 { (1, 2) } else { (2, 1) };
                    engine.send(uid(from), uid(to), &format!("m{}", i)).await.unwrap();
                })
            })
            .collect();

        tokio::task::yield_now().await;
        let outcome = engine.join(bob, uid(1)).await.unwrap();

        for task in senders {
            task.await.unwrap();
        }

        let (_, history) = expect_joined(bob_rx.recv().await);
        assert_eq!(history, outcome.history);

        let mut seen: Vec<i64> = history.iter().map(|m| m.id).collect();
        while let Ok(frame) = bob_rx.try_recv() {
            seen.push(expect_delivery(Some(frame)).id);
        }

        // Backlog then live stream: the persisted log, in order, exactly once
        let log: Vec<i64> = engine
            .history(uid(1), uid(2))
            .await
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(log.len(), 40);
        assert_eq!(seen, log);
    }
}
