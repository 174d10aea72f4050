use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tandem_chat::EventSink;
use tandem_kv::KvStore;
use tandem_types::events::{FanoutEnvelope, GatewayEvent, Topic};

use crate::dispatcher::Dispatcher;

/// Pub/sub channel every gateway process subscribes to.
pub const FANOUT_CHANNEL: &str = "tandem:fanout";

const RESUBSCRIBE_MIN_DELAY: Duration = Duration::from_millis(100);
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(5);

/// Cross-process [`EventSink`]: events are published on the shared channel
/// and each process delivers them to its own connections.
#[derive(Clone)]
pub struct Fanout {
    kv: Arc<dyn KvStore>,
    dispatcher: Dispatcher,
    /// Cleared while this process has no working subscription.
    subscribed: Arc<AtomicBool>,
}

impl Fanout {
    pub fn new(kv: Arc<dyn KvStore>, dispatcher: Dispatcher) -> Self {
        Self {
            kv,
            dispatcher,
            subscribed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Open the subscription. Events published after this returns are
    /// delivered once the subscriber runs.
    pub async fn subscribe(&self) -> Result<FanoutSubscriber> {
        let rx = self.kv.subscribe(FANOUT_CHANNEL).await?;
        self.subscribed.store(true, Ordering::SeqCst);
        Ok(FanoutSubscriber {
            rx,
            kv: self.kv.clone(),
            dispatcher: self.dispatcher.clone(),
            subscribed: self.subscribed.clone(),
        })
    }
}

#[async_trait]
impl EventSink for Fanout {
    async fn emit(&self, topic: Topic, event: GatewayEvent) {
        let envelope = FanoutEnvelope { topic, event };
        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode fan-out envelope: {}", e);
                return;
            }
        };

        match self.kv.publish(FANOUT_CHANNEL, &payload).await {
            // Published but nothing here listens; local sockets still get it.
            Ok(()) if !self.subscribed.load(Ordering::SeqCst) => {
                self.dispatcher
                    .deliver(envelope.topic, envelope.event)
                    .await;
            }
            Ok(()) => {}
            Err(e) => {
                // Other processes miss this one; local sockets still get it.
                warn!("Fan-out publish failed, delivering locally only: {}", e);
                self.dispatcher
                    .deliver(envelope.topic, envelope.event)
                    .await;
            }
        }
    }
}

/// Receives envelopes from every process and hands them to the local
/// dispatcher. A dropped subscription is reopened with backoff until
/// cancelled.
pub struct FanoutSubscriber {
    rx: mpsc::UnboundedReceiver<String>,
    kv: Arc<dyn KvStore>,
    dispatcher: Dispatcher,
    subscribed: Arc<AtomicBool>,
}

impl FanoutSubscriber {
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Fan-out subscriber listening on {}", FANOUT_CHANNEL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = self.rx.recv() => {
                    let Some(payload) = message else {
                        self.subscribed.store(false, Ordering::SeqCst);
                        warn!("Fan-out subscription closed, resubscribing");
                        match self.resubscribe(&cancel).await {
                            Some(rx) => {
                                self.rx = rx;
                                self.subscribed.store(true, Ordering::SeqCst);
                                info!("Fan-out subscription restored on {}", FANOUT_CHANNEL);
                                continue;
                            }
                            None => break,
                        }
                    };
                    match serde_json::from_str::<FanoutEnvelope>(&payload) {
                        Ok(envelope) => self.dispatcher.deliver(envelope.topic, envelope.event).await,
                        Err(e) => warn!("Ignoring malformed fan-out payload: {}", e),
                    }
                }
            }
        }
    }

    /// `None` once cancelled.
    async fn resubscribe(&self, cancel: &CancellationToken) -> Option<mpsc::UnboundedReceiver<String>> {
        let mut delay = RESUBSCRIBE_MIN_DELAY;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.kv.subscribe(FANOUT_CHANNEL).await {
                Ok(rx) => return Some(rx),
                Err(e) => warn!("Fan-out resubscribe failed: {}", e),
            }
            delay = (delay * 2).min(RESUBSCRIBE_MAX_DELAY);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tandem_kv::{KvResult, MemoryStore};
    use uuid::Uuid;

    /// Shares a [`MemoryStore`], but the first subscription it hands out is
    /// already closed, as after a dropped pub/sub connection.
    struct DroppedOnce {
        inner: Arc<MemoryStore>,
        subscriptions: AtomicUsize,
    }

    #[async_trait]
    impl KvStore for DroppedOnce {
        async fn rpush(&self, key: &str, value: &str) -> KvResult<usize> {
            self.inner.rpush(key, value).await
        }

        async fn lpush(&self, key: &str, value: &str) -> KvResult<usize> {
            self.inner.lpush(key, value).await
        }

        async fn lpop(&self, key: &str, count: usize) -> KvResult<Vec<String>> {
            self.inner.lpop(key, count).await
        }

        async fn lrange(&self, key: &str, start: isize, stop: isize) -> KvResult<Vec<String>> {
            self.inner.lrange(key, start, stop).await
        }

        async fn ltrim(&self, key: &str, start: isize, stop: isize) -> KvResult<()> {
            self.inner.ltrim(key, start, stop).await
        }

        async fn llen(&self, key: &str) -> KvResult<usize> {
            self.inner.llen(key).await
        }

        async fn lrem(&self, key: &str, value: &str) -> KvResult<usize> {
            self.inner.lrem(key, value).await
        }

        async fn drain_front(&self, key: &str, max: usize) -> KvResult<Vec<String>> {
            self.inner.drain_front(key, max).await
        }

        async fn get(&self, key: &str) -> KvResult<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> KvResult<()> {
            self.inner.set(key, value).await
        }

        async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
            self.inner.set_ex(key, value, ttl).await
        }

        async fn del(&self, key: &str) -> KvResult<bool> {
            self.inner.del(key).await
        }

        async fn mget(&self, keys: &[String]) -> KvResult<Vec<Option<String>>> {
            self.inner.mget(keys).await
        }

        async fn scan(&self, pattern: &str) -> KvResult<Vec<String>> {
            self.inner.scan(pattern).await
        }

        async fn publish(&self, channel: &str, payload: &str) -> KvResult<()> {
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self, channel: &str) -> KvResult<mpsc::UnboundedReceiver<String>> {
            if self.subscriptions.fetch_add(1, Ordering::SeqCst) == 0 {
                let (tx, rx) = mpsc::unbounded_channel();
                drop(tx);
                return Ok(rx);
            }
            self.inner.subscribe(channel).await
        }
    }

    #[tokio::test]
    async fn published_events_reach_local_user() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let dispatcher = Dispatcher::new();
        let fanout = Fanout::new(kv.clone(), dispatcher.clone());
        let cancel = CancellationToken::new();
        tokio::spawn(fanout.subscribe().await.unwrap().run(cancel.clone()));

        let user = Uuid::new_v4();
        let (_conn, mut rx) = dispatcher.register_connection(user).await;
        fanout.emit(Topic::User(user), GatewayEvent::MatchingTimeout).await;

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, GatewayEvent::MatchingTimeout);
        cancel.cancel();
    }

    #[tokio::test]
    async fn second_process_sees_the_same_event() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();

        let here = Dispatcher::new();
        let there = Dispatcher::new();
        let fanout_here = Fanout::new(kv.clone(), here.clone());
        let fanout_there = Fanout::new(kv.clone(), there.clone());
        tokio::spawn(fanout_here.subscribe().await.unwrap().run(cancel.clone()));
        tokio::spawn(fanout_there.subscribe().await.unwrap().run(cancel.clone()));

        let user = Uuid::new_v4();
        let (_conn, mut remote_rx) = there.register_connection(user).await;
        fanout_here
            .emit(
                Topic::Global,
                GatewayEvent::UserStatusChanged {
                    user_id: user,
                    online: true,
                },
            )
            .await;

        let event = tokio::time::timeout(Duration::from_secs(1), remote_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, GatewayEvent::UserStatusChanged { online: true, .. }));
        cancel.cancel();
    }

    #[tokio::test]
    async fn subscriber_recovers_from_a_dropped_subscription() {
        let shared = Arc::new(MemoryStore::new());
        let flaky = Arc::new(DroppedOnce {
            inner: shared.clone(),
            subscriptions: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();

        let here = Dispatcher::new();
        let fanout_here = Fanout::new(flaky.clone(), here.clone());
        tokio::spawn(fanout_here.subscribe().await.unwrap().run(cancel.clone()));
        let fanout_there = Fanout::new(shared, Dispatcher::new());

        let user = Uuid::new_v4();
        let (_conn, mut rx) = here.register_connection(user).await;

        // Events emitted elsewhere only arrive through a live subscription.
        let mut delivered = None;
        for _ in 0..40 {
            fanout_there.emit(Topic::User(user), GatewayEvent::MatchingTimeout).await;
            if let Ok(event) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
                delivered = event;
                break;
            }
        }
        assert_eq!(delivered, Some(GatewayEvent::MatchingTimeout));
        assert!(flaky.subscriptions.load(Ordering::SeqCst) >= 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn local_delivery_while_unsubscribed() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let dispatcher = Dispatcher::new();
        let fanout = Fanout::new(kv, dispatcher.clone());

        let user = Uuid::new_v4();
        let (_conn, mut rx) = dispatcher.register_connection(user).await;
        fanout.emit(Topic::User(user), GatewayEvent::MatchingTimeout).await;

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, GatewayEvent::MatchingTimeout);
    }
}
