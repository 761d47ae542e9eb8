// Deduplicated query polling
//
// One poller task per distinct query string, shared by every subscriber of
// that string. The topic table is guarded by a single RwLock: subscribe and
// unsubscribe take it for writing, broadcasts hold it for reading. A poller
// is started by the first subscription on its query and cancelled by the
// last unsubscribe, or by the root token when the controller shuts down.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::MetricsBackend;
use crate::metrics;

/// Samples buffered per subscriber before the poller waits on it
pub const SUBSCRIBER_BUFFER: usize = 10;

/// Fan-out of periodic query results to any number of subscribers
#[derive(Clone)]
pub struct QueryPubSub {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn MetricsBackend>,
    interval: Duration,
    root: CancellationToken,
    topics: RwLock<HashMap<String, Topic>>,
    next_id: AtomicU64,
}

struct Topic {
    subscribers: HashMap<u64, mpsc::Sender<f64>>,

    /// Stops this topic's poller
    cancel: CancellationToken,

    /// Id of the subscription that created the topic. A poller only ever
    /// touches the topic it was started for, never a later one on the same
    /// query string.
    generation: u64,
}

/// Receiving end of one subscription
#[derive(Debug)]
pub struct Subscription {
    query: String,
    id: u64,
    rx: mpsc::Receiver<f64>,
}

impl Subscription {
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Next sample, or `None` once the poller has shut down
    pub async fn recv(&mut self) -> Option<f64> {
        self.rx.recv().await
    }

    /// A sample that is already buffered, without waiting
    pub fn try_recv(&mut self) -> Option<f64> {
        self.rx.try_recv().ok()
    }
}

impl QueryPubSub {
    /// Create an empty pub/sub. Pollers run until `root` is cancelled at the latest.
    pub fn new(backend: Arc<dyn MetricsBackend>, interval: Duration, root: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                interval,
                root,
                topics: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Subscribe to `query`, starting its poller if nobody polls it yet
    pub async fn subscribe(&self, query: impl Into<String>) -> Subscription {
        let query = query.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

        let mut topics = self.inner.topics.write().await;
        match topics.get_mut(&query) {
            Some(topic) => {
                topic.subscribers.insert(id, tx);
            }
            None => {
                let cancel = self.inner.root.child_token();
                topics.insert(
                    query.clone(),
                    Topic {
                        subscribers: HashMap::from([(id, tx)]),
                        cancel: cancel.clone(),
                        generation: id,
                    },
                );
                metrics::ACTIVE_POLLERS.inc();
                tokio::spawn(poll_query(self.inner.clone(), query.clone(), id, cancel));
                debug!(query = %query, "Started poller");
            }
        }
        metrics::ACTIVE_SUBSCRIPTIONS.inc();

        Subscription { query, id, rx }
    }

    /// Drop a subscription. The last one out stops the poller. Unknown
    /// subscriptions (e.g. already closed by shutdown) are ignored.
    pub async fn unsubscribe(&self, subscription: Subscription) {
        let Subscription { query, id, rx } = subscription;

        // Close the stream before taking the lock, so a broadcast blocked on
        // this subscriber's full buffer fails fast and releases its read guard
        drop(rx);

        let mut topics = self.inner.topics.write().await;
        let Some(topic) = topics.get_mut(&query) else {
            return;
        };
        if topic.subscribers.remove(&id).is_none() {
            return;
        }
        metrics::ACTIVE_SUBSCRIPTIONS.dec();

        if topic.subscribers.is_empty() {
            topic.cancel.cancel();
            topics.remove(&query);
            debug!(query = %query, "Stopped poller, no subscribers left");
        }
    }

    /// Queries that currently have a poller
    pub async fn active_queries(&self) -> Vec<String> {
        let topics = self.inner.topics.read().await;
        let mut queries: Vec<_> = topics.keys().cloned().collect();
        queries.sort();
        queries
    }

    pub async fn subscriber_count(&self, query: &str) -> usize {
        self.inner
            .topics
            .read()
            .await
            .get(query)
            .map_or(0, |t| t.subscribers.len())
    }
}

impl Inner {
    /// Deliver `value` to every subscriber of the topic. Returns false when
    /// the poller was cancelled while waiting on a full buffer.
    async fn broadcast(&self, query: &str, generation: u64, value: f64, cancel: &CancellationToken) -> bool {
        let topics = self.topics.read().await;
        let Some(topic) = topics.get(query).filter(|t| t.generation == generation) else {
            return true;
        };

        for (id, tx) in &topic.subscribers {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                sent = tx.send(value) => {
                    if sent.is_err() {
                        trace!(query = %query, subscriber = id, "Subscriber stream already closed");
                    }
                }
            }
        }
        true
    }

    /// Remove the topic a poller was started for, closing its streams
    async fn close_topic(&self, query: &str, generation: u64) {
        let mut topics = self.topics.write().await;
        if topics.get(query).is_some_and(|t| t.generation == generation) {
            if let Some(topic) = topics.remove(query) {
                metrics::ACTIVE_SUBSCRIPTIONS.sub(topic.subscribers.len() as i64);
            }
        }
    }
}

async fn poll_query(inner: Arc<Inner>, query: String, generation: u64, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = inner.backend.query(&query, Utc::now()) => result,
        };
        metrics::QUERY_POLLS_TOTAL.inc();

        let value = match result.and_then(|v| v.to_scalar()) {
            Ok(value) => value,
            Err(e) => {
                metrics::QUERY_POLL_ERRORS_TOTAL.inc();
                warn!(query = %query, error = %e, "Query failed, will retry on next tick");
                continue;
            }
        };

        if !inner.broadcast(&query, generation, value, &cancel).await {
            break;
        }
    }

    // Normally the last unsubscribe already removed the topic. On root
    // shutdown it is still there, and removing it closes every stream.
    inner.close_topic(&query, generation).await;
    metrics::ACTIVE_POLLERS.dec();
    debug!(query = %query, "Poller exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promquery::{QueryValue, ScriptedBackend};

    fn pubsub(backend: Arc<ScriptedBackend>, root: CancellationToken) -> QueryPubSub {
        QueryPubSub::new(backend, Duration::from_millis(10), root)
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_share_one_poller() {
        let backend = Arc::new(ScriptedBackend::new().with_countdown("q", 10.0, 1.0));
        let ps = pubsub(backend.clone(), CancellationToken::new());

        let mut a = ps.subscribe("q").await;
        let mut b = ps.subscribe("q").await;
        assert_eq!(ps.active_queries().await, vec!["q".to_string()]);
        assert_eq!(ps.subscriber_count("q").await, 2);

        for expected in [9.0, 8.0, 7.0] {
            assert_eq!(a.recv().await, Some(expected));
            assert_eq!(b.recv().await, Some(expected));
        }
        assert_eq!(backend.calls("q"), 3);

        ps.unsubscribe(a).await;
        ps.unsubscribe(b).await;
        assert!(ps.active_queries().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_unsubscribe_stops_polling() {
        let backend = Arc::new(ScriptedBackend::new().with_constant("q", 1.0));
        let ps = pubsub(backend.clone(), CancellationToken::new());

        let mut sub = ps.subscribe("q").await;
        assert_eq!(sub.recv().await, Some(1.0));
        ps.unsubscribe(sub).await;

        let calls = backend.calls("q");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(backend.calls("q"), calls);
        assert_eq!(ps.subscriber_count("q").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_queries_get_distinct_pollers() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with_constant("q1", 1.0)
                .with_constant("q2", 2.0),
        );
        let ps = pubsub(backend, CancellationToken::new());

        let mut s1 = ps.subscribe("q1").await;
        let mut s2 = ps.subscribe("q2").await;
        assert_eq!(s1.recv().await, Some(1.0));
        assert_eq!(s2.recv().await, Some(2.0));
        assert_eq!(ps.active_queries().await.len(), 2);

        ps.unsubscribe(s1).await;
        assert_eq!(ps.active_queries().await, vec!["q2".to_string()]);
        ps.unsubscribe(s2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_and_non_scalars_are_skipped() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with_error("broken", "timeout")
                .with_value("vec", QueryValue::Vector(vec![])),
        );
        let ps = pubsub(backend.clone(), CancellationToken::new());

        let mut broken = ps.subscribe("broken").await;
        let mut non_scalar = ps.subscribe("vec").await;
        tokio::time::sleep(Duration::from_millis(55)).await;

        assert!(backend.calls("broken") >= 5);
        assert!(backend.calls("vec") >= 5);
        assert_eq!(broken.try_recv(), None);
        assert_eq!(non_scalar.try_recv(), None);

        ps.unsubscribe(broken).await;
        ps.unsubscribe(non_scalar).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_root_cancel_closes_streams() {
        let root = CancellationToken::new();
        let backend = Arc::new(ScriptedBackend::new().with_constant("q", 1.0));
        let ps = pubsub(backend, root.clone());

        let mut sub = ps.subscribe("q").await;
        assert_eq!(sub.recv().await, Some(1.0));

        root.cancel();
        // drain whatever was buffered, then observe closure
        while sub.recv().await.is_some() {}
        assert!(ps.active_queries().await.is_empty());

        // unsubscribing after shutdown is a no-op
        ps.unsubscribe(sub).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_after_teardown_starts_fresh_poller() {
        let backend = Arc::new(ScriptedBackend::new().with_countdown("q", 100.0, 1.0));
        let ps = pubsub(backend.clone(), CancellationToken::new());

        let mut first = ps.subscribe("q").await;
        assert_eq!(first.recv().await, Some(99.0));
        ps.unsubscribe(first).await;

        let mut second = ps.subscribe("q").await;
        assert_eq!(second.recv().await, Some(98.0));
        assert_eq!(ps.subscriber_count("q").await, 1);
        ps.unsubscribe(second).await;
    }
}
