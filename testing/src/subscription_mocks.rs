//! Scripted subscriptions for dispatcher and manager tests
//!
//! [`ScriptedSubscriptionFactory`] records every subscription request and
//! delivers envelopes only when the test pushes them, so feeds are fully
//! deterministic: no background tasks, no timing.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use eventide_core::event::EventEnvelope;
use eventide_core::subscription::{
    BoxFuture, EventSink, Subscription, SubscriptionError, SubscriptionFactory,
};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Subscription handed out by [`ScriptedSubscriptionFactory`].
#[derive(Debug)]
pub struct TestSubscription {
    id: String,
    position: i64,
    unsubscribes: AtomicUsize,
}

impl TestSubscription {
    /// Create an open subscription.
    #[must_use]
    pub fn new(id: impl Into<String>, position: i64) -> Self {
        Self {
            id: id.into(),
            position,
            unsubscribes: AtomicUsize::new(0),
        }
    }

    /// Identifier the subscription was requested with.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Position the subscription was requested after.
    #[must_use]
    pub const fn position(&self) -> i64 {
        self.position
    }

    /// Number of `unsubscribe` calls.
    #[must_use]
    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }
}

impl Subscription for TestSubscription {
    fn unsubscribe(&self) {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.unsubscribe_count() > 0
    }
}

struct Feed<E> {
    subscription: Arc<TestSubscription>,
    sink: EventSink<E>,
}

/// Subscription factory driven by the test.
///
/// # Example
///
/// ```ignore
/// let factory = Arc::new(ScriptedSubscriptionFactory::new().rejecting_positions_above(0));
/// let dispatcher = Dispatcher::new(factory.clone());
///
/// let handle = dispatcher.subscribe(5, handler, SubscriptionOptions::default()).await?;
///
/// assert_eq!(factory.requested_positions(), vec![5, -1]);
/// factory.push(envelope).await;
/// ```
pub struct ScriptedSubscriptionFactory<E> {
    reject_above: Option<i64>,
    failing_requests: AtomicUsize,
    log: Mutex<Vec<EventEnvelope<E>>>,
    requests: Mutex<Vec<(i64, String)>>,
    feeds: Mutex<Vec<Feed<E>>>,
}

impl<E: Clone + Send + 'static> ScriptedSubscriptionFactory<E> {
    /// Create a factory accepting every position.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            reject_above: None,
            failing_requests: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            feeds: Mutex::new(Vec::new()),
        }
    }

    /// Fail requests after any position above `limit` with
    /// [`SubscriptionError::UnknownPosition`].
    #[must_use]
    pub fn rejecting_positions_above(mut self, limit: i64) -> Self {
        self.reject_above = Some(limit);
        self
    }

    /// Fail the next `count` requests with [`SubscriptionError::Transport`],
    /// before any position check.
    #[must_use]
    pub fn failing_next_requests(self, count: usize) -> Self {
        self.fail_next_requests(count);
        self
    }

    /// Fail the next `count` requests with [`SubscriptionError::Transport`].
    pub fn fail_next_requests(&self, count: usize) {
        self.failing_requests.store(count, Ordering::SeqCst);
    }

    /// Seed the log replayed by [`Self::catch_up`].
    #[must_use]
    pub fn with_log(self, envelopes: Vec<EventEnvelope<E>>) -> Self {
        *self.log.lock().unwrap() = envelopes;
        self
    }

    /// Append to the log replayed by [`Self::catch_up`].
    pub fn append(&self, envelope: EventEnvelope<E>) {
        self.log.lock().unwrap().push(envelope);
    }

    /// Positions of every request, in order, rejected ones included.
    #[must_use]
    pub fn requested_positions(&self) -> Vec<i64> {
        self.requests.lock().unwrap().iter().map(|(p, _)| *p).collect()
    }

    /// Identifiers of every request, in order.
    #[must_use]
    pub fn subscription_ids(&self) -> Vec<String> {
        self.requests.lock().unwrap().iter().map(|(_, id)| id.clone()).collect()
    }

    /// Subscriptions handed out, in order.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Arc<TestSubscription>> {
        self.feeds
            .lock()
            .unwrap()
            .iter()
            .map(|feed| Arc::clone(&feed.subscription))
            .collect()
    }

    fn latest_open(&self) -> Option<(Arc<TestSubscription>, EventSink<E>)> {
        self.feeds
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|feed| !feed.subscription.is_closed())
            .map(|feed| (Arc::clone(&feed.subscription), Arc::clone(&feed.sink)))
    }

    /// Deliver `envelope` to the most recent open subscription and wait for
    /// its handler. Returns whether anything received it.
    pub async fn push(&self, envelope: EventEnvelope<E>) -> bool {
        let Some((_, sink)) = self.latest_open() else {
            tracing::debug!("No open subscription, dropping envelope");
            return false;
        };
        sink(envelope).await;
        true
    }

    /// Deliver every log entry past the most recent open subscription's
    /// position, stopping early if the subscription closes. Returns the
    /// number delivered.
    pub async fn catch_up(&self) -> usize {
        let Some((subscription, sink)) = self.latest_open() else {
            return 0;
        };
        let backlog: Vec<EventEnvelope<E>> = self
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|envelope| envelope.position > subscription.position())
            .cloned()
            .collect();

        let mut delivered = 0;
        for envelope in backlog {
            if subscription.is_closed() {
                break;
            }
            sink(envelope).await;
            delivered += 1;
        }
        delivered
    }
}

impl<E: Clone + Send + 'static> Default for ScriptedSubscriptionFactory<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + 'static> SubscriptionFactory<E> for ScriptedSubscriptionFactory<E> {
    fn create_subscription(
        &self,
        last_position: i64,
        sink: EventSink<E>,
        subscription_id: String,
    ) -> BoxFuture<'_, Result<Arc<dyn Subscription>, SubscriptionError>> {
        Box::pin(async move {
            self.requests
                .lock()
                .unwrap()
                .push((last_position, subscription_id.clone()));

            let transport_down = self
                .failing_requests
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if transport_down {
                tracing::debug!(position = last_position, "Injecting transport failure");
                return Err(SubscriptionError::Transport(format!(
                    "connection refused opening {subscription_id}"
                )));
            }

            if self.reject_above.is_some_and(|limit| last_position > limit) {
                tracing::debug!(position = last_position, "Rejecting unknown position");
                return Err(SubscriptionError::UnknownPosition {
                    position: last_position,
                });
            }

            let subscription = Arc::new(TestSubscription::new(subscription_id, last_position));
            self.feeds.lock().unwrap().push(Feed {
                subscription: Arc::clone(&subscription),
                sink,
            });
            Ok(subscription as Arc<dyn Subscription>)
        })
    }
}

impl<E> fmt::Debug for ScriptedSubscriptionFactory<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedSubscriptionFactory")
            .field("reject_above", &self.reject_above)
            .field("requests", &*self.requests.lock().unwrap())
            .finish_non_exhaustive()
    }
}
