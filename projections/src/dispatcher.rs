//! Checkpointed subscription dispatcher.
//!
//! # Overview
//!
//! The [`Dispatcher`] opens a live event feed through an injected
//! [`SubscriptionFactory`], starting just after the last processed position,
//! and runs every delivered envelope through a handler under an exception
//! policy:
//!
//! - [`ExceptionResolution::Retry`] re-invokes the handler with the same
//!   envelope and an incremented attempt number.
//! - [`ExceptionResolution::Ignore`] swallows the failure.
//! - [`ExceptionResolution::Abort`] (default) unsubscribes the feed.
//!
//! # Restart when ahead
//!
//! When the factory reports that the requested position is unknown to the
//! log (the projection is ahead, e.g. after the log was rebuilt), the
//! dispatcher runs the `before_restarting` hook and resubscribes from the
//! start of the log:
//!
//! ```text
//! subscribe(5) ──► factory(5) ── UnknownPosition ──► before_restarting()
//!                                                          │
//!                                                          ▼
//!                                     Active ◄── ok ── factory(-1)
//! ```
//!
//! Restart attempts run under the same exception policy, with no
//! subscription.

use eventide_core::event::{Event, EventEnvelope, START_OF_LOG};
use eventide_core::projection::BoxError;
use eventide_core::subscription::{
    BoxFuture, EventSink, Subscription, SubscriptionError, SubscriptionFactory,
};
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;

/// What to do after a handler or restart failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionResolution {
    /// Swallow the failure and continue with the next event.
    Ignore,
    /// Unsubscribe the feed.
    Abort,
    /// Run the failed operation again.
    Retry,
}

/// Lifecycle of a dispatched subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Closed by the owner.
    Unsubscribed,
    /// Waiting for the factory.
    Subscribing,
    /// Receiving events.
    Active,
    /// Re-running a failed handler.
    Retrying,
    /// Closed by the exception policy.
    Aborted,
}

/// Errors returned by [`Dispatcher::subscribe`].
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The requested position is unknown and restarting is disabled.
    #[error("Checkpoint at position {position} is ahead of the event log")]
    UnknownCheckpoint {
        /// Requested position.
        position: i64,
    },

    /// Restarting from the start of the log was aborted.
    #[error("Failed to restart subscription from the start of the log: {source}")]
    RestartFailed {
        /// Last restart failure.
        source: Box<DispatchError>,
    },

    /// The factory failed.
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    /// The `before_restarting` hook failed.
    #[error("Before-restart hook failed: {0}")]
    BeforeRestart(#[source] BoxError),
}

/// A failure escaping the per-event handler.
#[derive(Debug, thiserror::Error)]
#[error("Handler failed at position {position}: {source}")]
pub struct HandlerFailure {
    /// Position of the envelope being handled.
    pub position: i64,
    /// The handler's error.
    pub source: BoxError,
}

/// Exception policy: receives the current subscription (absent while
/// restarting), the failure and the 1-based attempt number.
pub type ExceptionHandler = Arc<
    dyn Fn(Option<&dyn Subscription>, &(dyn Error + Send + Sync + 'static), u32) -> ExceptionResolution
        + Send
        + Sync,
>;

/// Hook run after each successfully handled envelope.
pub type SuccessHandler = Arc<dyn Fn(Option<&dyn Subscription>) + Send + Sync>;

/// Hook run before resubscribing from the start of the log.
pub type BeforeRestarting = Arc<dyn Fn() -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

type EventHandler<E> =
    Arc<dyn Fn(EventEnvelope<E>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Exception policy retrying up to `max_attempts` times in total, then
/// aborting.
#[must_use]
pub fn retry_up_to(max_attempts: u32) -> ExceptionHandler {
    Arc::new(move |_: Option<&dyn Subscription>, _: &(dyn Error + Send + Sync + 'static), attempt: u32| {
        if attempt < max_attempts {
            ExceptionResolution::Retry
        } else {
            ExceptionResolution::Abort
        }
    })
}

/// Per-subscription options.
#[derive(Clone)]
pub struct SubscriptionOptions {
    /// Identifier handed to the factory.
    pub id: String,
    /// Resubscribe from the start of the log when the position is unknown.
    pub restart_when_ahead: bool,
    /// Hook run before resubscribing from the start of the log.
    pub before_restarting: Option<BeforeRestarting>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            id: "subscription".to_owned(),
            restart_when_ahead: true,
            before_restarting: None,
        }
    }
}

impl SubscriptionOptions {
    /// Default options with the given identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Enable or disable restarting when the position is unknown.
    #[must_use]
    pub const fn with_restart_when_ahead(mut self, restart_when_ahead: bool) -> Self {
        self.restart_when_ahead = restart_when_ahead;
        self
    }

    /// Run `hook` before resubscribing from the start of the log.
    #[must_use]
    pub fn with_before_restarting<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.before_restarting = Some(Arc::new(move || -> BoxFuture<'static, Result<(), BoxError>> {
            Box::pin(hook())
        }));
        self
    }
}

impl fmt::Debug for SubscriptionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionOptions")
            .field("id", &self.id)
            .field("restart_when_ahead", &self.restart_when_ahead)
            .field("before_restarting", &self.before_restarting.is_some())
            .finish()
    }
}

/// Shared control block of one dispatched subscription.
struct FeedControl {
    state: watch::Sender<SubscriptionState>,
    subscription: OnceLock<Arc<dyn Subscription>>,
    closed: AtomicBool,
}

impl FeedControl {
    fn new() -> Self {
        let (state, _) = watch::channel(SubscriptionState::Subscribing);
        Self {
            state,
            subscription: OnceLock::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn subscription(&self) -> Option<Arc<dyn Subscription>> {
        self.subscription.get().cloned()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Record the opened subscription. A feed closed while the factory was
    /// still running is unsubscribed here.
    fn attach(&self, subscription: Arc<dyn Subscription>) {
        if self.subscription.set(Arc::clone(&subscription)).is_err() {
            return;
        }
        if self.is_closed() {
            subscription.unsubscribe();
            return;
        }
        self.state.send_if_modified(|state| {
            let opening = *state == SubscriptionState::Subscribing;
            if opening {
                *state = SubscriptionState::Active;
            }
            opening
        });
    }

    fn close(&self, state: SubscriptionState) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(subscription) = self.subscription.get() {
            subscription.unsubscribe();
        }
        self.state.send_replace(state);
    }

    fn transition(&self, from: SubscriptionState, to: SubscriptionState) {
        self.state.send_if_modified(|state| {
            let matches = *state == from;
            if matches {
                *state = to;
            }
            matches
        });
    }
}

/// Per-event pipeline of one subscription.
struct Feed<E> {
    id: String,
    control: Arc<FeedControl>,
    handler: EventHandler<E>,
    exception_handler: ExceptionHandler,
    success_handler: Option<SuccessHandler>,
}

impl<E: Event> Feed<E> {
    async fn handle_event(&self, envelope: EventEnvelope<E>) {
        if self.control.is_closed() {
            return;
        }

        let mut attempt = 1;
        loop {
            let position = envelope.position;
            let failure = match (self.handler)(envelope.clone()).await {
                Ok(()) => {
                    self.control
                        .transition(SubscriptionState::Retrying, SubscriptionState::Active);
                    if let Some(on_success) = &self.success_handler {
                        on_success(self.control.subscription().as_deref());
                    }
                    return;
                }
                Err(source) => HandlerFailure { position, source },
            };

            let subscription = self.control.subscription();
            match (self.exception_handler)(subscription.as_deref(), &failure, attempt) {
                ExceptionResolution::Retry => {
                    tracing::warn!(
                        subscription = %self.id,
                        position,
                        attempt,
                        error = %failure,
                        "Retrying event handler"
                    );
                    self.control
                        .transition(SubscriptionState::Active, SubscriptionState::Retrying);
                    attempt += 1;
                }
                ExceptionResolution::Ignore => {
                    tracing::warn!(
                        subscription = %self.id,
                        position,
                        error = %failure,
                        "Ignoring event handler failure"
                    );
                    self.control
                        .transition(SubscriptionState::Retrying, SubscriptionState::Active);
                    return;
                }
                ExceptionResolution::Abort => {
                    tracing::error!(
                        subscription = %self.id,
                        position,
                        error = %failure,
                        "Projection exception was not handled. Event subscription has been cancelled"
                    );
                    self.control.close(SubscriptionState::Aborted);
                    return;
                }
            }
        }
    }
}

/// Handle to a dispatched subscription.
pub struct SubscriptionHandle {
    id: String,
    subscription: Arc<dyn Subscription>,
    control: Arc<FeedControl>,
}

impl SubscriptionHandle {
    /// Identifier the subscription was opened with.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The factory's subscription.
    #[must_use]
    pub fn subscription(&self) -> &Arc<dyn Subscription> {
        &self.subscription
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        *self.control.state.borrow()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.control.state.subscribe()
    }

    /// Whether the subscription was closed by the owner or the policy.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }

    /// Close the subscription. Idempotent.
    pub fn unsubscribe(&self) {
        self.control.close(SubscriptionState::Unsubscribed);
        tracing::info!(subscription = %self.id, "Unsubscribed");
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Opens subscriptions and supervises their handlers.
pub struct Dispatcher<E: Event> {
    factory: Arc<dyn SubscriptionFactory<E>>,
    exception_handler: ExceptionHandler,
    success_handler: Option<SuccessHandler>,
}

impl<E: Event> Clone for Dispatcher<E> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
            exception_handler: Arc::clone(&self.exception_handler),
            success_handler: self.success_handler.clone(),
        }
    }
}

impl<E: Event> Dispatcher<E> {
    /// Create a dispatcher that aborts on every failure.
    pub fn new(factory: Arc<dyn SubscriptionFactory<E>>) -> Self {
        Self {
            factory,
            exception_handler: Arc::new(
                |_: Option<&dyn Subscription>, _: &(dyn Error + Send + Sync + 'static), _: u32| {
                    ExceptionResolution::Abort
                },
            ),
            success_handler: None,
        }
    }

    /// Replace the exception policy.
    #[must_use]
    pub fn with_exception_handler(
        mut self,
        handler: impl Fn(Option<&dyn Subscription>, &(dyn Error + Send + Sync + 'static), u32) -> ExceptionResolution
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.exception_handler = Arc::new(handler);
        self
    }

    /// Use a shared exception policy such as [`retry_up_to`].
    #[must_use]
    pub fn with_shared_exception_handler(mut self, handler: ExceptionHandler) -> Self {
        self.exception_handler = handler;
        self
    }

    /// Run `handler` after every successfully handled envelope.
    #[must_use]
    pub fn with_success_handler(
        mut self,
        handler: impl Fn(Option<&dyn Subscription>) + Send + Sync + 'static,
    ) -> Self {
        self.success_handler = Some(Arc::new(handler));
        self
    }

    /// Open a feed just after `last_processed_position` and run `handler` on
    /// every delivered envelope.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::UnknownCheckpoint`] when the position is unknown and
    ///   `restart_when_ahead` is disabled.
    /// - [`DispatchError::RestartFailed`] when the exception policy aborts a
    ///   restart.
    /// - [`DispatchError::Subscription`] for any other factory failure.
    pub async fn subscribe<F, Fut>(
        &self,
        last_processed_position: i64,
        handler: F,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionHandle, DispatchError>
    where
        F: Fn(EventEnvelope<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let control = Arc::new(FeedControl::new());
        let feed = Arc::new(Feed {
            id: options.id.clone(),
            control: Arc::clone(&control),
            handler: Arc::new(
                move |envelope: EventEnvelope<E>| -> BoxFuture<'static, Result<(), BoxError>> {
                    Box::pin(handler(envelope))
                },
            ),
            exception_handler: Arc::clone(&self.exception_handler),
            success_handler: self.success_handler.clone(),
        });
        let sink: EventSink<E> = Arc::new(move |envelope: EventEnvelope<E>| -> BoxFuture<'static, ()> {
            let feed = Arc::clone(&feed);
            Box::pin(async move { feed.handle_event(envelope).await })
        });

        tracing::info!(
            subscription = %options.id,
            position = last_processed_position,
            "Opening subscription"
        );
        let subscription = match self.open(last_processed_position, &sink, &options).await {
            Ok(subscription) => subscription,
            Err(SubscriptionError::UnknownPosition { position }) if options.restart_when_ahead => {
                tracing::info!(
                    subscription = %options.id,
                    position,
                    "Checkpoint is ahead of the event log, restarting from the beginning"
                );
                self.restart(&sink, &options).await?
            }
            Err(SubscriptionError::UnknownPosition { position }) => {
                return Err(DispatchError::UnknownCheckpoint { position });
            }
            Err(error) => return Err(error.into()),
        };

        control.attach(Arc::clone(&subscription));
        Ok(SubscriptionHandle {
            id: options.id,
            subscription,
            control,
        })
    }

    async fn open(
        &self,
        position: i64,
        sink: &EventSink<E>,
        options: &SubscriptionOptions,
    ) -> Result<Arc<dyn Subscription>, SubscriptionError> {
        tracing::debug!(subscription = %options.id, position, "Requesting subscription");
        self.factory
            .create_subscription(position, Arc::clone(sink), options.id.clone())
            .await
    }

    async fn restart(
        &self,
        sink: &EventSink<E>,
        options: &SubscriptionOptions,
    ) -> Result<Arc<dyn Subscription>, DispatchError> {
        let mut attempt = 1;
        loop {
            let error = match self.restart_once(sink, options).await {
                Ok(subscription) => return Ok(subscription),
                Err(error) => error,
            };

            match (self.exception_handler)(None, &error, attempt) {
                ExceptionResolution::Retry => {
                    tracing::warn!(
                        subscription = %options.id,
                        attempt,
                        error = %error,
                        "Retrying projection restart"
                    );
                    attempt += 1;
                }
                ExceptionResolution::Abort => {
                    tracing::error!(
                        subscription = %options.id,
                        attempt,
                        error = %error,
                        "Failed to restart projection"
                    );
                    return Err(DispatchError::RestartFailed {
                        source: Box::new(error),
                    });
                }
                ExceptionResolution::Ignore => {
                    tracing::warn!(
                        subscription = %options.id,
                        error = %error,
                        "Ignoring restart failure, resubscribing from the beginning"
                    );
                    return Ok(self.open(START_OF_LOG, sink, options).await?);
                }
            }
        }
    }

    async fn restart_once(
        &self,
        sink: &EventSink<E>,
        options: &SubscriptionOptions,
    ) -> Result<Arc<dyn Subscription>, DispatchError> {
        if let Some(before_restarting) = &options.before_restarting {
            before_restarting().await.map_err(DispatchError::BeforeRestart)?;
        }
        Ok(self.open(START_OF_LOG, sink, options).await?)
    }
}

impl<E: Event> fmt::Debug for Dispatcher<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("success_handler", &self.success_handler.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use eventide_testing::ScriptedSubscriptionFactory;
    use std::sync::atomic::AtomicU32;

    #[derive(Clone, Debug, PartialEq)]
    struct Ping(u32);

    impl Event for Ping {
        fn event_type(&self) -> &'static str {
            "Ping"
        }
    }

    fn envelope(position: i64) -> EventEnvelope<Ping> {
        EventEnvelope::new(position, "pings", Ping(1))
    }

    #[tokio::test]
    async fn subscribes_just_after_position() {
        let factory = Arc::new(ScriptedSubscriptionFactory::<Ping>::new());
        let dispatcher = Dispatcher::new(factory.clone());

        let handle = dispatcher
            .subscribe(7, |_| async { Ok(()) }, SubscriptionOptions::new("pings"))
            .await
            .unwrap();

        assert_eq!(factory.requested_positions(), vec![7]);
        assert_eq!(factory.subscription_ids(), vec!["pings".to_owned()]);
        assert_eq!(handle.state(), SubscriptionState::Active);
    }

    #[tokio::test]
    async fn unknown_position_without_restart_is_fatal() {
        let factory = Arc::new(ScriptedSubscriptionFactory::<Ping>::new().rejecting_positions_above(0));
        let dispatcher = Dispatcher::new(factory.clone());

        let err = dispatcher
            .subscribe(
                5,
                |_| async { Ok(()) },
                SubscriptionOptions::default().with_restart_when_ahead(false),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::UnknownCheckpoint { position: 5 }));
        assert_eq!(factory.requested_positions(), vec![5]);
    }

    #[tokio::test]
    async fn failing_hook_is_retried_under_policy() {
        let factory = Arc::new(ScriptedSubscriptionFactory::<Ping>::new().rejecting_positions_above(0));
        let dispatcher = Dispatcher::new(factory.clone()).with_shared_exception_handler(retry_up_to(3));
        let calls = Arc::new(AtomicU32::new(0));
        let hook_calls = Arc::clone(&calls);

        let options = SubscriptionOptions::default().with_before_restarting(move || {
            let calls = Arc::clone(&hook_calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err::<(), BoxError>("not yet".into())
                } else {
                    Ok(())
                }
            }
        });
        let handle = dispatcher.subscribe(5, |_| async { Ok(()) }, options).await;

        assert!(handle.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(factory.requested_positions(), vec![5, -1]);
    }

    #[tokio::test]
    async fn aborted_restart_reports_restart_failure() {
        let factory = Arc::new(ScriptedSubscriptionFactory::<Ping>::new().rejecting_positions_above(0));
        let dispatcher = Dispatcher::new(factory.clone());
        let options = SubscriptionOptions::default()
            .with_before_restarting(|| async { Err::<(), BoxError>("storage offline".into()) });

        let err = dispatcher
            .subscribe(5, |_| async { Ok(()) }, options)
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::RestartFailed { .. }));
        assert_eq!(factory.requested_positions(), vec![5]);
    }

    #[tokio::test]
    async fn ignored_failure_keeps_feed_open() {
        let factory = Arc::new(ScriptedSubscriptionFactory::<Ping>::new());
        let dispatcher = Dispatcher::new(factory.clone())
            .with_exception_handler(|_, _, _| ExceptionResolution::Ignore);
        let handle = dispatcher
            .subscribe(
                START_OF_LOG,
                |envelope: EventEnvelope<Ping>| async move {
                    if envelope.position == 0 {
                        Err::<(), BoxError>("bad event".into())
                    } else {
                        Ok(())
                    }
                },
                SubscriptionOptions::default(),
            )
            .await
            .unwrap();

        factory.push(envelope(0)).await;
        factory.push(envelope(1)).await;

        assert_eq!(handle.state(), SubscriptionState::Active);
        assert!(!factory.subscriptions()[0].is_closed());
    }

    #[tokio::test]
    async fn success_handler_sees_subscription() {
        let factory = Arc::new(ScriptedSubscriptionFactory::<Ping>::new());
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        let dispatcher = Dispatcher::new(factory.clone()).with_success_handler(move |subscription| {
            if subscription.is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let _handle = dispatcher
            .subscribe(START_OF_LOG, |_| async { Ok(()) }, SubscriptionOptions::default())
            .await
            .unwrap();

        factory.push(envelope(0)).await;
        factory.push(envelope(1)).await;

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_observable() {
        let factory = Arc::new(ScriptedSubscriptionFactory::<Ping>::new());
        let dispatcher = Dispatcher::new(factory.clone());
        let handle = dispatcher
            .subscribe(START_OF_LOG, |_| async { Ok(()) }, SubscriptionOptions::default())
            .await
            .unwrap();
        let mut states = handle.watch_state();

        handle.unsubscribe();
        handle.unsubscribe();

        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), SubscriptionState::Unsubscribed);
        assert_eq!(factory.subscriptions()[0].unsubscribe_count(), 1);
    }
}
