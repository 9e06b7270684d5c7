//! Contract between the dispatcher and the event-log transport.
//!
//! The transport is an external collaborator. It is handed a sink and pushes
//! every envelope past the requested position into it, in order, until the
//! subscription is cancelled.

use crate::event::EventEnvelope;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Callback the transport pushes envelopes into.
///
/// The returned future completes once the envelope has been fully handled;
/// transports deliver the next envelope only after that.
pub type EventSink<E> = Arc<dyn Fn(EventEnvelope<E>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Errors reported by a [`SubscriptionFactory`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// The requested position does not exist in the log, typically because
    /// the checkpoint is ahead of a truncated or recreated log.
    #[error("No such position in the event log: {position}")]
    UnknownPosition {
        /// The rejected position.
        position: i64,
    },

    /// Any other transport failure.
    #[error("Subscription transport error: {0}")]
    Transport(String),
}

/// A live feed.
pub trait Subscription: Send + Sync {
    /// Stop delivery. Synchronous and terminal.
    fn unsubscribe(&self);

    /// Whether [`Subscription::unsubscribe`] has been called.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Opens feeds on the event log.
pub trait SubscriptionFactory<E>: Send + Sync {
    /// Open a feed delivering every envelope after `last_position`.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::UnknownPosition`] when `last_position`
    /// is not part of the log.
    fn create_subscription(
        &self,
        last_position: i64,
        sink: EventSink<E>,
        subscription_id: String,
    ) -> BoxFuture<'_, Result<Arc<dyn Subscription>, SubscriptionError>>;
}
