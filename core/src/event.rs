//! Event traits and the envelope that carries events through a feed.
//!
//! Events are immutable facts read from an ordered, replayable log. Every
//! event carries an explicit type tag ([`Event::event_type`]) which the
//! router uses to select handlers. Individual variants of an event payload
//! can be addressed through [`EventVariant`], which pairs a static tag with a
//! borrowing extractor.
//!
//! # Example
//!
//! ```
//! use eventide_core::event::{Event, EventEnvelope, EventVariant};
//!
//! #[derive(Clone, Debug)]
//! struct ProductAdded { id: u64, name: String }
//!
//! #[derive(Clone, Debug)]
//! enum CatalogEvent {
//!     ProductAdded(ProductAdded),
//! }
//!
//! impl Event for CatalogEvent {
//!     fn event_type(&self) -> &'static str {
//!         match self {
//!             Self::ProductAdded(_) => ProductAdded::EVENT_TYPE,
//!         }
//!     }
//! }
//!
//! impl EventVariant<CatalogEvent> for ProductAdded {
//!     const EVENT_TYPE: &'static str = "ProductAdded";
//!
//!     fn from_event(event: &CatalogEvent) -> Option<&Self> {
//!         match event {
//!             CatalogEvent::ProductAdded(added) => Some(added),
//!         }
//!     }
//! }
//!
//! let envelope = EventEnvelope::new(
//!     7,
//!     "product-1",
//!     CatalogEvent::ProductAdded(ProductAdded { id: 1, name: "A".into() }),
//! );
//! assert_eq!(envelope.position, 7);
//! assert_eq!(envelope.body.event_type(), "ProductAdded");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Position used to request a feed from the very beginning of the log.
///
/// A checkpoint holding this value means the projection has never processed
/// an event.
pub const START_OF_LOG: i64 = -1;

/// Metadata attached to an envelope.
pub type Metadata = HashMap<String, serde_json::Value>;

/// An event payload that can be routed by type.
///
/// # Thread Safety
///
/// Events must be `Send + Sync + 'static` so envelopes can cross task
/// boundaries inside the dispatcher and the projector retry loop.
pub trait Event: Clone + fmt::Debug + Send + Sync + 'static {
    /// Stable type tag of this event, e.g. `"ProductAdded"`.
    fn event_type(&self) -> &'static str;
}

/// A single routable variant of an event payload.
///
/// Implemented for the struct carried by each enum variant so builders can
/// register typed handlers with `map::<V>()`.
pub trait EventVariant<E: Event>: Send + Sync + 'static {
    /// Descriptor under which handlers for this variant are registered.
    const EVENT_TYPE: &'static str;

    /// Borrow the variant out of the payload, if the payload is this variant.
    fn from_event(event: &E) -> Option<&Self>;
}

/// An event together with its log position and stream metadata.
///
/// `position` is the log-wide ordering authority. Within one feed envelopes
/// are non-decreasing in position, and envelopes at or below a projection's
/// checkpoint are skipped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    /// Log-wide position of the event.
    pub position: i64,
    /// Version of the event within its own stream.
    pub stream_version: i64,
    /// When the event was recorded.
    pub occurred_at: DateTime<Utc>,
    /// Identifier of the stream the event belongs to.
    pub stream_id: String,
    /// The typed event payload.
    pub body: E,
    /// Free-form metadata (correlation ids, tenant, user, ...).
    #[serde(default)]
    pub metadata: Metadata,
}

impl<E> EventEnvelope<E> {
    /// Create an envelope at `position` with version 0, no metadata and the
    /// current time.
    #[must_use]
    pub fn new(position: i64, stream_id: impl Into<String>, body: E) -> Self {
        Self {
            position,
            stream_version: 0,
            occurred_at: Utc::now(),
            stream_id: stream_id.into(),
            body,
            metadata: Metadata::new(),
        }
    }

    /// Set the stream version.
    #[must_use]
    pub const fn with_stream_version(mut self, stream_version: i64) -> Self {
        self.stream_version = stream_version;
        self
    }

    /// Set the recorded time.
    #[must_use]
    pub const fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    /// Attach one metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

impl<E: Event> EventEnvelope<E> {
    /// Type tag of the wrapped payload.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        self.body.event_type()
    }
}
