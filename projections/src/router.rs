//! Type-keyed event routing.
//!
//! An [`EventRouter`] maps an event to the first route registered under the
//! event's type key. Routing runs in two stages:
//!
//! 1. Every global filter must accept the event (short-circuiting on the
//!    first rejection).
//! 2. The event's type key is derived and the **first** route registered
//!    under that key is selected. There is no fan-out.
//!
//! The selected route's own predicates are evaluated afterwards by the
//! caller via [`Route::accepts`]; a route whose predicates reject the event
//! still counts as selected.
//!
//! Type keys are derived by two injectable functions: one for descriptors
//! used at registration time and one for runtime events. By default a
//! descriptor is its own key and an event's key is [`Event::event_type`].

use eventide_core::event::Event;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Predicate evaluated against an event and its context.
pub type Predicate<E, C> = Arc<dyn Fn(&E, &C) -> bool + Send + Sync>;

/// Derives the type key of a runtime event.
pub type TypeFromEvent<E> = Arc<dyn Fn(&E) -> String + Send + Sync>;

/// Derives the type key of a registration descriptor.
pub type TypeFromDescriptor = Arc<dyn Fn(&'static str) -> String + Send + Sync>;

/// An action guarded by an ordered list of predicates.
pub struct Route<E, C, A> {
    predicates: Vec<Predicate<E, C>>,
    action: A,
}

impl<E, C, A> Route<E, C, A> {
    /// Create an unguarded route.
    #[must_use]
    pub const fn new(action: A) -> Self {
        Self {
            predicates: Vec::new(),
            action,
        }
    }

    /// Create a route guarded by `predicates`.
    #[must_use]
    pub const fn guarded(predicates: Vec<Predicate<E, C>>, action: A) -> Self {
        Self { predicates, action }
    }

    /// Whether every predicate accepts the event.
    pub fn accepts(&self, event: &E, ctx: &C) -> bool {
        self.predicates.iter().all(|predicate| predicate(event, ctx))
    }

    /// The routed action.
    pub const fn action(&self) -> &A {
        &self.action
    }
}

/// Routing table keyed by event type.
pub struct EventRouter<E, C, A> {
    routes: HashMap<String, Vec<Arc<Route<E, C, A>>>>,
    filters: Vec<Predicate<E, C>>,
    type_from_event: TypeFromEvent<E>,
    type_from_descriptor: TypeFromDescriptor,
}

impl<E: Event, C, A> Default for EventRouter<E, C, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event, C, A> EventRouter<E, C, A> {
    /// Create an empty router using the default type-key functions.
    #[must_use]
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            filters: Vec::new(),
            type_from_event: Arc::new(|event: &E| event.event_type().to_owned()),
            type_from_descriptor: Arc::new(|descriptor: &'static str| descriptor.to_owned()),
        }
    }
}

impl<E, C, A> EventRouter<E, C, A> {
    /// Replace the function deriving a runtime event's type key.
    #[must_use]
    pub fn with_type_from_event(mut self, type_from_event: TypeFromEvent<E>) -> Self {
        self.type_from_event = type_from_event;
        self
    }

    /// Replace the function deriving a descriptor's type key.
    ///
    /// Must be set before routes are added; existing keys are not rewritten.
    #[must_use]
    pub fn with_type_from_descriptor(mut self, type_from_descriptor: TypeFromDescriptor) -> Self {
        self.type_from_descriptor = type_from_descriptor;
        self
    }

    /// Register `route` under every descriptor, preserving registration order.
    pub fn add(&mut self, descriptors: &[&'static str], route: Route<E, C, A>) {
        let route = Arc::new(route);
        for descriptor in descriptors {
            let key = (self.type_from_descriptor)(*descriptor);
            self.routes.entry(key).or_default().push(Arc::clone(&route));
        }
    }

    /// Append a global filter.
    pub fn add_filter(&mut self, filter: Predicate<E, C>) {
        self.filters.push(filter);
    }

    /// Select the route for `event`, if every global filter accepts it.
    pub fn route(&self, event: &E, ctx: &C) -> Option<&Route<E, C, A>> {
        if !self.filters.iter().all(|filter| filter(event, ctx)) {
            return None;
        }
        let key = (self.type_from_event)(event);
        let route = self.routes.get(&key)?.first()?;
        Some(route.as_ref())
    }

    /// Type keys with at least one route.
    pub fn registered_types(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Number of routes registered under `key`.
    #[must_use]
    pub fn route_count(&self, key: &str) -> usize {
        self.routes.get(key).map_or(0, Vec::len)
    }
}

impl<E, C, A> fmt::Debug for EventRouter<E, C, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        types.sort_unstable();
        f.debug_struct("EventRouter")
            .field("types", &types)
            .field("filters", &self.filters.len())
            .finish_non_exhaustive()
    }
}
