//! Fluent registration of event handlers.
//!
//! Two builders produce immutable routing tables:
//!
//! - [`EventMapBuilder`] registers synchronous handlers and builds an
//!   [`EventMap`].
//! - [`EntityEventMapBuilder`] registers create/update/delete actions on a
//!   [`Projection`] type and builds an [`EntityEventMap`] that applies them
//!   through a [`ProjectionMerge`].
//!
//! Registrations are collected first and turned into a router by `build()`,
//! so type-key functions apply to every registration regardless of the
//! order in which they were configured.
//!
//! # Example
//!
//! ```ignore
//! let mut builder = EntityEventMapBuilder::<Product, CatalogEvent, ProjectionContext>::new();
//!
//! builder
//!     .map::<ProductAdded>()
//!     .as_create_of(|e, _| e.id)
//!     .overwriting_duplicates()
//!     .using(|p, e, _| p.name = e.name.clone());
//!
//! builder
//!     .map::<PriceSet>()
//!     .as_update_of(|e, _| e.id)
//!     .creating_if_missing()
//!     .using(|p, e, _| p.price = e.price);
//!
//! builder.map::<ProductRemoved>().as_delete_of(|e, _| e.id).ignoring_misses();
//!
//! let map = builder.build();
//! ```

use crate::cache::ProjectionCache;
use crate::merge::{MergeOps, ProjectionMerge};
use crate::router::{EventRouter, Predicate, Route, TypeFromDescriptor, TypeFromEvent};
use eventide_core::event::{Event, EventVariant};
use eventide_core::projection::{
    BoxError, MissOperation, Projection, ProjectionError, ProjectionRepository, Result,
};
use eventide_core::subscription::BoxFuture;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Synchronous handler stored in an [`EventMap`].
pub type Handler<E, C> = Arc<dyn Fn(&E, &C) -> std::result::Result<(), BoxError> + Send + Sync>;

type KeyFn<P, E, C> = Arc<dyn Fn(&E, &C) -> Option<<P as Projection>::Key> + Send + Sync>;
type MutateFn<P, E, C> = Arc<dyn Fn(&mut P, &E, &C) + Send + Sync>;
type CustomFn<P, E, C> = Arc<
    dyn for<'a> Fn(&'a E, &'a C, &'a mut dyn MergeOps<P>) -> BoxFuture<'a, Result<()>>
        + Send
        + Sync,
>;

struct Registration<E, C, A> {
    descriptors: Vec<&'static str>,
    predicates: Vec<Predicate<E, C>>,
    action: A,
}

struct Routing<E, C, A> {
    filters: Vec<Predicate<E, C>>,
    type_from_event: Option<TypeFromEvent<E>>,
    type_from_descriptor: Option<TypeFromDescriptor>,
    registrations: Vec<Registration<E, C, A>>,
}

impl<E: Event, C, A> Routing<E, C, A> {
    const fn new() -> Self {
        Self {
            filters: Vec::new(),
            type_from_event: None,
            type_from_descriptor: None,
            registrations: Vec::new(),
        }
    }

    fn into_router(self) -> EventRouter<E, C, A> {
        let mut router = EventRouter::new();
        if let Some(type_from_event) = self.type_from_event {
            router = router.with_type_from_event(type_from_event);
        }
        if let Some(type_from_descriptor) = self.type_from_descriptor {
            router = router.with_type_from_descriptor(type_from_descriptor);
        }
        for filter in self.filters {
            router.add_filter(filter);
        }
        for registration in self.registrations {
            router.add(
                &registration.descriptors,
                Route::guarded(registration.predicates, registration.action),
            );
        }
        router
    }
}

fn variant_predicate<E, C, V>(predicate: impl Fn(&V, &C) -> bool + Send + Sync + 'static) -> Predicate<E, C>
where
    E: Event,
    C: 'static,
    V: EventVariant<E>,
{
    Arc::new(move |event: &E, ctx: &C| V::from_event(event).is_some_and(|variant| predicate(variant, ctx)))
}

// ============================================================================
// Generic event map
// ============================================================================

/// Immutable table of synchronous handlers.
pub struct EventMap<E, C> {
    router: EventRouter<E, C, Handler<E, C>>,
}

impl<E, C> EventMap<E, C> {
    /// Run the handler selected for `event`.
    ///
    /// Returns `true` when a handler was selected, even if its own `when`
    /// predicates then declined the event.
    ///
    /// # Errors
    ///
    /// Returns the handler's error.
    pub fn handle(&self, event: &E, ctx: &C) -> std::result::Result<bool, BoxError> {
        let Some(route) = self.router.route(event, ctx) else {
            return Ok(false);
        };
        if route.accepts(event, ctx) {
            (route.action())(event, ctx)?;
        }
        Ok(true)
    }

    /// The underlying router.
    pub const fn router(&self) -> &EventRouter<E, C, Handler<E, C>> {
        &self.router
    }
}

impl<E, C> fmt::Debug for EventMap<E, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventMap").field("router", &self.router).finish()
    }
}

/// Builder for [`EventMap`].
pub struct EventMapBuilder<E, C> {
    routing: Routing<E, C, Handler<E, C>>,
}

impl<E, C> Default for EventMapBuilder<E, C>
where
    E: Event,
    C: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E, C> EventMapBuilder<E, C>
where
    E: Event,
    C: Send + Sync + 'static,
{
    /// Create an empty builder.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            routing: Routing::new(),
        }
    }

    /// Add a global filter every event must pass before routing.
    pub fn filter(&mut self, predicate: impl Fn(&E, &C) -> bool + Send + Sync + 'static) -> &mut Self {
        self.routing.filters.push(Arc::new(predicate));
        self
    }

    /// Derive runtime type keys with `type_from_event`.
    pub fn with_event_type_from_event(
        &mut self,
        type_from_event: impl Fn(&E) -> String + Send + Sync + 'static,
    ) -> &mut Self {
        self.routing.type_from_event = Some(Arc::new(type_from_event));
        self
    }

    /// Derive registration type keys with `type_from_descriptor`.
    pub fn with_event_type_from_descriptor(
        &mut self,
        type_from_descriptor: impl Fn(&'static str) -> String + Send + Sync + 'static,
    ) -> &mut Self {
        self.routing.type_from_descriptor = Some(Arc::new(type_from_descriptor));
        self
    }

    /// Start mapping the variant `V`.
    pub fn map<V: EventVariant<E>>(&mut self) -> Action<'_, E, C, V> {
        Action {
            routing: &mut self.routing,
            predicates: Vec::new(),
            _variant: PhantomData,
        }
    }

    /// Start mapping several event types to one handler on the raw event.
    pub fn map_types(&mut self, descriptors: &[&'static str]) -> UntypedAction<'_, E, C> {
        UntypedAction {
            routing: &mut self.routing,
            descriptors: descriptors.to_vec(),
            predicates: Vec::new(),
        }
    }

    /// Freeze the registrations into an [`EventMap`].
    #[must_use]
    pub fn build(self) -> EventMap<E, C> {
        EventMap {
            router: self.routing.into_router(),
        }
    }
}

/// Pending registration of a typed handler.
#[must_use = "the variant is only mapped once `apply` is called"]
pub struct Action<'b, E, C, V> {
    routing: &'b mut Routing<E, C, Handler<E, C>>,
    predicates: Vec<Predicate<E, C>>,
    _variant: PhantomData<fn() -> V>,
}

impl<E, C, V> Action<'_, E, C, V>
where
    E: Event,
    C: Send + Sync + 'static,
    V: EventVariant<E>,
{
    /// Only run the handler when `predicate` accepts the event.
    pub fn when(mut self, predicate: impl Fn(&V, &C) -> bool + Send + Sync + 'static) -> Self {
        self.predicates.push(variant_predicate::<E, C, V>(predicate));
        self
    }

    /// Register `handler`.
    pub fn apply(
        self,
        handler: impl Fn(&V, &C) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    ) {
        let action: Handler<E, C> = Arc::new(move |event: &E, ctx: &C| match V::from_event(event) {
            Some(variant) => handler(variant, ctx),
            None => Ok(()),
        });
        self.routing.registrations.push(Registration {
            descriptors: vec![V::EVENT_TYPE],
            predicates: self.predicates,
            action,
        });
    }
}

/// Pending registration of a handler on several raw event types.
#[must_use = "the types are only mapped once `apply` is called"]
pub struct UntypedAction<'b, E, C> {
    routing: &'b mut Routing<E, C, Handler<E, C>>,
    descriptors: Vec<&'static str>,
    predicates: Vec<Predicate<E, C>>,
}

impl<E, C> UntypedAction<'_, E, C>
where
    E: Event,
    C: Send + Sync + 'static,
{
    /// Only run the handler when `predicate` accepts the event.
    pub fn when(mut self, predicate: impl Fn(&E, &C) -> bool + Send + Sync + 'static) -> Self {
        self.predicates.push(Arc::new(predicate));
        self
    }

    /// Register `handler`.
    pub fn apply(
        self,
        handler: impl Fn(&E, &C) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    ) {
        self.routing.registrations.push(Registration {
            descriptors: self.descriptors,
            predicates: self.predicates,
            action: Arc::new(handler),
        });
    }
}

// ============================================================================
// Entity event map
// ============================================================================

pub(crate) enum OnDuplicate<P, E, C> {
    Fail,
    Ignore,
    Overwrite,
    Custom(Arc<dyn Fn(&P, &E, &C) -> bool + Send + Sync>),
}

impl<P: Projection, E, C> OnDuplicate<P, E, C> {
    fn should_overwrite(&self, existing: &P, event: &E, ctx: &C) -> Result<bool> {
        match self {
            Self::Fail => Err(ProjectionError::duplicate_key(existing.key())),
            Self::Ignore => Ok(false),
            Self::Overwrite => Ok(true),
            Self::Custom(decide) => Ok(decide(existing, event, ctx)),
        }
    }
}

pub(crate) enum OnUpdateMiss<P: Projection, E, C> {
    Fail,
    Ignore,
    Create,
    Custom(Arc<dyn Fn(&P::Key, &E, &C) -> bool + Send + Sync>),
}

impl<P: Projection, E, C> OnUpdateMiss<P, E, C> {
    fn create_if_missing(&self, key: &P::Key, event: &E, ctx: &C) -> Result<bool> {
        match self {
            Self::Fail => Err(ProjectionError::missing_key(key, MissOperation::Update)),
            Self::Ignore => Ok(false),
            Self::Create => Ok(true),
            Self::Custom(decide) => Ok(decide(key, event, ctx)),
        }
    }
}

type DeleteMissFn<P, E, C> =
    Arc<dyn Fn(&<P as Projection>::Key, &E, &C) -> std::result::Result<(), BoxError> + Send + Sync>;

pub(crate) enum OnDeleteMiss<P: Projection, E, C> {
    Fail,
    Ignore,
    Custom(DeleteMissFn<P, E, C>),
}

impl<P: Projection, E, C> OnDeleteMiss<P, E, C> {
    fn resolve(&self, key: &P::Key, event: &E, ctx: &C) -> Result<()> {
        match self {
            Self::Fail => Err(ProjectionError::missing_key(key, MissOperation::Delete)),
            Self::Ignore => Ok(()),
            Self::Custom(handle) => handle(key, event, ctx).map_err(ProjectionError::Handler),
        }
    }
}

pub(crate) enum EntityAction<P: Projection, E, C> {
    Create {
        key: KeyFn<P, E, C>,
        mutate: MutateFn<P, E, C>,
        on_duplicate: OnDuplicate<P, E, C>,
    },
    Update {
        key: KeyFn<P, E, C>,
        mutate: MutateFn<P, E, C>,
        on_miss: OnUpdateMiss<P, E, C>,
    },
    Delete {
        key: KeyFn<P, E, C>,
        on_miss: OnDeleteMiss<P, E, C>,
    },
    Custom(CustomFn<P, E, C>),
}

/// Immutable table of create/update/delete actions for one projection type.
pub struct EntityEventMap<P: Projection, E, C> {
    router: EventRouter<E, C, EntityAction<P, E, C>>,
}

impl<P, E, C> EntityEventMap<P, E, C>
where
    P: Projection,
    E: Event,
    C: Send + Sync + 'static,
{
    /// Apply the action selected for `event` through `merge`.
    ///
    /// Returns `true` when an action was selected, even if its own `when`
    /// predicates then declined the event.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::DuplicateKey`] or
    /// [`ProjectionError::MissingKey`] under the default policies, and any
    /// repository or handler error.
    pub async fn handle<R, Ch>(
        &self,
        event: &E,
        ctx: &C,
        merge: &mut ProjectionMerge<'_, P, R, Ch>,
    ) -> Result<bool>
    where
        R: ProjectionRepository<P>,
        Ch: ProjectionCache<P::Key, P>,
    {
        let Some(route) = self.router.route(event, ctx) else {
            tracing::trace!(event_type = event.event_type(), "No route for event");
            return Ok(false);
        };
        if !route.accepts(event, ctx) {
            return Ok(true);
        }

        match route.action() {
            EntityAction::Create {
                key,
                mutate,
                on_duplicate,
            } => {
                if let Some(key) = key(event, ctx) {
                    merge
                        .create(
                            key,
                            |projection| mutate(projection, event, ctx),
                            |existing| on_duplicate.should_overwrite(existing, event, ctx),
                        )
                        .await?;
                }
            }
            EntityAction::Update {
                key,
                mutate,
                on_miss,
            } => {
                if let Some(key) = key(event, ctx) {
                    let missing = key.clone();
                    merge
                        .update(
                            key,
                            |projection| mutate(projection, event, ctx),
                            || on_miss.create_if_missing(&missing, event, ctx),
                        )
                        .await?;
                }
            }
            EntityAction::Delete { key, on_miss } => {
                if let Some(key) = key(event, ctx) {
                    if !merge.delete(&key).await? {
                        on_miss.resolve(&key, event, ctx)?;
                    }
                }
            }
            EntityAction::Custom(action) => action(event, ctx, &mut *merge).await?,
        }
        Ok(true)
    }
}

impl<P: Projection, E, C> fmt::Debug for EntityEventMap<P, E, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityEventMap").field("router", &self.router).finish()
    }
}

/// Builder for [`EntityEventMap`].
pub struct EntityEventMapBuilder<P: Projection, E, C> {
    routing: Routing<E, C, EntityAction<P, E, C>>,
}

impl<P, E, C> Default for EntityEventMapBuilder<P, E, C>
where
    P: Projection,
    E: Event,
    C: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<P, E, C> EntityEventMapBuilder<P, E, C>
where
    P: Projection,
    E: Event,
    C: Send + Sync + 'static,
{
    /// Create an empty builder.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            routing: Routing::new(),
        }
    }

    /// Add a global filter every event must pass before routing.
    pub fn filter(&mut self, predicate: impl Fn(&E, &C) -> bool + Send + Sync + 'static) -> &mut Self {
        self.routing.filters.push(Arc::new(predicate));
        self
    }

    /// Derive runtime type keys with `type_from_event`.
    pub fn with_event_type_from_event(
        &mut self,
        type_from_event: impl Fn(&E) -> String + Send + Sync + 'static,
    ) -> &mut Self {
        self.routing.type_from_event = Some(Arc::new(type_from_event));
        self
    }

    /// Derive registration type keys with `type_from_descriptor`.
    pub fn with_event_type_from_descriptor(
        &mut self,
        type_from_descriptor: impl Fn(&'static str) -> String + Send + Sync + 'static,
    ) -> &mut Self {
        self.routing.type_from_descriptor = Some(Arc::new(type_from_descriptor));
        self
    }

    /// Start mapping the variant `V`.
    pub fn map<V: EventVariant<E>>(&mut self) -> CrudAction<'_, P, E, C, V> {
        CrudAction {
            routing: &mut self.routing,
            predicates: Vec::new(),
            _variant: PhantomData,
        }
    }

    /// Freeze the registrations into an [`EntityEventMap`].
    #[must_use]
    pub fn build(self) -> EntityEventMap<P, E, C> {
        EntityEventMap {
            router: self.routing.into_router(),
        }
    }
}

fn key_fn<P, E, C, V>(key: impl Fn(&V, &C) -> P::Key + Send + Sync + 'static) -> KeyFn<P, E, C>
where
    P: Projection,
    E: Event,
    C: 'static,
    V: EventVariant<E>,
{
    Arc::new(move |event: &E, ctx: &C| V::from_event(event).map(|variant| key(variant, ctx)))
}

fn mutate_fn<P, E, C, V>(mutate: impl Fn(&mut P, &V, &C) + Send + Sync + 'static) -> MutateFn<P, E, C>
where
    P: Projection,
    E: Event,
    C: 'static,
    V: EventVariant<E>,
{
    Arc::new(move |projection: &mut P, event: &E, ctx: &C| {
        if let Some(variant) = V::from_event(event) {
            mutate(projection, variant, ctx);
        }
    })
}

fn custom_fn<P, E, C, F>(action: F) -> CustomFn<P, E, C>
where
    P: Projection,
    F: for<'a> Fn(&'a E, &'a C, &'a mut dyn MergeOps<P>) -> BoxFuture<'a, Result<()>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(action)
}

/// Pending registration of a variant on an entity map.
#[must_use = "the variant is only mapped once an action is chosen"]
pub struct CrudAction<'b, P: Projection, E, C, V> {
    routing: &'b mut Routing<E, C, EntityAction<P, E, C>>,
    predicates: Vec<Predicate<E, C>>,
    _variant: PhantomData<fn() -> V>,
}

impl<'b, P, E, C, V> CrudAction<'b, P, E, C, V>
where
    P: Projection,
    E: Event,
    C: Send + Sync + 'static,
    V: EventVariant<E>,
{
    /// Only apply the action when `predicate` accepts the event.
    pub fn when(mut self, predicate: impl Fn(&V, &C) -> bool + Send + Sync + 'static) -> Self {
        self.predicates.push(variant_predicate::<E, C, V>(predicate));
        self
    }

    /// Create the projection keyed by `key`.
    ///
    /// Fails with [`ProjectionError::DuplicateKey`] when it already exists,
    /// unless another duplicate policy is chosen.
    pub fn as_create_of(
        self,
        key: impl Fn(&V, &C) -> P::Key + Send + Sync + 'static,
    ) -> CreateAction<'b, P, E, C, V> {
        CreateAction {
            routing: self.routing,
            predicates: self.predicates,
            key: key_fn::<P, E, C, V>(key),
            on_duplicate: OnDuplicate::Fail,
            _variant: PhantomData,
        }
    }

    /// Update the projection keyed by `key`.
    ///
    /// Fails with [`ProjectionError::MissingKey`] when it does not exist,
    /// unless another miss policy is chosen.
    pub fn as_update_of(
        self,
        key: impl Fn(&V, &C) -> P::Key + Send + Sync + 'static,
    ) -> UpdateAction<'b, P, E, C, V> {
        UpdateAction {
            routing: self.routing,
            predicates: self.predicates,
            key: key_fn::<P, E, C, V>(key),
            on_miss: OnUpdateMiss::Fail,
            _variant: PhantomData,
        }
    }

    /// Delete the projection keyed by `key`.
    ///
    /// The registration takes effect immediately; the returned value only
    /// adjusts its miss policy.
    pub fn as_delete_of(
        self,
        key: impl Fn(&V, &C) -> P::Key + Send + Sync + 'static,
    ) -> DeleteAction<'b, P, E, C, V> {
        let index = self.routing.registrations.len();
        self.routing.registrations.push(Registration {
            descriptors: vec![V::EVENT_TYPE],
            predicates: self.predicates,
            action: EntityAction::Delete {
                key: key_fn::<P, E, C, V>(key),
                on_miss: OnDeleteMiss::Fail,
            },
        });
        DeleteAction {
            routing: self.routing,
            index,
            _variant: PhantomData,
        }
    }

    /// Run a custom action against the merge scope.
    pub fn apply<F>(self, action: F)
    where
        F: for<'a> Fn(&'a V, &'a C, &'a mut dyn MergeOps<P>) -> BoxFuture<'a, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        let action = custom_fn::<P, E, C, _>(move |event, ctx, merge| match V::from_event(event) {
            Some(variant) => action(variant, ctx, merge),
            None => Box::pin(async { Ok::<(), ProjectionError>(()) }),
        });
        self.routing.registrations.push(Registration {
            descriptors: vec![V::EVENT_TYPE],
            predicates: self.predicates,
            action: EntityAction::Custom(action),
        });
    }
}

/// Pending create registration.
#[must_use = "the create is only registered once `using` is called"]
pub struct CreateAction<'b, P: Projection, E, C, V> {
    routing: &'b mut Routing<E, C, EntityAction<P, E, C>>,
    predicates: Vec<Predicate<E, C>>,
    key: KeyFn<P, E, C>,
    on_duplicate: OnDuplicate<P, E, C>,
    _variant: PhantomData<fn() -> V>,
}

impl<P, E, C, V> CreateAction<'_, P, E, C, V>
where
    P: Projection,
    E: Event,
    C: Send + Sync + 'static,
    V: EventVariant<E>,
{
    /// Leave an existing projection untouched.
    pub fn ignoring_duplicates(mut self) -> Self {
        self.on_duplicate = OnDuplicate::Ignore;
        self
    }

    /// Apply the mutation to an existing projection.
    pub fn overwriting_duplicates(mut self) -> Self {
        self.on_duplicate = OnDuplicate::Overwrite;
        self
    }

    /// Let `decide` choose whether an existing projection is overwritten.
    pub fn handling_duplicates_using(
        mut self,
        decide: impl Fn(&P, &V, &C) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.on_duplicate = OnDuplicate::Custom(Arc::new(move |existing: &P, event: &E, ctx: &C| {
            V::from_event(event).is_some_and(|variant| decide(existing, variant, ctx))
        }));
        self
    }

    /// Register the create with `mutate` filling in the projection.
    pub fn using(self, mutate: impl Fn(&mut P, &V, &C) + Send + Sync + 'static) {
        self.routing.registrations.push(Registration {
            descriptors: vec![V::EVENT_TYPE],
            predicates: self.predicates,
            action: EntityAction::Create {
                key: self.key,
                mutate: mutate_fn::<P, E, C, V>(mutate),
                on_duplicate: self.on_duplicate,
            },
        });
    }
}

/// Pending update registration.
#[must_use = "the update is only registered once `using` is called"]
pub struct UpdateAction<'b, P: Projection, E, C, V> {
    routing: &'b mut Routing<E, C, EntityAction<P, E, C>>,
    predicates: Vec<Predicate<E, C>>,
    key: KeyFn<P, E, C>,
    on_miss: OnUpdateMiss<P, E, C>,
    _variant: PhantomData<fn() -> V>,
}

impl<P, E, C, V> UpdateAction<'_, P, E, C, V>
where
    P: Projection,
    E: Event,
    C: Send + Sync + 'static,
    V: EventVariant<E>,
{
    /// Skip the update when the projection does not exist.
    pub fn ignoring_misses(mut self) -> Self {
        self.on_miss = OnUpdateMiss::Ignore;
        self
    }

    /// Create the projection from its key when it does not exist.
    pub fn creating_if_missing(mut self) -> Self {
        self.on_miss = OnUpdateMiss::Create;
        self
    }

    /// Let `decide` choose whether a missing projection is created.
    pub fn handling_misses_using(
        mut self,
        decide: impl Fn(&P::Key, &V, &C) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.on_miss = OnUpdateMiss::Custom(Arc::new(move |key: &P::Key, event: &E, ctx: &C| {
            V::from_event(event).is_some_and(|variant| decide(key, variant, ctx))
        }));
        self
    }

    /// Register the update with `mutate` applying the change.
    pub fn using(self, mutate: impl Fn(&mut P, &V, &C) + Send + Sync + 'static) {
        self.routing.registrations.push(Registration {
            descriptors: vec![V::EVENT_TYPE],
            predicates: self.predicates,
            action: EntityAction::Update {
                key: self.key,
                mutate: mutate_fn::<P, E, C, V>(mutate),
                on_miss: self.on_miss,
            },
        });
    }
}

/// Registered delete whose miss policy can still be adjusted.
pub struct DeleteAction<'b, P: Projection, E, C, V> {
    routing: &'b mut Routing<E, C, EntityAction<P, E, C>>,
    index: usize,
    _variant: PhantomData<fn() -> V>,
}

impl<P, E, C, V> DeleteAction<'_, P, E, C, V>
where
    P: Projection,
    E: Event,
    C: Send + Sync + 'static,
    V: EventVariant<E>,
{
    fn set_on_miss(&mut self, policy: OnDeleteMiss<P, E, C>) {
        if let Some(Registration {
            action: EntityAction::Delete { on_miss, .. },
            ..
        }) = self.routing.registrations.get_mut(self.index)
        {
            *on_miss = policy;
        }
    }

    /// Treat deleting a missing projection as a no-op.
    pub fn ignoring_misses(mut self) -> Self {
        self.set_on_miss(OnDeleteMiss::Ignore);
        self
    }

    /// Let `handle` resolve a delete of a missing projection.
    pub fn handling_misses_using(
        mut self,
        handle: impl Fn(&P::Key, &V, &C) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.set_on_miss(OnDeleteMiss::Custom(Arc::new(
            move |key: &P::Key, event: &E, ctx: &C| match V::from_event(event) {
                Some(variant) => handle(key, variant, ctx),
                None => Ok(()),
            },
        )));
        self
    }
}
