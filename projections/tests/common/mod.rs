//! Catalog domain shared by the integration tests.

#![allow(dead_code)]

use eventide_core::event::{Event, EventEnvelope, EventVariant, START_OF_LOG};
use eventide_core::projection::{Projection, ProjectionContext};
use eventide_projections::{EntityEventMap, EntityEventMapBuilder};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: u32,
    pub name: String,
    pub price: u32,
    pub last_position: i64,
}

impl Projection for Product {
    type Key = u32;

    fn from_key(id: u32) -> Self {
        Self {
            id,
            name: String::new(),
            price: 0,
            last_position: START_OF_LOG,
        }
    }

    fn key(&self) -> &u32 {
        &self.id
    }
}

pub fn product(id: u32, name: &str) -> Product {
    Product {
        name: name.to_string(),
        ..Product::from_key(id)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProductAdded {
    pub id: u32,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PriceSet {
    pub id: u32,
    pub price: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProductRenamed {
    pub id: u32,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProductRemoved {
    pub id: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CatalogEvent {
    ProductAdded(ProductAdded),
    PriceSet(PriceSet),
    ProductRenamed(ProductRenamed),
    ProductRemoved(ProductRemoved),
}

impl Event for CatalogEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::ProductAdded(_) => ProductAdded::EVENT_TYPE,
            Self::PriceSet(_) => PriceSet::EVENT_TYPE,
            Self::ProductRenamed(_) => ProductRenamed::EVENT_TYPE,
            Self::ProductRemoved(_) => ProductRemoved::EVENT_TYPE,
        }
    }
}

macro_rules! variant {
    ($variant:ident) => {
        impl EventVariant<CatalogEvent> for $variant {
            const EVENT_TYPE: &'static str = stringify!($variant);

            fn from_event(event: &CatalogEvent) -> Option<&Self> {
                match event {
                    CatalogEvent::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

variant!(ProductAdded);
variant!(PriceSet);
variant!(ProductRenamed);
variant!(ProductRemoved);

pub fn added(id: u32, name: &str) -> CatalogEvent {
    CatalogEvent::ProductAdded(ProductAdded {
        id,
        name: name.to_string(),
    })
}

pub fn priced(id: u32, price: u32) -> CatalogEvent {
    CatalogEvent::PriceSet(PriceSet { id, price })
}

pub fn renamed(id: u32, name: &str) -> CatalogEvent {
    CatalogEvent::ProductRenamed(ProductRenamed {
        id,
        name: name.to_string(),
    })
}

pub fn removed(id: u32) -> CatalogEvent {
    CatalogEvent::ProductRemoved(ProductRemoved { id })
}

/// Envelopes at consecutive positions starting at `first`.
pub fn envelopes(first: i64, events: Vec<CatalogEvent>) -> Vec<EventEnvelope<CatalogEvent>> {
    events
        .into_iter()
        .zip(first..)
        .map(|(event, position)| EventEnvelope::new(position, "catalog", event))
        .collect()
}

pub type CatalogBuilder = EntityEventMapBuilder<Product, CatalogEvent, ProjectionContext>;

/// Registers the strict catalog mapping on `builder`.
pub fn register_catalog(builder: &mut CatalogBuilder) {
    builder
        .map::<ProductAdded>()
        .as_create_of(|event, _| event.id)
        .using(|product, event, ctx| {
            product.name.clone_from(&event.name);
            product.last_position = ctx.position;
        });
    builder
        .map::<PriceSet>()
        .as_update_of(|event, _| event.id)
        .using(|product, event, ctx| {
            product.price = event.price;
            product.last_position = ctx.position;
        });
    builder.map::<ProductRemoved>().as_delete_of(|event, _| event.id);
}

/// Strict mapping: duplicates and misses fail.
pub fn catalog_map() -> EntityEventMap<Product, CatalogEvent, ProjectionContext> {
    let mut builder = CatalogBuilder::new();
    register_catalog(&mut builder);
    builder.build()
}

/// Lenient mapping: duplicates and misses are ignored.
pub fn lenient_catalog_map() -> EntityEventMap<Product, CatalogEvent, ProjectionContext> {
    let mut builder = CatalogBuilder::new();
    builder
        .map::<ProductAdded>()
        .as_create_of(|event, _| event.id)
        .ignoring_duplicates()
        .using(|product, event, _| product.name.clone_from(&event.name));
    builder
        .map::<PriceSet>()
        .as_update_of(|event, _| event.id)
        .ignoring_misses()
        .using(|product, event, _| product.price = event.price);
    builder
        .map::<ProductRemoved>()
        .as_delete_of(|event, _| event.id)
        .ignoring_misses();
    builder.build()
}
